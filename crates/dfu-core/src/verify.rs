//! Final image verification.
//!
//! After the footer arrives, the engine reads back every partition carried
//! by the image, hashes them in image order and hands the digest and the
//! footer signature to an `ImageVerifier`. Real devices plug their
//! asymmetric verifier in here; `DigestVerifier` accepts bench images whose
//! "signature" is the zero-padded digest itself.

use std::sync::{Arc, Mutex, MutexGuard};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::protocol::SigningMode;

pub type ImageDigest = [u8; 32];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Signature length {actual} does not match {mode} ({expected} bytes)")]
    BadLength {
        mode: SigningMode,
        expected: usize,
        actual: usize,
    },
    #[error("Signature does not match image digest")]
    Mismatch,
    #[error("Verifier unavailable: {0}")]
    Unavailable(String),
}

/// Checks the footer signature against the image digest.
pub trait ImageVerifier: Send + Sync {
    fn verify(
        &self,
        mode: SigningMode,
        digest: &ImageDigest,
        signature: &[u8],
    ) -> Result<(), VerifyError>;
}

/// Running SHA-256 over partitions in image order.
#[derive(Clone, Default)]
pub struct ImageHasher {
    hasher: Sha256,
}

impl ImageHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash one partition: its number, then its content with the first word.
    pub fn update(&mut self, partition: u16, content: &[u8]) {
        self.hasher.update(partition.to_be_bytes());
        self.hasher.update(content);
    }

    pub fn finalize(self) -> ImageDigest {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&self.hasher.finalize());
        digest
    }
}

pub fn image_digest<'a>(partitions: impl IntoIterator<Item = (u16, &'a [u8])>) -> ImageDigest {
    let mut hasher = ImageHasher::new();
    for (partition, content) in partitions {
        hasher.update(partition, content);
    }
    hasher.finalize()
}

/// Bench signature: the image digest zero-padded to the mode's signature size.
pub fn bench_signature<'a>(
    mode: SigningMode,
    partitions: impl IntoIterator<Item = (u16, &'a [u8])>,
) -> Vec<u8> {
    let mut signature = image_digest(partitions).to_vec();
    signature.resize(mode.signature_size(), 0);
    signature
}

/// Accepts bench signatures produced by `bench_signature`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestVerifier;

impl ImageVerifier for DigestVerifier {
    fn verify(
        &self,
        mode: SigningMode,
        digest: &ImageDigest,
        signature: &[u8],
    ) -> Result<(), VerifyError> {
        let expected = mode.signature_size();
        if signature.len() != expected {
            return Err(VerifyError::BadLength {
                mode,
                expected,
                actual: signature.len(),
            });
        }
        let (head, padding) = signature.split_at(digest.len());
        if head != digest || padding.iter().any(|b| *b != 0) {
            return Err(VerifyError::Mismatch);
        }
        Ok(())
    }
}

/// One call seen by `RecordingVerifier`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyCall {
    pub mode: SigningMode,
    pub digest: ImageDigest,
    pub signature: Vec<u8>,
}

/// Mock verifier that records calls and returns a configurable verdict.
#[derive(Debug, Clone, Default)]
pub struct RecordingVerifier {
    calls: Arc<Mutex<Vec<VerifyCall>>>,
    reject: Arc<Mutex<bool>>,
}

impl RecordingVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn calls_lock(&self) -> MutexGuard<'_, Vec<VerifyCall>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reject(&self, reject: bool) {
        *self.reject.lock().unwrap_or_else(|e| e.into_inner()) = reject;
    }

    pub fn calls(&self) -> Vec<VerifyCall> {
        self.calls_lock().clone()
    }
}

impl ImageVerifier for RecordingVerifier {
    fn verify(
        &self,
        mode: SigningMode,
        digest: &ImageDigest,
        signature: &[u8],
    ) -> Result<(), VerifyError> {
        self.calls_lock().push(VerifyCall {
            mode,
            digest: *digest,
            signature: signature.to_vec(),
        });
        if *self.reject.lock().unwrap_or_else(|e| e.into_inner()) {
            Err(VerifyError::Mismatch)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bench_signature_verifies() {
        let parts: [(u16, &[u8]); 2] = [(1, b"abcd"), (5, b"efgh1234")];
        let signature = bench_signature(SigningMode::Rsa1024, parts);
        assert_eq!(signature.len(), 128);

        let digest = image_digest(parts);
        assert!(DigestVerifier.verify(SigningMode::Rsa1024, &digest, &signature).is_ok());
        assert_eq!(
            DigestVerifier.verify(SigningMode::Rsa2048, &digest, &signature),
            Err(VerifyError::BadLength {
                mode: SigningMode::Rsa2048,
                expected: 256,
                actual: 128
            })
        );
    }

    #[test]
    fn test_digest_depends_on_order() {
        let a = image_digest([(1u16, &b"x"[..]), (2, &b"y"[..])]);
        let b = image_digest([(2u16, &b"y"[..]), (1, &b"x"[..])]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let parts: [(u16, &[u8]); 1] = [(1, b"abcd")];
        let mut signature = bench_signature(SigningMode::Rsa1024, parts);
        signature[127] = 1;
        let digest = image_digest(parts);
        assert_eq!(
            DigestVerifier.verify(SigningMode::Rsa1024, &digest, &signature),
            Err(VerifyError::Mismatch)
        );
    }

    #[test]
    fn test_recording_verifier() {
        let verifier = RecordingVerifier::new();
        let digest = [7u8; 32];
        assert!(verifier.verify(SigningMode::Rsa2048, &digest, &[0; 256]).is_ok());
        verifier.reject(true);
        assert!(verifier.verify(SigningMode::Rsa2048, &digest, &[0; 256]).is_err());
        assert_eq!(verifier.calls().len(), 2);
        assert_eq!(verifier.calls()[0].digest, digest);
    }
}
