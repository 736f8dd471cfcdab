//! Footer handler: signature collection and final verification.

use tracing::{error, info};

use crate::checkpoint::{CheckpointStore, ResumePoint};
use crate::error::DfuError;
use crate::events::{DfuEvent, DfuObserver};
use crate::state::machine::ParserState;
use crate::storage::PartitionDriver;
use crate::verify::{ImageHasher, ImageVerifier};

use super::{HandleResult, HandlerContext};

/// Accumulate the signature; verify the image once it is whole.
pub fn handle_footer<D, S, V, O>(
    data: &[u8],
    request_complete: bool,
    ctx: &mut HandlerContext<'_, D, S, V, O>,
) -> Result<HandleResult, DfuError>
where
    D: PartitionDriver + ?Sized,
    S: CheckpointStore + ?Sized,
    V: ImageVerifier + ?Sized,
    O: DfuObserver + ?Sized,
{
    ctx.state.signature.extend_from_slice(data);
    if !request_complete {
        return Ok(HandleResult::AwaitMore);
    }

    let mode = ctx.state.signing_mode;
    let expected = mode.signature_size();
    if ctx.state.signature.len() != expected {
        return Err(DfuError::BadLengthSignature {
            expected,
            actual: ctx.state.signature.len(),
        });
    }

    let mut hasher = ImageHasher::new();
    for &partition in &ctx.state.image_partitions {
        hasher.update(partition, &ctx.driver.read(partition)?);
    }
    let digest = hasher.finalize();
    let signature = std::mem::take(&mut ctx.state.signature);

    if let Err(e) = ctx.verifier.verify(mode, &digest, &signature) {
        error!(error = %e, "Image verification failed");
        ctx.checkpoint.resume_point = ResumePoint::Error;
        if let Err(save) = ctx.save_checkpoint() {
            error!(error = %save, "Failed to record verification failure");
        }
        return Err(DfuError::VerificationFailed(e.to_string()));
    }

    ctx.checkpoint.resume_point = ResumePoint::Verified;
    ctx.save_checkpoint()?;

    info!(
        partitions = ctx.state.image_partitions.len(),
        mode = %mode,
        "Image verified"
    );
    ctx.state.goto_state(ParserState::Complete);
    ctx.emit(DfuEvent::Complete);
    Ok(HandleResult::TransferComplete)
}
