//! DFU session - high-level orchestrator over files on disk.
//!
//! Wires the file-backed partition driver and checkpoint store, the digest
//! verifier and a file image source into an [`UpgradeSession`] and drives it
//! to completion.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::mirror::read_mirror;
use crate::checkpoint::{
    CheckpointStore, FileCheckpointStore, PersistedCheckpoint, replay_headers,
};
use crate::engine::{EngineConfig, Start, UpgradeSession};
use crate::events::{DfuObserver, TracingObserver};
use crate::protocol::DEFAULT_HEADER_SLOTS;
use crate::state::HandleResult;
use crate::storage::{FilePartitions, PartitionDriver};
use crate::transport::{DataRequest, FileSource, ImageSource};
use crate::verify::{DigestVerifier, ImageVerifier};

/// Capacity override for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub number: u16,
    pub capacity: u32,
}

/// Configuration for a DFU session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path to the upgrade image.
    pub image_path: Option<String>,
    /// Directory holding one file per partition.
    pub partition_dir: String,
    /// Checkpoint file.
    pub checkpoint_path: String,
    /// Largest delivery handed to the engine.
    pub fragment_size: usize,
    /// Capacity of partitions without an override.
    pub default_capacity: u32,
    pub header_slots: usize,
    pub partitions: Vec<PartitionSpec>,
    /// Erase poll interval in milliseconds.
    pub erase_poll_ms: u64,
    /// Give up on a pending erase after this many seconds.
    pub erase_timeout_secs: u64,
    pub engine: EngineConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            image_path: None,
            partition_dir: "partitions".to_string(),
            checkpoint_path: "dfu-checkpoint.toml".to_string(),
            fragment_size: 512,
            default_capacity: 1 << 20,
            header_slots: DEFAULT_HEADER_SLOTS,
            partitions: Vec::new(),
            erase_poll_ms: 100,
            erase_timeout_secs: 60,
            engine: EngineConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Where a persisted upgrade stands, as seen from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub checkpoint: PersistedCheckpoint,
    /// Image offset a resumed transfer would start from, if headers are mirrored.
    pub resume_offset: Option<u32>,
    /// Partitions recorded as complete in the header mirror.
    pub completed: Vec<u16>,
}

/// Poll a pending erase until it finishes or `timeout` passes.
fn wait_for_erase<D, S, V, O>(
    engine: &mut UpgradeSession<D, S, V, O>,
    poll: Duration,
    timeout: Duration,
) -> Result<DataRequest>
where
    D: PartitionDriver,
    S: CheckpointStore,
    V: ImageVerifier,
    O: DfuObserver,
{
    info!("Waiting for erase...");
    let start = Instant::now();
    let mut poll_count = 0u64;

    loop {
        poll_count += 1;
        if let Some(request) = engine.poll_erase()? {
            debug!("Erase finished after {} polls", poll_count);
            return Ok(request);
        }
        if start.elapsed() > timeout {
            engine.abort();
            return Err(anyhow!(
                "Timeout waiting for erase after {}s",
                timeout.as_secs()
            ));
        }
        thread::sleep(poll);
    }
}

/// Run one engine against one source until the image is complete.
pub fn drive<D, S, V, O, I>(
    engine: &mut UpgradeSession<D, S, V, O>,
    source: &mut I,
    erase_poll: Duration,
    erase_timeout: Duration,
) -> Result<()>
where
    D: PartitionDriver,
    S: CheckpointStore,
    V: ImageVerifier,
    O: DfuObserver,
    I: ImageSource + ?Sized,
{
    let request = match engine.start()? {
        Start::Ready(request) => request,
        Start::WaitForErase => wait_for_erase(engine, erase_poll, erase_timeout)?,
    };
    source.request(request)?;

    loop {
        let Some(delivery) = source.next_delivery()? else {
            engine.abort();
            bail!("Image source ran dry with a request outstanding");
        };
        match engine.handle_delivery(&delivery)? {
            HandleResult::Request(next) => source.request(next)?,
            HandleResult::AwaitMore => {}
            HandleResult::TransferComplete => return Ok(()),
        }
    }
}

/// DFU session - ingests one image file into partition files.
pub struct DfuSession<O: DfuObserver> {
    config: SessionConfig,
    observer: Arc<O>,
}

impl DfuSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: DfuObserver> DfuSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        Self { config, observer }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn open_partitions(&self) -> Result<FilePartitions> {
        let mut driver = FilePartitions::new(&self.config.partition_dir, self.config.default_capacity)
            .with_context(|| format!("opening partition dir {}", self.config.partition_dir))?;
        for spec in &self.config.partitions {
            driver = driver.with_capacity(spec.number, spec.capacity);
        }
        Ok(driver)
    }

    fn open_store(&self) -> Result<FileCheckpointStore> {
        FileCheckpointStore::open(&self.config.checkpoint_path, self.config.header_slots)
            .with_context(|| format!("opening checkpoint {}", self.config.checkpoint_path))
    }

    fn engine(&self) -> Result<UpgradeSession<FilePartitions, FileCheckpointStore, DigestVerifier, O>> {
        Ok(UpgradeSession::with_observer(
            self.open_partitions()?,
            self.open_store()?,
            DigestVerifier,
            self.config.engine.clone(),
            self.observer.clone(),
        ))
    }

    /// Run the complete session. Returns the final checkpoint.
    #[instrument(skip(self))]
    pub fn run(&mut self) -> Result<PersistedCheckpoint> {
        let path = self
            .config
            .image_path
            .clone()
            .ok_or_else(|| anyhow!("No image path configured"))?;
        info!(path = %path, "Loading image");
        let mut source = FileSource::open(&path, self.config.fragment_size)
            .with_context(|| format!("opening image {}", path))?;
        if let Some(len) = source.total_len() {
            debug!(len, "Image size");
        }

        let mut engine = self.engine()?;
        drive(
            &mut engine,
            &mut source,
            Duration::from_millis(self.config.erase_poll_ms),
            Duration::from_secs(self.config.erase_timeout_secs),
        )?;

        info!(
            partitions = ?engine.state().image_partitions,
            "Image ingested and verified"
        );
        Ok(engine.checkpoint().clone())
    }

    /// Inspect the persisted checkpoint without touching partitions.
    pub fn status(&self) -> Result<SessionStatus> {
        let store = self.open_store()?;
        let checkpoint = store.load()?;
        let mirror = read_mirror(&store)?;
        let replay = replay_headers(&mirror, checkpoint.last_closed_partition);
        if replay.is_none() && checkpoint.can_resume() {
            warn!("Checkpoint is resumable but no header mirror is stored");
        }
        Ok(SessionStatus {
            checkpoint,
            resume_offset: replay.as_ref().map(|r| r.file_offset),
            completed: replay.map(|r| r.completed).unwrap_or_default(),
        })
    }

    /// Forget any upgrade in progress.
    pub fn abandon(&self) -> Result<()> {
        let mut engine = self.engine()?;
        engine.abandon()?;
        Ok(())
    }

    /// Path of the file holding partition `partition`.
    pub fn partition_path(&self, partition: u16) -> PathBuf {
        PathBuf::from(&self.config.partition_dir).join(format!("partition_{}.bin", partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{MemoryCheckpointStore, ResumePoint};
    use crate::error::DfuError;
    use crate::protocol::{ImageBuilder, SigningMode, UpgradeHeader, Version, variant_tag};
    use crate::storage::{EraseMode, MemoryPartitions};
    use crate::transport::{ScriptedSource, SliceSource};
    use crate::verify::RecordingVerifier;

    fn builder() -> ImageBuilder {
        let header = UpgradeHeader {
            variant: variant_tag("QCC514X"),
            version: Version::new(3, 1),
            compatible_versions: vec![Version::new(3, 0)],
            ps_config_version: 1,
            compatible_ps_configs: vec![],
            signing_mode: SigningMode::Rsa1024.to_byte(),
        };
        ImageBuilder::new(header)
            .partition(0, vec![0x11; 128])
            .partition(1, vec![0x22; 2048])
            .partition(3, vec![0x33; 12])
    }

    fn engine_config() -> EngineConfig {
        EngineConfig {
            device_variant: "QCC514X".into(),
            running_version: Version::new(3, 0),
            running_config_version: 1,
            ..Default::default()
        }
    }

    fn session_config(dir: &std::path::Path, image: &[u8]) -> SessionConfig {
        let image_path = dir.join("image.bin");
        std::fs::write(&image_path, image).unwrap();
        SessionConfig {
            image_path: Some(image_path.to_string_lossy().into_owned()),
            partition_dir: dir.join("parts").to_string_lossy().into_owned(),
            checkpoint_path: dir.join("checkpoint.toml").to_string_lossy().into_owned(),
            fragment_size: 100,
            engine: engine_config(),
            ..Default::default()
        }
    }

    #[test]
    fn test_run_writes_partition_files() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder();
        let mut session = DfuSession::new(session_config(dir.path(), &builder.build()));

        let checkpoint = session.run().unwrap();
        assert_eq!(checkpoint.resume_point, ResumePoint::Verified);

        for part in builder.partitions() {
            let written = std::fs::read(session.partition_path(part.partition)).unwrap();
            assert_eq!(written, part.content);
        }

        let status = session.status().unwrap();
        assert_eq!(status.checkpoint.resume_point, ResumePoint::Verified);
        assert_eq!(status.completed, vec![0, 1, 3]);
    }

    #[test]
    fn test_abandon_clears_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = DfuSession::new(session_config(dir.path(), &builder().build()));
        session.run().unwrap();

        session.abandon().unwrap();
        let status = session.status().unwrap();
        assert_eq!(status.checkpoint, PersistedCheckpoint::default());
        assert_eq!(status.resume_offset, None);
    }

    #[test]
    fn test_capacity_override_rejects_partition() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = session_config(dir.path(), &builder().build());
        config.partitions.push(PartitionSpec {
            number: 1,
            capacity: 1024,
        });

        let err = DfuSession::new(config).run().unwrap_err();
        let dfu = err.downcast_ref::<DfuError>().unwrap();
        assert!(matches!(
            dfu,
            DfuError::PartitionSizeMismatch {
                partition: 1,
                required: 2048,
                capacity: 1024
            }
        ));
    }

    #[test]
    fn test_missing_image_path() {
        let mut session = DfuSession::new(SessionConfig::default());
        assert!(session.run().is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dfu.toml");
        let mut config = session_config(dir.path(), &builder().build());
        config.partitions.push(PartitionSpec {
            number: 2,
            capacity: 4096,
        });
        config.save_to_file(&path).unwrap();

        let loaded = SessionConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.partitions, config.partitions);
        assert_eq!(loaded.engine, config.engine);
        assert_eq!(loaded.fragment_size, 100);
    }

    #[test]
    fn test_drive_waits_for_deferred_erase() {
        let driver = MemoryPartitions::new();
        driver.set_erase_mode(EraseMode::Deferred);
        let eraser = driver.clone();
        let finisher = thread::spawn(move || {
            while eraser.erase_count() == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            eraser.finish_erase(true);
        });
        let mut engine = UpgradeSession::new(
            driver,
            MemoryCheckpointStore::new(),
            RecordingVerifier::new(),
            engine_config(),
        );
        let mut source = SliceSource::from_bytes(builder().build(), 64);

        drive(
            &mut engine,
            &mut source,
            Duration::from_millis(1),
            Duration::from_secs(5),
        )
        .unwrap();
        finisher.join().unwrap();
        assert!(engine.is_complete());
    }

    #[test]
    fn test_drive_erase_timeout() {
        let driver = MemoryPartitions::new();
        driver.set_erase_mode(EraseMode::Deferred);
        let mut engine = UpgradeSession::new(
            driver,
            MemoryCheckpointStore::new(),
            RecordingVerifier::new(),
            engine_config(),
        );
        let mut source = SliceSource::from_bytes(builder().build(), 64);

        let err = drive(&mut engine, &mut source, Duration::from_millis(1), Duration::ZERO);
        assert!(err.is_err());
    }

    #[test]
    fn test_drive_reports_disconnect() {
        let mut engine = UpgradeSession::new(
            MemoryPartitions::new(),
            MemoryCheckpointStore::new(),
            RecordingVerifier::new(),
            engine_config(),
        );
        let mut source = ScriptedSource::new();
        source.disconnect();

        let err = drive(&mut engine, &mut source, Duration::ZERO, Duration::ZERO).unwrap_err();
        assert!(err.to_string().contains("disconnected"));
    }
}
