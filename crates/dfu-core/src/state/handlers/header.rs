//! Upgrade header handler.

use tracing::{info, warn};

use crate::checkpoint::{CheckpointStore, PartitionsState, ResumePoint};
use crate::error::DfuError;
use crate::events::{DfuEvent, DfuObserver};
use crate::protocol::{SigningMode, UpgradeHeader, header::variant_tag};
use crate::storage::PartitionDriver;
use crate::verify::ImageVerifier;

use super::{HandleResult, HandlerContext};

/// Validate the upgrade header against the running firmware.
///
/// Nothing is persisted unless every check passes.
pub fn handle_header<D, S, V, O>(
    data: &[u8],
    ctx: &mut HandlerContext<'_, D, S, V, O>,
) -> Result<HandleResult, DfuError>
where
    D: PartitionDriver + ?Sized,
    S: CheckpointStore + ?Sized,
    V: ImageVerifier + ?Sized,
    O: DfuObserver + ?Sized,
{
    let header = UpgradeHeader::from_bytes(data).map_err(|e| {
        warn!(error = %e, "Malformed upgrade header");
        DfuError::BadLengthUpgradeHeader { length: data.len() }
    })?;

    let device = &ctx.config.device_variant;
    if !device.is_empty() && header.variant != variant_tag(device) {
        return Err(DfuError::WrongVariant {
            image: header.variant_str(),
            device: device.clone(),
        });
    }

    let running = ctx.config.running_version;
    if !header
        .compatible_versions
        .iter()
        .any(|entry| entry.admits(running))
    {
        return Err(DfuError::IncompatibleVersion {
            major: running.major,
            minor: running.minor,
        });
    }

    let running_ps = ctx.config.running_config_version;
    if running_ps != header.ps_config_version
        && !header.compatible_ps_configs.contains(&running_ps)
    {
        return Err(DfuError::IncompatiblePsConfig {
            running: running_ps,
        });
    }

    let signing_mode = SigningMode::from_byte(header.signing_mode)?;

    ctx.checkpoint.version_in_progress = Some(header.version);
    ctx.checkpoint.config_version_in_progress = Some(header.ps_config_version);
    ctx.checkpoint.partitions_state = PartitionsState::Upgrading;
    ctx.checkpoint.resume_point = ResumePoint::Transfer;
    ctx.save_checkpoint()?;

    ctx.mirror(data)?;

    ctx.state.signing_mode = signing_mode;
    ctx.state.header_seen = true;

    info!(
        variant = %header.variant_str(),
        version = %header.version,
        ps_config = header.ps_config_version,
        signing = %signing_mode,
        "Upgrade header accepted"
    );
    ctx.emit(DfuEvent::HeaderAccepted {
        variant: header.variant_str(),
        version: header.version.to_string(),
        signing_mode: signing_mode.to_string(),
    });

    Ok(HandleResult::Request(ctx.state.request_next_section(0)))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;
    use crate::error::ErrorClass;
    use crate::protocol::{Version, WILDCARD_MINOR};
    use crate::state::machine::ParserState;
    use crate::transport::DataRequest;

    fn header(compatible: Vec<Version>, ps: u16, ps_compatible: Vec<u16>) -> Vec<u8> {
        UpgradeHeader {
            variant: variant_tag("QCC514X"),
            version: Version::new(2, 0),
            compatible_versions: compatible,
            ps_config_version: ps,
            compatible_ps_configs: ps_compatible,
            signing_mode: 1,
        }
        .to_bytes()
    }

    fn fixture() -> Fixture {
        let mut fx = Fixture::new();
        fx.config.device_variant = "QCC514X".into();
        fx.config.running_version = Version::new(1, 5);
        fx.config.running_config_version = 3;
        fx
    }

    fn feed_header(fx: &mut Fixture, body: &[u8]) -> Result<HandleResult, DfuError> {
        fx.expect(ParserState::Header, body.len() as u32);
        fx.feed(body)
    }

    #[test]
    fn test_compatible_header_accepted() {
        let mut fx = fixture();
        let body = header(vec![Version::new(1, 5)], 3, vec![]);
        let result = feed_header(&mut fx, &body).unwrap();

        assert_eq!(result, HandleResult::Request(DataRequest::new(12, 0)));
        assert_eq!(fx.state.state, ParserState::Generic);
        assert!(fx.state.header_seen);
        assert_eq!(fx.state.signing_mode, SigningMode::Rsa2048);

        let saved = fx.store.snapshot();
        assert_eq!(saved.version_in_progress, Some(Version::new(2, 0)));
        assert_eq!(saved.config_version_in_progress, Some(3));
        assert_eq!(saved.partitions_state, PartitionsState::Upgrading);
        assert_eq!(saved.resume_point, ResumePoint::Transfer);
        assert_eq!(fx.store.read_slot(0).unwrap().len(), body.len());
    }

    #[test]
    fn test_wildcard_minor_accepted() {
        let mut fx = fixture();
        let body = header(vec![Version::new(1, WILDCARD_MINOR)], 3, vec![]);
        assert!(feed_header(&mut fx, &body).is_ok());
    }

    #[test]
    fn test_no_compatible_version_is_policy() {
        for entries in [vec![], vec![Version::new(1, 4)], vec![Version::new(2, WILDCARD_MINOR)]] {
            let mut fx = fixture();
            let body = header(entries, 3, vec![]);
            let err = feed_header(&mut fx, &body).unwrap_err();
            assert!(matches!(err, DfuError::IncompatibleVersion { major: 1, minor: 5 }));
            assert_eq!(err.class(), ErrorClass::Policy);
            assert_eq!(fx.store.save_count(), 0);
            assert_eq!(fx.driver.open_count(), 0);
        }
    }

    #[test]
    fn test_ps_config_check() {
        // Same PS version: list not consulted.
        let mut fx = fixture();
        assert!(feed_header(&mut fx, &header(vec![Version::new(1, 5)], 3, vec![])).is_ok());

        let mut fx = fixture();
        assert!(feed_header(&mut fx, &header(vec![Version::new(1, 5)], 4, vec![2, 3])).is_ok());

        let mut fx = fixture();
        let err = feed_header(&mut fx, &header(vec![Version::new(1, 5)], 4, vec![2])).unwrap_err();
        assert!(matches!(err, DfuError::IncompatiblePsConfig { running: 3 }));
        assert_eq!(err.class(), ErrorClass::Policy);
    }

    #[test]
    fn test_wrong_variant() {
        let mut fx = fixture();
        fx.config.device_variant = "QCC512X".into();
        let err = feed_header(&mut fx, &header(vec![Version::new(1, 5)], 3, vec![])).unwrap_err();
        assert!(matches!(err, DfuError::WrongVariant { .. }));
    }

    #[test]
    fn test_empty_device_variant_accepts_any() {
        let mut fx = fixture();
        fx.config.device_variant.clear();
        assert!(feed_header(&mut fx, &header(vec![Version::new(1, 5)], 3, vec![])).is_ok());
    }

    #[test]
    fn test_bad_signing_mode() {
        let mut fx = fixture();
        let mut body = header(vec![Version::new(1, 5)], 3, vec![]);
        *body.last_mut().unwrap() = 9;
        assert!(matches!(
            feed_header(&mut fx, &body),
            Err(DfuError::UnknownSigningMode(9))
        ));
        assert_eq!(fx.store.save_count(), 0);
    }

    #[test]
    fn test_length_mismatch() {
        let mut fx = fixture();
        let mut body = header(vec![Version::new(1, 5)], 3, vec![]);
        body.push(0);
        assert!(matches!(
            feed_header(&mut fx, &body),
            Err(DfuError::BadLengthUpgradeHeader { .. })
        ));
    }
}
