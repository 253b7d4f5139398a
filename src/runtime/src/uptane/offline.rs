//! Offline-update metadata: loading and basic validation.
//!
//! Signatures are not verified here; the device does that when it installs
//! the lockbox.

use std::path::Path;

use chrono::{DateTime, Utc};
use lockbox_core::error::{LockboxError, Result};

use super::metadata::{
    parse_targets, ParseAs, SignedMetadata, Target, DEFAULT_METADATA_MAXLEN,
    TARGETS_METADATA_MAXLEN,
};

pub const OFFLINE_SNAPSHOT_FILE: &str = "offline-snapshot.json";
pub const OFFLINE_SNAPSHOT_TYPE: &str = "Offline-Snapshot";
pub const OFFLINE_TARGETS_TYPE: &str = "Offline-Updates";

/// Offline-targets document plus its snapshot, as stored in the director
/// metadata directory.
#[derive(Debug, Clone)]
pub struct OfflineMetadata {
    pub targets: SignedMetadata,
    pub snapshot: SignedMetadata,
}

impl OfflineMetadata {
    /// Load `<lockbox_name>.json` and `offline-snapshot.json` from
    /// `source_dir`.
    pub fn load(lockbox_name: &str, source_dir: &Path) -> Result<Self> {
        let targets = SignedMetadata::load(
            &source_dir.join(format!("{}.json", lockbox_name)),
            ParseAs::Json,
            TARGETS_METADATA_MAXLEN,
        )?;
        let snapshot = SignedMetadata::load(
            &source_dir.join(OFFLINE_SNAPSHOT_FILE),
            ParseAs::Json,
            DEFAULT_METADATA_MAXLEN,
        )?;
        Ok(Self { targets, snapshot })
    }

    /// Targets of the offline update in declared order.
    pub fn targets(&self) -> Result<Vec<(String, Target)>> {
        parse_targets(self.targets.signed())
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        validate_offline_metadata(&self.targets, &self.snapshot, now)
    }
}

fn ensure(cond: bool, message: impl FnOnce() -> String) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(LockboxError::InvalidData(message()))
    }
}

fn not_expired(meta: &SignedMetadata, what: &str, now: DateTime<Utc>) -> Result<()> {
    let expires = meta.expires().ok_or_else(|| {
        LockboxError::InvalidData(format!("{} metadata has no expiry", what))
    })?;
    let expires = DateTime::parse_from_rfc3339(expires).map_err(|e| {
        LockboxError::InvalidData(format!(
            "{} metadata has an invalid expiry '{}': {}",
            what, expires, e
        ))
    })?;
    ensure(expires.with_timezone(&Utc) > now, || {
        format!("{} metadata is already expired", what)
    })
}

/// Check types, expiry and the snapshot's record of the targets file.
///
/// The snapshot's hash of the targets file is not compared: the server
/// computes it over canonical JSON, which does not match the bytes served.
pub fn validate_offline_metadata(
    targets: &SignedMetadata,
    snapshot: &SignedMetadata,
    now: DateTime<Utc>,
) -> Result<()> {
    tracing::debug!("Validating offline-update metadata");

    ensure(snapshot.meta_type() == Some(OFFLINE_SNAPSHOT_TYPE), || {
        format!("_type in snapshot metadata does not equal '{}'", OFFLINE_SNAPSHOT_TYPE)
    })?;
    not_expired(snapshot, "Offline snapshot", now)?;

    ensure(targets.meta_type() == Some(OFFLINE_TARGETS_TYPE), || {
        format!("_type in targets metadata does not equal '{}'", OFFLINE_TARGETS_TYPE)
    })?;
    not_expired(targets, "Offline targets", now)?;

    let targets_file = targets.file_name();
    let entry = &snapshot.signed()["meta"][targets_file.as_str()];
    ensure(entry.is_object(), || {
        format!("{} is not described in the snapshot metadata", targets_file)
    })?;
    ensure(entry["length"].as_u64() == Some(targets.size), || {
        format!("{} does not have the expected size", targets_file)
    })?;
    ensure(
        entry["version"].as_u64().is_some() && entry["version"].as_u64() == targets.version(),
        || format!("{} does not have the expected version", targets_file),
    )?;

    tracing::info!("Offline-update metadata passed basic validation");
    Ok(())
}
