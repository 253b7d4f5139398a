//! Acquisition of director and image-repository metadata from the OTA server.

use std::path::{Path, PathBuf};

use lockbox_core::error::{LockboxError, Result};

use super::metadata::{FetchOptions, MetadataStore, ParseAs, UNSAFE_FILENAME_CHARS};
use super::offline::OFFLINE_SNAPSHOT_FILE;
use crate::http::join_url;

const ROOT_FILE: &str = "root.json";
const SNAPSHOT_FILE: &str = "snapshot.json";
const WELL_KNOWN_METADATA: &[&str] = &["targets.json"];
const JSON_EXT: &str = ".json";

const DIRECTOR_REPO_PATH: &str = "api/v1/admin/repo";
const IMAGE_REPO_PATH: &str = "api/v1/user_repo";

/// Names that clash with director metadata files.
pub const RESERVED_LOCKBOX_NAMES: &[&str] =
    &["root", "snapshot", "targets", "timestamp", "offline-snapshot"];

/// Where the offline-targets document of a lockbox comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockboxSource {
    /// Fetched from the director by name
    Server { name: String },
    /// A local `<name>.json` file, with `offline-snapshot.json` next to it
    Local { name: String, path: PathBuf },
}

impl LockboxSource {
    /// Interpret a lockbox argument: a `.json` path is local, anything else
    /// is a server-side name. The resulting name is checked against the
    /// reserved and unsafe-character rules.
    pub fn parse(lockbox: &str) -> Result<Self> {
        let source = match lockbox.strip_suffix(JSON_EXT) {
            Some(stem) => {
                let name = Path::new(stem)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Self::Local {
                    name,
                    path: PathBuf::from(lockbox),
                }
            }
            None => Self::Server {
                name: lockbox.to_string(),
            },
        };

        let name = source.name();
        if name.is_empty() {
            return Err(LockboxError::InvalidArgument(
                "Lockbox name must not be empty".to_string(),
            ));
        }
        if RESERVED_LOCKBOX_NAMES.contains(&name.to_lowercase().as_str()) {
            return Err(LockboxError::InvalidArgument(format!(
                "Lockbox name '{}' is reserved and cannot be used",
                name
            )));
        }
        if name.chars().any(|c| UNSAFE_FILENAME_CHARS.contains(&c)) {
            return Err(LockboxError::InvalidArgument(format!(
                "Lockbox name '{}' contains disallowed characters",
                name
            )));
        }
        Ok(source)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Server { name } | Self::Local { name, .. } => name,
        }
    }

    /// File name of the offline-targets document.
    pub fn file_name(&self) -> String {
        format!("{}{}", self.name(), JSON_EXT)
    }
}

/// Fetch `1.root.json`, `2.root.json`, ... from `base`.
///
/// Stops after `last_version` when it is known, or at the first version the
/// server reports as not found. Returns the number of versions fetched.
async fn fetch_root_versions(
    store: &MetadataStore,
    base: &str,
    dest_dir: &Path,
    token: Option<&str>,
    last_version: Option<u64>,
) -> Result<u64> {
    let opts = FetchOptions::with_token(token);
    let mut version = 1;
    loop {
        if last_version.map(|last| version > last).unwrap_or(false) {
            break;
        }
        let name = format!("{}.{}", version, ROOT_FILE);
        tracing::info!(file = %name, latest = ?last_version, "Fetching root metadata version");
        match store
            .fetch_and_validate(&join_url(base, &name), &name, dest_dir, &opts)
            .await
        {
            Ok(_) => version += 1,
            Err(e) if e.is_not_found() => {
                tracing::info!(file = %name, "No further root versions");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(version - 1)
}

/// Fetch the lockbox's offline-targets and offline-snapshot documents plus
/// every root metadata version from the director into `dest_dir`.
pub async fn fetch_director_metadata(
    store: &MetadataStore,
    lockbox: &LockboxSource,
    director_url: &str,
    dest_dir: &Path,
    token: Option<&str>,
) -> Result<()> {
    let base = join_url(director_url, DIRECTOR_REPO_PATH);
    let opts = FetchOptions::with_token(token);

    match lockbox {
        LockboxSource::Local { path, .. } => {
            let snapshot = path
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join(OFFLINE_SNAPSHOT_FILE);
            for src in [path.as_path(), snapshot.as_path()] {
                let file_name = src.file_name().ok_or_else(|| {
                    LockboxError::InvalidArgument(format!("Invalid path {}", src.display()))
                })?;
                tracing::info!(from = %src.display(), to = %dest_dir.display(), "Copying");
                std::fs::copy(src, dest_dir.join(file_name)).map_err(|e| {
                    LockboxError::InvalidArgument(format!(
                        "Cannot copy {}: {}",
                        src.display(),
                        e
                    ))
                })?;
            }
        }
        LockboxSource::Server { name } => {
            let file = lockbox.file_name();
            tracing::info!(file = %file, "Fetching offline-update metadata");
            let url = join_url(&base, &format!("offline-updates/{}", file));
            store
                .fetch_and_validate(&url, &file, dest_dir, &opts)
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "Offline-update fetch failed");
                    match e {
                        LockboxError::Fetch { .. } => LockboxError::InvalidArgument(format!(
                            "Could not fetch lockbox named '{}' from server",
                            name
                        )),
                        other => other,
                    }
                })?;

            tracing::info!(file = OFFLINE_SNAPSHOT_FILE, "Fetching offline snapshot");
            store
                .fetch_and_validate(
                    &join_url(&base, OFFLINE_SNAPSHOT_FILE),
                    OFFLINE_SNAPSHOT_FILE,
                    dest_dir,
                    &opts,
                )
                .await?;
        }
    }

    // Unversioned root.json first: the server may mint a new root version
    // covering the offline roles when it is requested.
    tracing::info!(file = ROOT_FILE, "Fetching director root metadata");
    let root = store
        .fetch_and_validate(
            &join_url(&base, ROOT_FILE),
            ROOT_FILE,
            dest_dir,
            &opts.clone().parse(ParseAs::Json),
        )
        .await?
        .unwrap_or_default();
    let latest = root["signed"]["version"].as_u64();

    let fetched = fetch_root_versions(store, &base, dest_dir, token, latest).await?;
    tracing::info!(versions = fetched, "Director metadata fetched");
    Ok(())
}

/// Fetch the image repository's snapshot and every metadata file it lists,
/// then its root metadata versions.
pub async fn fetch_image_repo_metadata(
    store: &MetadataStore,
    repo_url: &str,
    dest_dir: &Path,
    token: Option<&str>,
) -> Result<()> {
    let base = join_url(repo_url, IMAGE_REPO_PATH);
    let opts = FetchOptions::with_token(token);

    // The snapshot only says which files exist and how long they are
    tracing::info!(file = SNAPSHOT_FILE, "Fetching image-repo snapshot");
    let snapshot = store
        .fetch_and_validate(
            &join_url(&base, SNAPSHOT_FILE),
            SNAPSHOT_FILE,
            dest_dir,
            &opts.clone().parse(ParseAs::Json),
        )
        .await?
        .unwrap_or_default();

    let meta = snapshot["signed"]["meta"].as_object().cloned().unwrap_or_default();
    for (file, info) in &meta {
        if file == ROOT_FILE {
            continue;
        }
        let url = if WELL_KNOWN_METADATA.contains(&file.as_str()) {
            join_url(&base, file)
        } else {
            if !file.starts_with("tdx-") {
                tracing::warn!(file = %file, "Assuming file to be a delegation");
            }
            join_url(&base, &format!("delegations/{}", file))
        };

        tracing::info!(file = %file, "Fetching image-repo metadata");
        // Snapshot hashes are over canonical JSON; only the length is usable
        let file_opts = opts.clone().length(info["length"].as_u64());
        store.fetch_and_validate(&url, file, dest_dir, &file_opts).await?;
    }

    let last_root = meta
        .get(ROOT_FILE)
        .and_then(|root| root["version"].as_u64());
    let fetched = fetch_root_versions(store, &base, dest_dir, token, last_root).await?;
    tracing::info!(files = meta.len(), root_versions = fetched, "Image-repo metadata fetched");
    Ok(())
}
