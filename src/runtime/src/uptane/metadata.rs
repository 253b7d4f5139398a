//! Signed metadata files: loading from disk and validated download.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lockbox_core::error::{LockboxError, Result};
use serde::{Deserialize, Serialize};

use crate::http::{sha256_hex, HttpRequest, HttpTransport};

/// Read cap for ordinary metadata files.
pub const DEFAULT_METADATA_MAXLEN: u64 = 4 * 1024 * 1024;

/// Read cap for targets metadata, which lists every target.
pub const TARGETS_METADATA_MAXLEN: u64 = 16 * 1024 * 1024;

/// Characters never allowed in a file name written to disk.
pub const UNSAFE_FILENAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// How to parse a downloaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseAs {
    Json,
    Yaml,
}

/// Reject names that could escape the destination directory or are not
/// portable file names.
pub fn check_safe_filename(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(LockboxError::InvalidArgument(format!(
            "Invalid file name '{}'",
            name
        )));
    }
    if let Some(c) = name.chars().find(|c| UNSAFE_FILENAME_CHARS.contains(c) || c.is_control()) {
        return Err(LockboxError::InvalidArgument(format!(
            "File name '{}' contains unsafe character '{}'",
            name,
            c.escape_default()
        )));
    }
    Ok(())
}

/// A metadata file loaded from disk together with its size and digest.
#[derive(Debug, Clone)]
pub struct SignedMetadata {
    pub file: PathBuf,
    pub size: u64,
    /// Lowercase hex SHA-256 of the file
    pub sha256: String,
    pub parsed: serde_json::Value,
}

impl SignedMetadata {
    /// Load and parse `path`, refusing files larger than `maxlen`.
    pub fn load(path: &Path, parse_as: ParseAs, maxlen: u64) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            LockboxError::InvalidState(format!("Cannot open metadata {}: {}", path.display(), e))
        })?;
        let mut data = Vec::new();
        file.take(maxlen + 1).read_to_end(&mut data)?;
        if data.len() as u64 > maxlen {
            return Err(LockboxError::InvalidData(format!(
                "Metadata {} exceeds {} bytes",
                path.display(),
                maxlen
            )));
        }

        let parsed = parse_bytes(&data, parse_as)?;
        Ok(Self {
            file: path.to_path_buf(),
            size: data.len() as u64,
            sha256: sha256_hex(&data),
            parsed,
        })
    }

    /// Base name of the file.
    pub fn file_name(&self) -> String {
        self.file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The `signed` portion.
    pub fn signed(&self) -> &serde_json::Value {
        &self.parsed["signed"]
    }

    pub fn meta_type(&self) -> Option<&str> {
        self.signed()["_type"].as_str()
    }

    pub fn version(&self) -> Option<u64> {
        self.signed()["version"].as_u64()
    }

    pub fn expires(&self) -> Option<&str> {
        self.signed()["expires"].as_str()
    }
}

fn parse_bytes(data: &[u8], parse_as: ParseAs) -> Result<serde_json::Value> {
    Ok(match parse_as {
        ParseAs::Json => serde_json::from_slice(data)?,
        ParseAs::Yaml => serde_yaml::from_slice(data)?,
    })
}

/// Format of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetFormat {
    #[serde(rename = "OSTREE")]
    Ostree,
    #[serde(rename = "BINARY")]
    Binary,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHashes {
    pub sha256: String,
}

/// The `custom` object of a target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCustom {
    #[serde(rename = "targetFormat", default)]
    pub target_format: Option<TargetFormat>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "hardwareIds", default)]
    pub hardware_ids: Vec<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

/// A target entry of targets metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub hashes: TargetHashes,
    pub length: u64,
    #[serde(default)]
    pub custom: Option<TargetCustom>,
}

impl Target {
    pub fn format(&self) -> Option<TargetFormat> {
        self.custom.as_ref().and_then(|c| c.target_format)
    }

    /// Whether the target is a docker-compose file.
    pub fn is_compose(&self) -> bool {
        self.custom
            .as_ref()
            .map(|c| c.hardware_ids.iter().any(|id| id == "docker-compose"))
            .unwrap_or(false)
    }

    /// Explicit download location, if the target carries one.
    pub fn uri(&self) -> Option<&str> {
        self.custom
            .as_ref()
            .and_then(|c| c.uri.as_deref())
            .filter(|u| !u.is_empty())
    }

    pub fn display_name(&self) -> String {
        match &self.custom {
            Some(TargetCustom {
                name: Some(name),
                version: Some(version),
                ..
            }) => format!("{} {}", name, version),
            Some(TargetCustom {
                name: Some(name), ..
            }) => name.clone(),
            _ => self.hashes.sha256.clone(),
        }
    }
}

/// The `signed.targets` map of targets metadata, in declared order.
pub fn parse_targets(signed: &serde_json::Value) -> Result<Vec<(String, Target)>> {
    let Some(map) = signed["targets"].as_object() else {
        return Ok(Vec::new());
    };
    map.iter()
        .map(|(name, entry)| {
            let target: Target = serde_json::from_value(entry.clone()).map_err(|e| {
                LockboxError::InvalidData(format!("Malformed target '{}': {}", name, e))
            })?;
            Ok((name.clone(), target))
        })
        .collect()
}

/// Download options of [`MetadataStore::fetch_and_validate`].
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Expected lowercase hex SHA-256
    pub sha256: Option<String>,
    /// Expected length in bytes
    pub length: Option<u64>,
    /// Bearer token; only ever sent over HTTPS
    pub token: Option<String>,
    pub parse_as: Option<ParseAs>,
}

impl FetchOptions {
    pub fn with_token(token: Option<&str>) -> Self {
        Self {
            token: token.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn parse(mut self, parse_as: ParseAs) -> Self {
        self.parse_as = Some(parse_as);
        self
    }

    pub fn length(mut self, length: Option<u64>) -> Self {
        self.length = length;
        self
    }

    pub fn sha256(mut self, sha256: Option<&str>) -> Self {
        self.sha256 = sha256.map(str::to_string);
        self
    }
}

/// Downloads files, checks them against expected length and digest, and
/// writes them under a destination directory.
#[derive(Clone)]
pub struct MetadataStore {
    transport: Arc<dyn HttpTransport>,
}

impl MetadataStore {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    /// Fetch `url` into `dest_dir/name`.
    ///
    /// The name is checked before any request is made. Length is verified
    /// before the digest. Returns the parsed document when `parse_as` is set.
    pub async fn fetch_and_validate(
        &self,
        url: &str,
        name: &str,
        dest_dir: &Path,
        opts: &FetchOptions,
    ) -> Result<Option<serde_json::Value>> {
        check_safe_filename(name)?;

        let mut request = HttpRequest::get(url);
        if let Some(token) = &opts.token {
            if !url.starts_with("https://") {
                return Err(LockboxError::InvalidArgument(format!(
                    "Refusing to send an access token over a non-HTTPS URL: {}",
                    url
                )));
            }
            request = request.bearer(token);
        }

        tracing::debug!(url = %url, name = %name, "Fetching");
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(LockboxError::Fetch {
                url: url.to_string(),
                status_code: response.status,
            });
        }

        let data = response.body;
        if let Some(length) = opts.length {
            if data.len() as u64 != length {
                return Err(LockboxError::InvalidData(format!(
                    "Length mismatch for {}: expected {}, got {}",
                    name,
                    length,
                    data.len()
                )));
            }
        }
        if let Some(expected) = &opts.sha256 {
            let actual = sha256_hex(&data);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(LockboxError::InvalidData(format!(
                    "SHA-256 mismatch for {}: expected {}, got {}",
                    name, expected, actual
                )));
            }
        }

        let dest = dest_dir.join(name);
        std::fs::write(&dest, &data)?;
        tracing::debug!(file = %dest.display(), size = data.len(), "Saved");

        opts.parse_as
            .map(|parse_as| parse_bytes(&data, parse_as))
            .transpose()
    }
}
