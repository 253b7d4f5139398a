//! Server credentials read from an OTA `credentials.zip`.

use std::io::Read;
use std::path::Path;

use lockbox_core::error::{LockboxError, Result};
use serde::Deserialize;

const TREEHUB_ENTRY: &str = "treehub.json";
const TUFREPO_ENTRY: &str = "tufrepo.url";
const CLIENT_CERT_ENTRY: &str = "client_auth.p12";

#[derive(Debug, Deserialize)]
struct Treehub {
    oauth2: Option<OAuth2Section>,
    ostree: Option<OstreeSection>,
}

#[derive(Debug, Deserialize)]
struct OAuth2Section {
    server: String,
    client_id: String,
    client_secret: String,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OstreeSection {
    #[serde(default)]
    server: Option<String>,
}

/// Endpoints and OAuth2 client of an OTA account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCredentials {
    /// OAuth2 authorization server base URL
    pub auth_server: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
    /// OSTree (treehub) server URL
    pub ostree_server: Option<String>,
    /// Image repository base URL, without a trailing slash
    pub repo_url: String,
}

impl ServerCredentials {
    /// Read `treehub.json` and `tufrepo.url` out of a credentials package.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            LockboxError::InvalidArgument(format!(
                "Cannot open credentials file {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| {
            LockboxError::InvalidData(format!(
                "Credentials file {} is not a valid zip archive: {}",
                path.display(),
                e
            ))
        })?;

        if archive.by_name(CLIENT_CERT_ENTRY).is_ok() {
            return Err(LockboxError::InvalidArgument(
                "Client certificate authentication (client_auth.p12) is not supported".to_string(),
            ));
        }

        let treehub = read_entry(&mut archive, TREEHUB_ENTRY)?;
        let repo_url = read_entry(&mut archive, TUFREPO_ENTRY)?;
        tracing::debug!(file = %path.display(), "Loaded server credentials");

        Self::from_parts(&treehub, &repo_url)
    }

    /// Build from the contents of `treehub.json` and `tufrepo.url`.
    pub fn from_parts(treehub_json: &str, repo_url: &str) -> Result<Self> {
        let treehub: Treehub = serde_json::from_str(treehub_json)?;
        let oauth2 = treehub.oauth2.ok_or_else(|| {
            LockboxError::InvalidData(
                "Only OAuth2 authentication is supported by the credentials file".to_string(),
            )
        })?;
        let ostree = treehub.ostree.ok_or_else(|| {
            LockboxError::InvalidData("treehub.json has no 'ostree' section".to_string())
        })?;

        Ok(Self {
            auth_server: oauth2.server,
            client_id: oauth2.client_id,
            client_secret: oauth2.client_secret,
            scope: oauth2.scope,
            ostree_server: ostree.server,
            repo_url: repo_url.trim().trim_end_matches('/').to_string(),
        })
    }

    /// Director base URL: the repository URL with its path replaced by
    /// `/director`.
    pub fn director_url(&self) -> Result<String> {
        let mut url = reqwest::Url::parse(&self.repo_url).map_err(|e| {
            LockboxError::InvalidData(format!("Invalid repository URL '{}': {}", self.repo_url, e))
        })?;
        url.set_path("/director");
        Ok(url.to_string())
    }
}

fn read_entry<R: std::io::Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Result<String> {
    let mut entry = archive.by_name(name).map_err(|e| {
        LockboxError::InvalidData(format!("Credentials file has no {}: {}", name, e))
    })?;
    let mut contents = String::new();
    entry.read_to_string(&mut contents)?;
    Ok(contents)
}
