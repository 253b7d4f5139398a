//! Container registry client speaking the Docker Registry HTTP API v2.
//!
//! One client serves one registry host and owns that host's token cache.
//! Requests go over HTTPS first and fall back to plain HTTP when no usable
//! response came back. A `401` carrying a `WWW-Authenticate` challenge is
//! answered once: Basic with the configured login, Bearer by fetching a token
//! from the challenge realm.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lockbox_core::config::{RegistryLogin, RegistryLogins};
use lockbox_core::error::{LockboxError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::auth::{parse_www_authenticate, AuthChallenge};
use super::platform::{platform_in, PlatformSpec};
use super::reference::ImageReference;
use crate::http::{sha256_hex, HttpRequest, HttpResponse, HttpTransport};

pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

const ACCEPTED_MEDIA_TYPES: &[&str] = &[
    DOCKER_MANIFEST_MEDIA_TYPE,
    DOCKER_MANIFEST_LIST_MEDIA_TYPE,
    OCI_MANIFEST_MEDIA_TYPE,
    OCI_INDEX_MEDIA_TYPE,
];

const SUPPORTED_SCHEMA_VERSION: u64 = 2;

/// Single-platform manifest or multi-platform list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestKind {
    Manifest,
    ManifestList,
}

impl ManifestKind {
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            DOCKER_MANIFEST_MEDIA_TYPE | OCI_MANIFEST_MEDIA_TYPE => Some(Self::Manifest),
            DOCKER_MANIFEST_LIST_MEDIA_TYPE | OCI_INDEX_MEDIA_TYPE => Some(Self::ManifestList),
            _ => None,
        }
    }
}

/// Description of one fetched manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestInfo {
    /// Repository name
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ManifestKind,
    pub digest: String,
    /// Platform string; set on manifest-list children only
    pub platform: Option<String>,
    pub size: Option<u64>,
    /// Where the manifest was saved, if it was
    pub file: Option<PathBuf>,
}

/// A validated manifest body.
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    pub kind: ManifestKind,
    pub media_type: String,
    /// `sha256:` digest of `body`
    pub digest: String,
    pub body: Vec<u8>,
}

/// A manifest together with its raw body.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub info: ManifestInfo,
    pub body: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct ManifestList {
    manifests: Vec<ManifestListEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestListEntry {
    digest: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    platform: Option<PlatformSpec>,
}

/// Registry client for a single registry host.
pub struct RegistryClient {
    /// Host (and port) to contact
    registry: String,
    transport: Arc<dyn HttpTransport>,
    login: Option<RegistryLogin>,
    /// Bearer tokens keyed by scope
    token_cache: Mutex<HashMap<String, String>>,
}

impl RegistryClient {
    /// Create a client for the registry serving `reference`, picking the
    /// matching login out of `logins`.
    pub fn for_reference(
        reference: &ImageReference,
        transport: Arc<dyn HttpTransport>,
        logins: &RegistryLogins,
    ) -> Self {
        let login = logins
            .for_registry(&reference.registry, reference.is_default_registry())
            .cloned();
        Self::new(reference.registry_host(), transport, login)
    }

    pub fn new(
        registry: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        login: Option<RegistryLogin>,
    ) -> Self {
        Self {
            registry: registry.into(),
            transport,
            login,
            token_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Cached token for `scope`, if any.
    pub fn cached_token(&self, scope: &str) -> Option<String> {
        self.token_cache.lock().get(scope).cloned()
    }

    fn registry_error(&self, message: impl Into<String>) -> LockboxError {
        LockboxError::Registry {
            registry: self.registry.clone(),
            message: message.into(),
        }
    }

    /// Send one GET, attaching a cached token, or the Basic login when
    /// `basic` is set.
    ///
    /// `None` means no response was obtained.
    async fn send_get(
        &self,
        url: &str,
        scope: &str,
        send_auth: bool,
        basic: bool,
    ) -> Option<HttpResponse> {
        let mut request = HttpRequest::get(url).header("Accept", ACCEPTED_MEDIA_TYPES.join(", "));
        if send_auth {
            if let Some(token) = self.cached_token(scope) {
                request = request.bearer(&token);
            } else if let Some(login) = self.login.as_ref().filter(|_| basic) {
                request = request.basic_auth(&login.username, &login.password);
            }
        }

        match self.transport.send(request).await {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Registry request failed");
                None
            }
        }
    }

    /// GET `url`, answering one authentication challenge if the registry
    /// issues one.
    async fn authorized_get(&self, url: &str, repository: &str) -> Result<Option<HttpResponse>> {
        let scope = format!("repository:{}:pull", repository);
        // Credentials never travel over plain HTTP
        let send_auth = url.starts_with("https://");

        let response = self.send_get(url, &scope, send_auth, false).await;
        let header = match &response {
            Some(res) if res.status == 401 => match res.header("www-authenticate") {
                Some(header) => header.to_string(),
                None => {
                    tracing::debug!(url = %url, "401 without www-authenticate header");
                    return Ok(response);
                }
            },
            _ => return Ok(response),
        };
        if !send_auth {
            return Ok(response);
        }

        let challenge = parse_www_authenticate(&header)?;
        let basic = match challenge.scheme.to_ascii_lowercase().as_str() {
            "basic" => {
                if self.login.is_none() {
                    return Err(self.registry_error(
                        "Registry requires Basic authentication but no login was provided",
                    ));
                }
                true
            }
            "bearer" => {
                self.request_token(&challenge, &scope).await?;
                false
            }
            other => {
                return Err(self.registry_error(format!(
                    "Unsupported authentication scheme '{}'",
                    other
                )));
            }
        };

        Ok(self.send_get(url, &scope, send_auth, basic).await)
    }

    /// Fetch a bearer token from the challenge realm and cache it.
    async fn request_token(&self, challenge: &AuthChallenge, scope: &str) -> Result<()> {
        let realm = match challenge.values("realm").as_slice() {
            [realm] => realm.to_string(),
            _ => {
                return Err(self.registry_error(
                    "Bearer challenge must carry exactly one realm",
                ))
            }
        };
        let services = challenge.values("service");
        if services.len() > 1 {
            return Err(self.registry_error("Bearer challenge carries multiple services"));
        }
        let mut scopes: Vec<String> = challenge
            .values("scope")
            .into_iter()
            .map(str::to_string)
            .collect();
        if scopes.is_empty() {
            scopes.push(scope.to_string());
        }
        for (key, _) in &challenge.attributes {
            if !["realm", "service", "scope"].contains(&key.to_ascii_lowercase().as_str()) {
                tracing::debug!(attribute = %key, "Ignoring challenge attribute");
            }
        }

        let realm_url = reqwest::Url::parse(&format!("https://{}/", self.registry))
            .and_then(|base| base.join(&realm))
            .map_err(|e| self.registry_error(format!("Invalid realm '{}': {}", realm, e)))?;

        let mut request = HttpRequest::get(realm_url.as_str());
        if let Some(service) = services.first() {
            request = request.query("service", *service);
        }
        for sc in &scopes {
            request = request.query("scope", sc.as_str());
        }
        if let Some(login) = &self.login {
            request = request.basic_auth(&login.username, &login.password);
        }

        tracing::debug!(realm = %realm_url, scope = %scope, "Requesting registry token");
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(self.registry_error(format!(
                "Token request to {} failed with status {}",
                realm_url, response.status
            )));
        }

        let body: serde_json::Value = response.json()?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|t| t.as_str());
        match token {
            Some(token) => {
                let mut cache = self.token_cache.lock();
                for sc in &scopes {
                    cache.insert(sc.clone(), token.to_string());
                }
                cache.insert(scope.to_string(), token.to_string());
            }
            None => tracing::debug!(realm = %realm_url, "Token response carried no token"),
        }
        Ok(())
    }

    /// Fetch and validate one manifest.
    ///
    /// The digest is the SHA-256 of the raw body; when the reference pins a
    /// digest the two must agree.
    pub async fn get_manifest(&self, image: &ImageReference) -> Result<ManifestResponse> {
        let path = format!(
            "/v2/{}/manifests/{}",
            image.repository,
            image.reference_part()
        );

        let url = format!("https://{}{}", self.registry, path);
        let mut response = self.authorized_get(&url, &image.repository).await?;
        match &response {
            Some(res) if res.status == 401 => {
                tracing::warn!(image = %image, "Not authorized to access image");
            }
            Some(res) if res.is_success() => {}
            _ => {
                let url = format!("http://{}{}", self.registry, path);
                tracing::debug!(url = %url, "Retrying manifest fetch over HTTP");
                response = self.authorized_get(&url, &image.repository).await?;
            }
        }

        let response = match response {
            Some(res) if res.is_success() => res,
            Some(res) => {
                return Err(self.registry_error(format!(
                    "Failed to fetch manifest for {} (status {})",
                    image, res.status
                )))
            }
            None => {
                return Err(self.registry_error(format!(
                    "No response fetching manifest for {}",
                    image
                )))
            }
        };

        let media_type = response.content_type().unwrap_or_default().to_string();
        let kind = ManifestKind::from_media_type(&media_type).ok_or_else(|| {
            self.registry_error(format!(
                "Unsupported manifest media type '{}' for {}",
                media_type, image
            ))
        })?;

        let doc: serde_json::Value = response.json()?;
        if let Some(declared) = doc.get("mediaType").and_then(|m| m.as_str()) {
            if !ACCEPTED_MEDIA_TYPES.contains(&declared) {
                return Err(LockboxError::InvalidData(format!(
                    "Manifest of {} declares unsupported media type '{}'",
                    image, declared
                )));
            }
        }
        let schema_version = doc.get("schemaVersion").and_then(|v| v.as_u64());
        if schema_version != Some(SUPPORTED_SCHEMA_VERSION) {
            return Err(LockboxError::InvalidData(format!(
                "Manifest of {} has unsupported schemaVersion {:?}",
                image, schema_version
            )));
        }

        let digest = format!("sha256:{}", sha256_hex(&response.body));
        if let Some(expected) = &image.digest {
            if expected != &digest {
                return Err(LockboxError::InvalidData(format!(
                    "Digest mismatch for {}: expected {}, got {}",
                    image, expected, digest
                )));
            }
        }

        tracing::debug!(image = %image, digest = %digest, media_type = %media_type, "Fetched manifest");
        Ok(ManifestResponse {
            kind,
            media_type,
            digest,
            body: response.body,
        })
    }

    /// Fetch the top-level manifest and, for a list, every child manifest
    /// whose platform is in `platforms` (all children when `None`).
    ///
    /// The top-level manifest comes first, children follow in listing order.
    pub async fn get_all_manifests(
        &self,
        image: &ImageReference,
        platforms: Option<&[String]>,
    ) -> Result<Vec<FetchedManifest>> {
        let top = self.get_manifest(image).await?;
        let mut manifests = vec![FetchedManifest {
            info: ManifestInfo {
                name: image.repository.clone(),
                kind: top.kind,
                digest: top.digest.clone(),
                platform: None,
                size: Some(top.body.len() as u64),
                file: None,
            },
            body: top.body.clone(),
        }];

        if top.kind != ManifestKind::ManifestList {
            return Ok(manifests);
        }

        let list: ManifestList = serde_json::from_slice(&top.body)?;
        for entry in list.manifests {
            let platform = entry.platform.as_ref().map(PlatformSpec::platform_str);
            if let Some(requested) = platforms {
                match &platform {
                    Some(plat) if platform_in(plat, requested) => {}
                    _ => {
                        tracing::debug!(digest = %entry.digest, platform = ?platform, "Skipping manifest");
                        continue;
                    }
                }
            }

            let child = self.get_manifest(&image.with_digest(&entry.digest)).await?;
            if child.kind != ManifestKind::Manifest {
                return Err(LockboxError::InvalidData(format!(
                    "Manifest list child {} of {} is not a single-platform manifest",
                    entry.digest, image
                )));
            }
            manifests.push(FetchedManifest {
                info: ManifestInfo {
                    name: image.repository.clone(),
                    kind: ManifestKind::Manifest,
                    digest: child.digest,
                    platform,
                    size: entry.size,
                    file: None,
                },
                body: child.body,
            });
        }

        Ok(manifests)
    }

    /// Save every manifest of [`get_all_manifests`](Self::get_all_manifests)
    /// as `<dest_dir>/<hex>.json`.
    ///
    /// Returns the saved digests and the manifest descriptions with `file` set.
    pub async fn save_all_manifests(
        &self,
        image: &ImageReference,
        dest_dir: &Path,
        platforms: Option<&[String]>,
    ) -> Result<(Vec<String>, Vec<ManifestInfo>)> {
        let mut digests = Vec::new();
        let mut infos = Vec::new();
        for fetched in self.get_all_manifests(image, platforms).await? {
            let mut info = fetched.info;
            let hex = info.digest.strip_prefix("sha256:").unwrap_or(&info.digest);
            let file = dest_dir.join(format!("{}.json", hex));
            std::fs::write(&file, &fetched.body)?;
            tracing::debug!(digest = %info.digest, file = %file.display(), "Saved manifest");
            digests.push(info.digest.clone());
            info.file = Some(file);
            infos.push(info);
        }
        Ok((digests, infos))
    }
}

/// Registry clients keyed by host, created on first use.
///
/// Keeps one token cache per registry for the lifetime of a build.
pub struct RegistryPool {
    transport: Arc<dyn HttpTransport>,
    logins: RegistryLogins,
    clients: HashMap<String, RegistryClient>,
}

impl RegistryPool {
    pub fn new(transport: Arc<dyn HttpTransport>, logins: RegistryLogins) -> Self {
        Self {
            transport,
            logins,
            clients: HashMap::new(),
        }
    }

    /// Client serving `reference`.
    pub fn client_for(&mut self, reference: &ImageReference) -> &RegistryClient {
        let transport = &self.transport;
        let logins = &self.logins;
        self.clients
            .entry(reference.registry_host().to_string())
            .or_insert_with(|| RegistryClient::for_reference(reference, transport.clone(), logins))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
