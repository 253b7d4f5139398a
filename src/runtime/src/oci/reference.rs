//! Container image reference parsing.
//!
//! Parses references like `ghcr.io/org/app:v1@sha256:...` into structured
//! components and maps the default registry name to the host serving it.

use lockbox_core::error::{LockboxError, Result};

/// Default registry when none is specified.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Host actually serving the default registry.
pub const DEFAULT_REGISTRY_HOST: &str = "registry-1.docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry name as written (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/app")
    pub repository: String,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `myuser/myimage:v1` → docker.io/myuser/myimage:v1
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    ///
    /// References carrying a URL scheme are rejected.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(LockboxError::InvalidArgument(
                "Empty image reference".to_string(),
            ));
        }
        if reference.contains("://") {
            return Err(LockboxError::InvalidArgument(format!(
                "Image reference '{}' must not include a scheme",
                reference
            )));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name_tag, digest_part)) => {
                if !digest_part.contains(':') {
                    return Err(LockboxError::InvalidArgument(format!(
                        "Invalid digest format in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name_tag, Some(digest_part.to_string()))
            }
            None => (reference, None),
        };

        // A tag can only follow the last path segment.
        let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon_pos) => {
                let split = last_segment_start + colon_pos;
                let after_colon = &name_tag[split + 1..];
                // `host:5000` alone is a registry port, not a tag
                if last_segment_start == 0
                    && digest.is_none()
                    && after_colon.chars().all(|c| c.is_ascii_digit())
                {
                    (name_tag.to_string(), None)
                } else {
                    (name_tag[..split].to_string(), Some(after_colon.to_string()))
                }
            }
            None => (name_tag.to_string(), None),
        };

        if tag.as_deref() == Some("") {
            return Err(LockboxError::InvalidArgument(format!(
                "Empty tag in reference '{}'",
                reference
            )));
        }

        let (registry, repository) = Self::split_registry_repository(&name)?;

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // First component is a registry when it looks like a host
        if let Some((first, rest)) = name.split_once('/') {
            if first.contains('.') || first.contains(':') || first == "localhost" {
                if rest.is_empty() {
                    return Err(LockboxError::InvalidArgument(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                return Ok((first.to_string(), rest.to_string()));
            }
        }

        if name.is_empty() {
            return Err(LockboxError::InvalidArgument(
                "Empty repository in image reference".to_string(),
            ));
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// Whether this reference points at the default registry.
    pub fn is_default_registry(&self) -> bool {
        self.registry == DEFAULT_REGISTRY || self.registry == DEFAULT_REGISTRY_HOST
    }

    /// Host to contact for this reference.
    pub fn registry_host(&self) -> &str {
        if self.is_default_registry() {
            DEFAULT_REGISTRY_HOST
        } else {
            &self.registry
        }
    }

    /// Whether the reference pins a digest.
    pub fn uses_digest(&self) -> bool {
        self.digest.is_some()
    }

    /// Tag or digest to put in a manifest URL; the digest wins.
    pub fn reference_part(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Same repository, addressed by `digest`.
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}
