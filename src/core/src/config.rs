use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{LockboxError, Result};

/// Platforms selected for multi-platform images when the compose file does not
/// name one.
pub const DEFAULT_PLATFORMS: &[&str] = &["linux/arm/v7", "linux/arm64"];

/// Default output directory of a lockbox build.
pub const DEFAULT_OUTPUT_DIR: &str = "update/";

/// How to break a tie between equally specific manifests for one platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// Abort the build (ambiguity is an error).
    #[default]
    Fail,
    /// Keep the manifest listed first by the registry.
    FirstListed,
}

impl std::fmt::Display for TieBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fail => write!(f, "fail"),
            Self::FirstListed => write!(f, "first-listed"),
        }
    }
}

impl std::str::FromStr for TieBreak {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fail" => Ok(Self::Fail),
            "first-listed" => Ok(Self::FirstListed),
            _ => Err(format!(
                "unknown tie-break policy: '{}' (supported: fail, first-listed)",
                s
            )),
        }
    }
}

/// Username/password pair for a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryLogin {
    pub username: String,
    pub password: String,
}

/// Registry logins: one for the default registry, others per registry host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryLogins {
    /// Login used only with the default registry.
    pub default: Option<RegistryLogin>,
    /// `(registry, login)` pairs for other registries.
    pub extra: Vec<(String, RegistryLogin)>,
}

impl RegistryLogins {
    /// Set the default-registry login.
    pub fn with_default(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.default = Some(RegistryLogin {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Add a login for a specific registry, validating the registry name.
    pub fn with_registry(
        mut self,
        registry: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let registry = registry.into();
        validate_registry_name(&registry)?;
        self.extra.push((
            registry,
            RegistryLogin {
                username: username.into(),
                password: password.into(),
            },
        ));
        Ok(self)
    }

    /// Pick the login for a registry.
    ///
    /// `is_default` tells whether `registry` is the default registry; the
    /// default login never leaks to other registries.
    pub fn for_registry(&self, registry: &str, is_default: bool) -> Option<&RegistryLogin> {
        let specific = self
            .extra
            .iter()
            .rev()
            .find(|(reg, _)| reg == registry)
            .map(|(_, login)| login);
        if specific.is_some() {
            return specific;
        }
        if is_default {
            self.default.as_ref()
        } else {
            None
        }
    }

    /// All logins keyed by registry, default registry as `None`.
    pub fn iter(&self) -> impl Iterator<Item = (Option<&str>, &RegistryLogin)> {
        self.default
            .iter()
            .map(|login| (None, login))
            .chain(self.extra.iter().map(|(reg, login)| (Some(reg.as_str()), login)))
    }
}

/// Validate a registry given as host or IPv4, optionally followed by `:port`.
pub fn validate_registry_name(registry: &str) -> Result<()> {
    let invalid = || {
        LockboxError::InvalidArgument(format!(
            "invalid registry specified: '{}'; the registry can be specified as a domain \
             name or an IP address possibly followed by :<port-number>",
            registry
        ))
    };

    if registry.is_empty() || registry.contains("://") || registry.contains('/') {
        return Err(invalid());
    }
    if let Some((host, port)) = registry.rsplit_once(':') {
        if host.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Configuration of one lockbox build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Lockbox name at the OTA server, or a local `.json` offline-targets file.
    pub lockbox_name: String,

    /// Path to the OTA `credentials.zip`.
    pub credentials: PathBuf,

    /// Output directory of the bundle.
    pub output_dir: PathBuf,

    /// Default platforms for multi-platform images; `None` selects all of them.
    pub docker_platforms: Option<Vec<String>>,

    /// Remove an existing output directory first.
    pub force: bool,

    /// Validate the offline-update metadata.
    pub validate: bool,

    /// Fetch targets (otherwise metadata only).
    pub fetch_targets: bool,

    /// Tie-break policy for equally specific manifests.
    pub tie_break: TieBreak,

    /// Container registry logins.
    #[serde(skip)]
    pub logins: RegistryLogins,
}

impl BuildConfig {
    /// Create a configuration with the defaults used by the CLI.
    pub fn new(lockbox_name: impl Into<String>, credentials: impl Into<PathBuf>) -> Self {
        Self {
            lockbox_name: lockbox_name.into(),
            credentials: credentials.into(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            docker_platforms: Some(DEFAULT_PLATFORMS.iter().map(|p| p.to_string()).collect()),
            force: false,
            validate: true,
            fetch_targets: true,
            tie_break: TieBreak::default(),
            logins: RegistryLogins::default(),
        }
    }
}
