//! Container runtime used to pull images and export them as tarballs.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use lockbox_core::config::RegistryLogin;
use lockbox_core::error::{LockboxError, Result};
use tokio::process::Command;

use super::process::{run_tool, DEFAULT_TOOL_TIMEOUT};

/// Container runtime operations needed to archive images.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Log in to `registry`, or to the default registry when `None`.
    async fn login(&self, registry: Option<&str>, login: &RegistryLogin) -> Result<()>;
    /// Pull `image_spec` (`name@digest`).
    async fn pull(&self, image_spec: &str) -> Result<()>;
    /// Tag `source` as `repository:tag`.
    async fn tag(&self, source: &str, repository: &str, tag: &str) -> Result<()>;
    /// Save `image` (as tagged) to a tarball at `dest`.
    async fn save(&self, image: &str, dest: &Path) -> Result<()>;
}

/// [`ContainerRuntime`] driving the `docker` command-line client.
pub struct DockerCli {
    binary: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Use another docker-compatible client binary.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        run_tool("docker", cmd, stdin, self.timeout).await
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn login(&self, registry: Option<&str>, login: &RegistryLogin) -> Result<()> {
        let mut args = vec!["login", "--username", login.username.as_str(), "--password-stdin"];
        if let Some(registry) = registry {
            args.push(registry);
        }
        tracing::info!(registry = registry.unwrap_or("default"), "Logging in to registry");
        // Password goes through stdin, never the command line
        self.run(&args, Some(login.password.as_bytes()))
            .await
            .map(|_| ())
    }

    async fn pull(&self, image_spec: &str) -> Result<()> {
        self.run(&["pull", image_spec], None).await.map(|_| ())
    }

    async fn tag(&self, source: &str, repository: &str, tag: &str) -> Result<()> {
        let target = format!("{}:{}", repository, tag);
        self.run(&["tag", source, target.as_str()], None).await.map(|_| ())
    }

    async fn save(&self, image: &str, dest: &Path) -> Result<()> {
        let dest = dest.to_str().ok_or_else(|| {
            LockboxError::InvalidArgument(format!("Non UTF-8 path {}", dest.display()))
        })?;
        self.run(&["image", "save", "--output", dest, image], None)
            .await
            .map(|_| ())
    }
}
