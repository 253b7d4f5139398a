//! Lockbox build orchestration.
//!
//! A build walks a linear state machine and either completes or leaves
//! nothing behind: the output directory is held by an [`OutputDirGuard`]
//! that removes it on every exit path short of a successful commit, the
//! dropped future of an interrupted build included.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lockbox_core::config::BuildConfig;
use lockbox_core::error::{LockboxError, Result};
use lockbox_core::layout::LockboxLayout;
use serde::{Deserialize, Serialize};

use crate::fetch::{
    ArtifactFetcher, ContainerRuntime, DockerCli, FetchContext, FetchedArtifact, OstreeCli,
    OstreeTool,
};
use crate::http::{HttpTransport, ReqwestTransport};
use crate::ota::{fetch_access_token, ServerCredentials};
use crate::ownership::normalize_ownership;
use crate::uptane::{
    fetch_director_metadata, fetch_image_repo_metadata, find_target, load_delegated_targets,
    LockboxSource, MetadataStore, OfflineMetadata, Target,
};

/// Build state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockboxState {
    /// Nothing on disk yet
    Init,

    /// Output directory skeleton created
    DirsCreated,

    /// Access token obtained
    Authenticated,

    DirectorMetaFetched,

    ImageMetaFetched,

    /// Offline-update metadata checked (or check disabled)
    Validated,

    /// Every offline target found in the image repository
    TargetsResolved,

    ArtifactsFetched,

    /// Bundle complete and committed
    Done,

    /// Build failed or was interrupted; output directory removed
    RolledBack,
}

/// Exclusive hold on a build's output directory.
///
/// Dropping the guard without [`commit`](Self::commit) removes the
/// directory.
#[derive(Debug)]
pub struct OutputDirGuard {
    path: PathBuf,
    committed: bool,
}

impl OutputDirGuard {
    /// Create `path`, removing a previous one first when `force` is set.
    ///
    /// An existing directory without `force` is an error and is left alone.
    pub fn acquire(path: &Path, force: bool) -> Result<Self> {
        if path.exists() {
            if !force {
                return Err(LockboxError::InvalidState(format!(
                    "Output directory '{}' already exists; please remove it or use --force",
                    path.display()
                )));
            }
            tracing::info!(dir = %path.display(), "Removing existing output directory");
            std::fs::remove_dir_all(path)?;
        }
        std::fs::create_dir_all(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            committed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the directory.
    pub fn commit(mut self) -> PathBuf {
        self.committed = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for OutputDirGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        tracing::info!(dir = %self.path.display(), "Removing incomplete output directory");
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %self.path.display(), error = %e, "Failed to remove output directory");
            }
        }
    }
}

/// Outcome of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub output_dir: PathBuf,
    pub lockbox_name: String,
    /// Offline targets resolved against the image repository, in order
    pub targets: Vec<String>,
    /// Empty when target fetching was disabled
    pub artifacts: Vec<FetchedArtifact>,
}

/// Builds one lockbox.
pub struct LockboxBuilder {
    config: BuildConfig,
    transport: Arc<dyn HttpTransport>,
    ostree: Arc<dyn OstreeTool>,
    containers: Arc<dyn ContainerRuntime>,
    credentials: Option<ServerCredentials>,
    public_feed: Option<String>,
    validation_time: Option<DateTime<Utc>>,
    state: LockboxState,
}

impl LockboxBuilder {
    /// Builder using the network and the `ostree` and `docker` tools.
    pub fn new(config: BuildConfig) -> Result<Self> {
        Ok(Self::with_collaborators(
            config,
            Arc::new(ReqwestTransport::new()?),
            Arc::new(OstreeCli::new()),
            Arc::new(DockerCli::new()),
        ))
    }

    pub fn with_collaborators(
        config: BuildConfig,
        transport: Arc<dyn HttpTransport>,
        ostree: Arc<dyn OstreeTool>,
        containers: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            config,
            transport,
            ostree,
            containers,
            credentials: None,
            public_feed: None,
            validation_time: None,
            state: LockboxState::Init,
        }
    }

    /// Use these credentials instead of reading the credentials package.
    pub fn with_credentials(mut self, credentials: ServerCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_public_feed(mut self, url: impl Into<String>) -> Self {
        self.public_feed = Some(url.into());
        self
    }

    /// Check metadata expiry against `now` instead of the current time.
    pub fn with_validation_time(mut self, now: DateTime<Utc>) -> Self {
        self.validation_time = Some(now);
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn state(&self) -> LockboxState {
        self.state
    }

    fn advance(&mut self, state: LockboxState) {
        tracing::debug!(from = ?self.state, to = ?state, "Lockbox state");
        self.state = state;
    }

    /// Run the build to completion.
    pub async fn build(&mut self) -> Result<BuildReport> {
        let result = self.run().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Lockbox build failed");
            self.advance(LockboxState::RolledBack);
        }
        result
    }

    /// Run the build until it completes or `shutdown` resolves.
    ///
    /// On shutdown the in-flight build is dropped, which removes the output
    /// directory, and `Interrupted` is returned.
    pub async fn build_with_shutdown<F>(&mut self, shutdown: F) -> Result<BuildReport>
    where
        F: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            result = self.build() => Some(result),
            _ = shutdown => None,
        };
        match outcome {
            Some(result) => result,
            None => {
                tracing::warn!("Lockbox build interrupted");
                self.advance(LockboxState::RolledBack);
                Err(LockboxError::Interrupted(format!(
                    "build of '{}' interrupted",
                    self.config.lockbox_name
                )))
            }
        }
    }

    async fn run(&mut self) -> Result<BuildReport> {
        let source = LockboxSource::parse(&self.config.lockbox_name)?;
        let credentials = match &self.credentials {
            Some(credentials) => credentials.clone(),
            None => ServerCredentials::load(&self.config.credentials)?,
        };

        let guard = OutputDirGuard::acquire(&self.config.output_dir, self.config.force)?;
        let layout = LockboxLayout::new(guard.path());
        layout.create_all()?;
        self.advance(LockboxState::DirsCreated);

        let token = fetch_access_token(self.transport.as_ref(), &credentials).await?;
        self.advance(LockboxState::Authenticated);

        let store = MetadataStore::new(self.transport.clone());
        let director_url = credentials.director_url()?;
        tracing::info!(lockbox = %source.name(), "Fetching director metadata");
        fetch_director_metadata(&store, &source, &director_url, &layout.director, Some(&token))
            .await?;
        self.advance(LockboxState::DirectorMetaFetched);

        tracing::info!("Fetching image-repo metadata");
        fetch_image_repo_metadata(&store, &credentials.repo_url, &layout.image_repo, Some(&token))
            .await?;
        self.advance(LockboxState::ImageMetaFetched);

        let offline = OfflineMetadata::load(source.name(), &layout.director)?;
        if self.config.validate {
            offline.validate(self.validation_time.unwrap_or_else(Utc::now))?;
        } else {
            tracing::warn!("Skipping validation of offline-update metadata");
        }
        self.advance(LockboxState::Validated);

        let resolved = resolve_targets(&offline, &layout.image_repo)?;
        self.advance(LockboxState::TargetsResolved);

        let mut artifacts = Vec::new();
        if self.config.fetch_targets {
            let mut fetcher = ArtifactFetcher::new(
                self.transport.clone(),
                self.ostree.clone(),
                self.containers.clone(),
                self.config.logins.clone(),
            )
            .with_default_platforms(self.config.docker_platforms.clone())
            .with_tie_break(self.config.tie_break);
            if let Some(feed) = &self.public_feed {
                fetcher = fetcher.with_public_feed(feed.clone());
            }

            let ctx = FetchContext {
                repo_url: &credentials.repo_url,
                ostree_server: credentials.ostree_server.as_deref(),
                token: Some(&token),
            };
            for (name, target) in &resolved {
                artifacts.push(fetcher.fetch(name, target, &layout, ctx).await?);
            }
        } else {
            tracing::warn!("Skipping fetch of targets");
        }
        self.advance(LockboxState::ArtifactsFetched);

        normalize_ownership(&layout.root)?;
        let output_dir = guard.commit();
        self.advance(LockboxState::Done);
        tracing::info!(dir = %output_dir.display(), "Lockbox successfully created");

        Ok(BuildReport {
            output_dir,
            lockbox_name: source.name().to_string(),
            targets: resolved.into_iter().map(|(name, _)| name).collect(),
            artifacts,
        })
    }
}

/// Resolve every offline target against the image-repository tree in
/// `image_repo_dir`. Returns the image-repository entries.
fn resolve_targets(offline: &OfflineMetadata, image_repo_dir: &Path) -> Result<Vec<(String, Target)>> {
    let tree = load_delegated_targets(image_repo_dir)?;
    let mut resolved = Vec::new();
    for (name, wanted) in offline.targets()? {
        let (found_name, found) =
            find_target(&tree, &wanted.hashes.sha256, Some(&name), Some(wanted.length))
                .ok_or_else(|| LockboxError::TargetNotFound { name: name.clone() })?;
        tracing::info!(target_name = %found_name, "Resolved target");
        resolved.push((found_name.to_string(), found.clone()));
    }
    Ok(resolved)
}
