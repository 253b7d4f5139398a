//! Artifact fetching: OSTree commits, binary files and docker-compose
//! targets with the container images they reference.

pub mod compose;
pub mod container;
pub mod ostree;
pub mod process;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lockbox_core::config::{RegistryLogins, TieBreak};
use lockbox_core::error::{LockboxError, Result};
use lockbox_core::layout::LockboxLayout;

pub use compose::{
    build_image_archives, fetch_manifests, referenced_images, select_images,
    select_unique_images, ImageArchive, ImageSelection, ManifestsPerImage, ServiceImage,
};
pub use container::{ContainerRuntime, DockerCli};
pub use ostree::{commit_exists, OstreeCli, OstreeFetcher, OstreeTool, OSTREE_PUBLIC_FEED};
pub use process::{run_tool, DEFAULT_TOOL_TIMEOUT};

use crate::http::{join_url, HttpTransport};
use crate::oci::RegistryPool;
use crate::uptane::{FetchOptions, MetadataStore, ParseAs, Target, TargetFormat};

const BINARY_TARGETS_PATH: &str = "api/v1/user_repo/targets";

/// Server-side context shared by every target of one build.
#[derive(Debug, Clone, Copy)]
pub struct FetchContext<'a> {
    /// Image repository base URL
    pub repo_url: &'a str,
    /// The user's OSTree server
    pub ostree_server: Option<&'a str>,
    pub token: Option<&'a str>,
}

/// What a fetched target produced in the bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedArtifact {
    Ostree { repo: PathBuf },
    Binary { file: PathBuf },
    Compose { file: PathBuf, images: Vec<ImageArchive> },
}

/// Fetches resolved targets into a lockbox layout, dispatching on the
/// target format.
pub struct ArtifactFetcher {
    store: MetadataStore,
    ostree: OstreeFetcher,
    containers: Arc<dyn ContainerRuntime>,
    registries: RegistryPool,
    logins: RegistryLogins,
    default_platforms: Option<Vec<String>>,
    tie_break: TieBreak,
}

impl ArtifactFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        ostree: Arc<dyn OstreeTool>,
        containers: Arc<dyn ContainerRuntime>,
        logins: RegistryLogins,
    ) -> Self {
        Self {
            store: MetadataStore::new(transport.clone()),
            ostree: OstreeFetcher::new(transport.clone(), ostree),
            containers,
            registries: RegistryPool::new(transport, logins.clone()),
            logins,
            default_platforms: None,
            tie_break: TieBreak::default(),
        }
    }

    /// Platforms selected for multi-platform images the compose file leaves
    /// open. `None` selects every platform.
    pub fn with_default_platforms(mut self, platforms: Option<Vec<String>>) -> Self {
        self.default_platforms = platforms;
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn with_public_feed(mut self, url: impl Into<String>) -> Self {
        self.ostree = self.ostree.with_public_feed(url);
        self
    }

    /// Fetch target `name` into `layout`.
    pub async fn fetch(
        &mut self,
        name: &str,
        target: &Target,
        layout: &LockboxLayout,
        ctx: FetchContext<'_>,
    ) -> Result<FetchedArtifact> {
        match target.format() {
            Some(TargetFormat::Ostree) => {
                let repo = self
                    .ostree
                    .fetch(name, target, &layout.images, ctx.ostree_server, ctx.token)
                    .await?;
                Ok(FetchedArtifact::Ostree { repo })
            }
            Some(TargetFormat::Binary) if target.is_compose() => {
                self.fetch_compose(name, target, layout, ctx).await
            }
            Some(TargetFormat::Binary) => {
                tracing::info!(target_name = %name, "Fetching binary target");
                self.fetch_file(name, target, &layout.images, ctx, None)
                    .await?;
                Ok(FetchedArtifact::Binary {
                    file: layout.images.join(name),
                })
            }
            other => Err(LockboxError::InvalidData(format!(
                "Unhandled target format {:?} for target '{}'",
                other, name
            ))),
        }
    }

    /// Download a file target, verifying its length and digest.
    async fn fetch_file(
        &self,
        name: &str,
        target: &Target,
        dest_dir: &Path,
        ctx: FetchContext<'_>,
        parse_as: Option<ParseAs>,
    ) -> Result<Option<serde_json::Value>> {
        // A custom URI points outside the OTA server: never send it the token
        let (url, token) = match target.uri() {
            Some(uri) => (uri.to_string(), None),
            None => (
                join_url(ctx.repo_url, &format!("{}/{}", BINARY_TARGETS_PATH, name)),
                ctx.token,
            ),
        };
        tracing::info!(
            target_name = %name,
            url = %url,
            uptane_name = %target.display_name(),
            "Fetching target"
        );

        let mut opts = FetchOptions::with_token(token)
            .sha256(Some(&target.hashes.sha256))
            .length(Some(target.length));
        opts.parse_as = parse_as;
        self.store.fetch_and_validate(&url, name, dest_dir, &opts).await
    }

    async fn fetch_compose(
        &mut self,
        name: &str,
        target: &Target,
        layout: &LockboxLayout,
        ctx: FetchContext<'_>,
    ) -> Result<FetchedArtifact> {
        tracing::info!(target_name = %name, "Fetching docker-compose target");
        let compose = self
            .fetch_file(name, target, &layout.images, ctx, Some(ParseAs::Yaml))
            .await?
            .ok_or_else(|| {
                LockboxError::InvalidData(format!("Compose target '{}' was not parsed", name))
            })?;

        let services = referenced_images(&compose)?;
        let mut pairs: Vec<(String, Option<String>)> = Vec::new();
        for svc in services {
            let pair = (svc.image, svc.platform);
            if !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }
        let mut images: Vec<String> = Vec::new();
        for (image, _) in &pairs {
            if !images.contains(image) {
                images.push(image.clone());
            }
        }

        let sha256 = target.hashes.sha256.as_str();
        let manifests_dir = layout.docker_meta.join(format!("{}.manifests", sha256));
        std::fs::create_dir(&manifests_dir)?;
        let manifests = fetch_manifests(&mut self.registries, &images, &manifests_dir).await?;

        let unique = select_unique_images(
            &pairs,
            &manifests,
            self.default_platforms.as_deref(),
            self.tie_break,
        )?;

        let images_dir = layout.images.join(format!("{}.images", sha256));
        std::fs::create_dir(&images_dir)?;
        let archives =
            build_image_archives(self.containers.as_ref(), &unique, &images_dir, &self.logins)
                .await?;

        Ok(FetchedArtifact::Compose {
            file: layout.images.join(name),
            images: archives,
        })
    }
}
