//! Lockbox runtime - offline-update bundle builder.
//!
//! This crate fetches Uptane director and image-repository metadata from an
//! OTA server, resolves the targets of an offline update and fetches them
//! (OSTree commits, binaries, docker-compose files and their container
//! images) into a self-contained bundle directory.

#![allow(clippy::result_large_err)]

pub mod fetch;
pub mod http;
pub mod lockbox;
pub mod oci;
pub mod ota;
pub mod ownership;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod uptane;

// Re-export common types
pub use fetch::{ArtifactFetcher, ContainerRuntime, DockerCli, FetchedArtifact, OstreeCli, OstreeTool};
pub use http::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use lockbox::{BuildReport, LockboxBuilder, LockboxState, OutputDirGuard};
pub use oci::{ImageReference, ManifestInfo, ManifestKind, RegistryClient, RegistryPool};
pub use ota::{fetch_access_token, ServerCredentials};
pub use uptane::{find_target, load_delegated_targets, LockboxSource, MetadataStore, Target};

/// Lockbox runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
