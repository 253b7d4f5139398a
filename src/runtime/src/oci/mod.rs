//! Container registry support.
//!
//! Fetches manifests and manifest lists over the Docker Registry HTTP API v2
//! and grades platform compatibility of multi-platform images. It supports:
//!
//! - Image reference parsing (registry, repository, tag, digest)
//! - `WWW-Authenticate` challenges (Basic and Bearer tokens)
//! - Digest verification of every manifest body
//! - Platform filtering and ranking of manifest-list children

pub mod auth;
pub mod platform;
pub mod reference;
pub mod registry;

pub use auth::{parse_www_authenticate, AuthChallenge};
pub use platform::{
    compatible_images, platform_in, platform_matches, rank_compatible_images, PlatformSpec,
};
pub use reference::ImageReference;
pub use registry::{
    FetchedManifest, ManifestInfo, ManifestKind, ManifestResponse, RegistryClient, RegistryPool,
};
