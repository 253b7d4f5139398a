//! Fixed directory layout of a lockbox bundle.

use std::path::{Path, PathBuf};

/// Artifacts: OSTree repo, binary targets, container image archives.
pub const IMAGES_DIR: &str = "images";
/// Director repository metadata.
pub const DIRECTOR_DIR: &str = "metadata/director";
/// Image repository metadata.
pub const IMAGE_REPO_DIR: &str = "metadata/image-repo";
/// Registry manifests of container images.
pub const DOCKER_META_DIR: &str = "metadata/docker";

/// Paths of the four-directory skeleton under an output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockboxLayout {
    pub root: PathBuf,
    pub images: PathBuf,
    pub director: PathBuf,
    pub image_repo: PathBuf,
    pub docker_meta: PathBuf,
}

impl LockboxLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            images: root.join(IMAGES_DIR),
            director: root.join(DIRECTOR_DIR),
            image_repo: root.join(IMAGE_REPO_DIR),
            docker_meta: root.join(DOCKER_META_DIR),
        }
    }

    /// Create every directory of the skeleton.
    pub fn create_all(&self) -> std::io::Result<()> {
        for dir in [&self.images, &self.director, &self.image_repo, &self.docker_meta] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
