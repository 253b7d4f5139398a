//! docker-compose targets: which images a compose file pins, which
//! single-platform manifests to ship for them, and archiving those images.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use lockbox_core::config::{RegistryLogins, TieBreak};
use lockbox_core::error::{LockboxError, Result};

use super::container::ContainerRuntime;
use crate::oci::{rank_compatible_images, ImageReference, ManifestInfo, ManifestKind, RegistryPool};

const SHA256_PREFIX: &str = "sha256:";

/// Platform of manifests that are not images (attestations and the like).
const UNKNOWN_PLATFORM: &str = "unknown/unknown";

/// Image and optional platform of one compose service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceImage {
    pub service: String,
    pub image: String,
    pub platform: Option<String>,
}

/// Manifests fetched per image, keyed by the image as written in the
/// compose file. The top-level manifest comes first.
pub type ManifestsPerImage = HashMap<String, Vec<ManifestInfo>>;

/// One selected single-platform manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSelection {
    pub image: String,
    /// Platform requested by the compose service, if any
    pub requested_platform: Option<String>,
    pub digest: String,
    /// Platform of the selected manifest (unset for single-platform images)
    pub platform: Option<String>,
}

/// A saved image tarball.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArchive {
    pub image_spec: String,
    pub tag: String,
    pub file: PathBuf,
}

/// Images referenced by the services of a parsed compose file, in service
/// order. Every image must be pinned by a `sha256` digest.
pub fn referenced_images(compose: &serde_json::Value) -> Result<Vec<ServiceImage>> {
    let services = compose["services"].as_object().ok_or_else(|| {
        LockboxError::InvalidData("Section 'services' not found in docker-compose file".to_string())
    })?;

    let mut images = Vec::with_capacity(services.len());
    for (service, spec) in services {
        let image = spec["image"].as_str().ok_or_else(|| {
            LockboxError::InvalidData(format!("No 'image' specified for service {}", service))
        })?;
        let reference = ImageReference::parse(image)?;
        let pinned = reference
            .digest
            .as_deref()
            .map(|d| d.starts_with(SHA256_PREFIX))
            .unwrap_or(false);
        if !pinned {
            return Err(LockboxError::InvalidData(format!(
                "Image '{}' of service {} is not specified by digest",
                image, service
            )));
        }
        images.push(ServiceImage {
            service: service.clone(),
            image: image.to_string(),
            platform: spec["platform"].as_str().map(str::to_string),
        });
    }

    tracing::debug!(images = ?images, "Images used in docker-compose");
    Ok(images)
}

/// Fetch and save every manifest of each image into `manifests_dir`.
///
/// Manifest lists are fetched with all their children; platform choice
/// happens later in [`select_images`].
pub async fn fetch_manifests(
    registries: &mut RegistryPool,
    images: &[String],
    manifests_dir: &Path,
) -> Result<ManifestsPerImage> {
    let mut per_image = ManifestsPerImage::new();
    for image in images {
        if per_image.contains_key(image) {
            continue;
        }
        tracing::info!(image = %image, "Fetching manifests");
        let reference = ImageReference::parse(image)?;
        let client = registries.client_for(&reference);
        let (_, infos) = client
            .save_all_manifests(&reference, manifests_dir, None)
            .await?;
        for info in &infos {
            tracing::debug!(digest = %info.digest, kind = ?info.kind, "Manifest saved");
        }
        per_image.insert(image.clone(), infos);
    }
    Ok(per_image)
}

/// Pick the single-platform manifests to ship for each `(image, platform)`
/// pair.
///
/// | compose platform | image          | default platforms | selection                        |
/// |------------------|----------------|-------------------|----------------------------------|
/// | none             | multi-platform | none              | every child but `unknown/unknown` |
/// | none             | multi-platform | set               | best match per default platform  |
/// | none             | single         | any               | the one manifest                 |
/// | set              | multi-platform | any               | best match for that platform     |
/// | set              | single         | any               | the one manifest                 |
pub fn select_images(
    pairs: &[(String, Option<String>)],
    manifests_per_image: &ManifestsPerImage,
    default_platforms: Option<&[String]>,
    tie_break: TieBreak,
) -> Result<Vec<ImageSelection>> {
    let mut selection = Vec::new();

    for (image, requested) in pairs {
        let all = manifests_per_image.get(image).ok_or_else(|| {
            LockboxError::InvalidState(format!(
                "Requested image {} not in the fetched manifests",
                image
            ))
        })?;
        let manifests: Vec<ManifestInfo> = all
            .iter()
            .filter(|m| m.kind == ManifestKind::Manifest)
            .cloned()
            .collect();
        let multi_platform = all.iter().any(|m| m.kind == ManifestKind::ManifestList);
        let first = manifests.first().ok_or_else(|| {
            LockboxError::InvalidData(format!("No manifest for image {}", image))
        })?;

        let select = |man: &ManifestInfo| ImageSelection {
            image: image.clone(),
            requested_platform: requested.clone(),
            digest: man.digest.clone(),
            platform: man.platform.clone(),
        };
        let best = |platform: &str| -> Result<ImageSelection> {
            let ranked = rank_compatible_images(&manifests, platform, tie_break)?;
            let best = ranked.first().ok_or_else(|| {
                LockboxError::InvalidData(format!(
                    "There are no images matching platform '{}' for '{}'",
                    platform, image
                ))
            })?;
            Ok(select(*best))
        };

        let current: Vec<ImageSelection> = match (requested, multi_platform, default_platforms) {
            (None, true, None) => manifests
                .iter()
                .filter(|m| m.platform.as_deref() != Some(UNKNOWN_PLATFORM))
                .map(&select)
                .collect(),
            (None, true, Some(defaults)) => defaults
                .iter()
                .map(|platform| best(platform.as_str()))
                .collect::<Result<_>>()?,
            (Some(platform), true, _) => vec![best(platform.as_str())?],
            (_, false, _) => vec![select(first)],
        };

        for sel in &current {
            tracing::info!(
                image = %sel.image,
                requested_platform = ?sel.requested_platform,
                digest = %sel.digest,
                platform = ?sel.platform,
                "Selected image"
            );
        }
        selection.extend(current);
    }

    Ok(selection)
}

/// Unique `(name@digest, digest)` pairs to archive.
pub fn select_unique_images(
    pairs: &[(String, Option<String>)],
    manifests_per_image: &ManifestsPerImage,
    default_platforms: Option<&[String]>,
    tie_break: TieBreak,
) -> Result<BTreeSet<(String, String)>> {
    let unique: BTreeSet<(String, String)> =
        select_images(pairs, manifests_per_image, default_platforms, tie_break)?
            .into_iter()
            .map(|sel| {
                let name = sel.image.split('@').next().unwrap_or(&sel.image);
                (format!("{}@{}", name, sel.digest), sel.digest)
            })
            .collect();

    for (spec, _) in &unique {
        tracing::info!(image = %spec, "Unique image selected");
    }
    Ok(unique)
}

/// Pull each unique image, tag it `digest_sha256_<hex>` and save it as
/// `<target_dir>/<hex>.tar`.
///
/// Logs in to every configured registry before the first pull.
pub async fn build_image_archives(
    runtime: &dyn ContainerRuntime,
    unique_images: &BTreeSet<(String, String)>,
    target_dir: &Path,
    logins: &RegistryLogins,
) -> Result<Vec<ImageArchive>> {
    for (registry, login) in logins.iter() {
        runtime.login(registry, login).await?;
    }

    let mut archives = Vec::with_capacity(unique_images.len());
    for (image_spec, digest) in unique_images {
        let hex = digest.strip_prefix(SHA256_PREFIX).ok_or_else(|| {
            LockboxError::InvalidData(format!("Digest {} is not a sha256 digest", digest))
        })?;
        let (name, _) = image_spec.split_once('@').ok_or_else(|| {
            LockboxError::InvalidData(format!(
                "Image name {} does not conform with format name@digest",
                image_spec
            ))
        })?;

        tracing::info!(image = %image_spec, "Fetching container image");
        runtime.pull(image_spec).await?;

        let tag = format!("digest_{}", digest.replace(':', "_"));
        runtime.tag(image_spec, name, &tag).await?;

        let file = target_dir.join(format!("{}.tar", hex));
        tracing::info!(image = %image_spec, file = %file.display(), "Saving image");
        runtime.save(&format!("{}:{}", name, tag), &file).await?;

        archives.push(ImageArchive {
            image_spec: image_spec.clone(),
            tag,
            file,
        });
    }

    Ok(archives)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeContainerRuntime;
    use serde_json::json;

    const LIST: &str = "sha256:1111111111111111111111111111111111111111111111111111111111111111";
    const ARM: &str = "sha256:aaaa";
    const ARM64: &str = "sha256:bbbb";
    const ATTEST: &str = "sha256:cccc";
    const SINGLE: &str = "sha256:2222222222222222222222222222222222222222222222222222222222222222";

    fn info(kind: ManifestKind, digest: &str, platform: Option<&str>) -> ManifestInfo {
        ManifestInfo {
            name: "org/app".to_string(),
            kind,
            digest: digest.to_string(),
            platform: platform.map(str::to_string),
            size: None,
            file: None,
        }
    }

    fn manifests() -> (String, String, ManifestsPerImage) {
        let multi = format!("ghcr.io/org/app@{}", LIST);
        let single = format!("ghcr.io/org/tool@{}", SINGLE);
        let mut per_image = ManifestsPerImage::new();
        per_image.insert(
            multi.clone(),
            vec![
                info(ManifestKind::ManifestList, LIST, None),
                info(ManifestKind::Manifest, ARM, Some("linux/arm/v7")),
                info(ManifestKind::Manifest, ARM64, Some("linux/arm64")),
                info(ManifestKind::Manifest, ATTEST, Some("unknown/unknown")),
            ],
        );
        per_image.insert(
            single.clone(),
            vec![info(ManifestKind::Manifest, SINGLE, None)],
        );
        (multi, single, per_image)
    }

    fn defaults() -> Vec<String> {
        vec!["linux/arm/v7".to_string(), "linux/arm64".to_string()]
    }

    #[test]
    fn test_referenced_images() {
        let compose = json!({"services": {
            "web": {"image": format!("ghcr.io/org/app@{}", LIST), "platform": "linux/arm64"},
            "db": {"image": format!("postgres@{}", SINGLE)}
        }});
        let images = referenced_images(&compose).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].service, "web");
        assert_eq!(images[0].platform.as_deref(), Some("linux/arm64"));
        assert_eq!(images[1].platform, None);
    }

    #[test]
    fn test_referenced_images_requires_digest() {
        let compose = json!({"services": {"web": {"image": "nginx:latest"}}});
        assert!(matches!(
            referenced_images(&compose),
            Err(LockboxError::InvalidData(_))
        ));
        assert!(referenced_images(&json!({"version": "3"})).is_err());
        assert!(referenced_images(&json!({"services": {"web": {}}})).is_err());
    }

    #[test]
    fn test_select_all_children_without_defaults() {
        let (multi, _, per_image) = manifests();
        let sel = select_images(&[(multi, None)], &per_image, None, TieBreak::Fail).unwrap();
        let digests: Vec<_> = sel.iter().map(|s| s.digest.as_str()).collect();
        assert_eq!(digests, vec![ARM, ARM64]);
    }

    #[test]
    fn test_select_default_platforms() {
        let (multi, _, per_image) = manifests();
        let platforms = defaults();
        let sel =
            select_images(&[(multi, None)], &per_image, Some(&platforms), TieBreak::Fail).unwrap();
        assert_eq!(sel.len(), 2);
        assert_eq!(sel[0].digest, ARM);
        assert_eq!(sel[0].platform.as_deref(), Some("linux/arm/v7"));
        assert_eq!(sel[1].digest, ARM64);
    }

    #[test]
    fn test_select_requested_platform() {
        let (multi, single, per_image) = manifests();
        let platforms = defaults();
        let pairs = vec![
            (multi, Some("linux/arm64".to_string())),
            (single, Some("linux/arm64".to_string())),
        ];
        let sel = select_images(&pairs, &per_image, Some(&platforms), TieBreak::Fail).unwrap();
        assert_eq!(sel.len(), 2);
        assert_eq!(sel[0].digest, ARM64);
        assert_eq!(sel[0].requested_platform.as_deref(), Some("linux/arm64"));
        assert_eq!(sel[1].digest, SINGLE);
    }

    #[test]
    fn test_select_missing_platform() {
        let (multi, _, per_image) = manifests();
        let pairs = vec![(multi, Some("linux/amd64".to_string()))];
        let err = select_images(&pairs, &per_image, None, TieBreak::Fail).unwrap_err();
        assert!(err.to_string().contains("linux/amd64"));
    }

    #[test]
    fn test_select_unknown_image() {
        let (_, _, per_image) = manifests();
        let pairs = vec![("ghcr.io/org/ghost@sha256:00".to_string(), None)];
        assert!(select_images(&pairs, &per_image, None, TieBreak::Fail).is_err());
    }

    #[test]
    fn test_select_unique_images_dedupes() {
        let (multi, single, per_image) = manifests();
        let platforms = defaults();
        let pairs = vec![
            (multi.clone(), None),
            (multi.clone(), None),
            (multi, Some("linux/arm/v7".to_string())),
            (single, None),
        ];
        let all = select_images(&pairs, &per_image, Some(&platforms), TieBreak::Fail).unwrap();
        assert_eq!(all.len(), 6);

        let unique =
            select_unique_images(&pairs, &per_image, Some(&platforms), TieBreak::Fail).unwrap();
        assert_eq!(unique.len(), 3);
        assert!(unique.contains(&(format!("ghcr.io/org/app@{}", ARM), ARM.to_string())));
        assert!(unique.contains(&(format!("ghcr.io/org/app@{}", ARM64), ARM64.to_string())));
        assert!(unique.contains(&(format!("ghcr.io/org/tool@{}", SINGLE), SINGLE.to_string())));
    }

    #[tokio::test]
    async fn test_build_image_archives() {
        let runtime = FakeContainerRuntime::default();
        let dir = tempfile::tempdir().unwrap();
        let mut unique = BTreeSet::new();
        unique.insert((format!("ghcr.io/org/tool@{}", SINGLE), SINGLE.to_string()));
        let logins = RegistryLogins::default()
            .with_default("hub", "pw")
            .with_registry("ghcr.io", "gh", "tok")
            .unwrap();

        let archives = build_image_archives(&runtime, &unique, dir.path(), &logins)
            .await
            .unwrap();
        assert_eq!(archives.len(), 1);
        let hex = SINGLE.strip_prefix("sha256:").unwrap();
        assert_eq!(archives[0].file, dir.path().join(format!("{}.tar", hex)));
        assert_eq!(archives[0].tag, format!("digest_sha256_{}", hex));
        assert!(archives[0].file.exists());

        let calls = runtime.calls();
        assert_eq!(calls[0], "login default hub");
        assert_eq!(calls[1], "login ghcr.io gh");
        assert_eq!(calls[2], format!("pull ghcr.io/org/tool@{}", SINGLE));
        assert_eq!(
            calls[3],
            format!("tag ghcr.io/org/tool@{} ghcr.io/org/tool:digest_sha256_{}", SINGLE, hex)
        );
    }

    #[tokio::test]
    async fn test_build_image_archives_rejects_non_sha256() {
        let runtime = FakeContainerRuntime::default();
        let dir = tempfile::tempdir().unwrap();
        let mut unique = BTreeSet::new();
        unique.insert(("ghcr.io/org/tool@md5:00".to_string(), "md5:00".to_string()));
        let result =
            build_image_archives(&runtime, &unique, dir.path(), &RegistryLogins::default()).await;
        assert!(result.is_err());
        assert!(runtime.calls().is_empty());
    }
}
