//! Platform strings and compatibility grading for multi-platform images.
//!
//! A platform is written `os/arch[/variant][/os.version]`. Matching grades
//! how many leading components two platforms share.

use lockbox_core::config::TieBreak;
use lockbox_core::error::{LockboxError, Result};
use serde::Deserialize;

use super::registry::ManifestInfo;

/// Platform object of a manifest-list entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PlatformSpec {
    pub os: String,
    pub architecture: String,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default, rename = "os.version")]
    pub os_version: Option<String>,
}

impl PlatformSpec {
    /// Render as `os/arch[/variant][/os.version]`.
    pub fn platform_str(&self) -> String {
        let mut parts = vec![self.os.as_str(), self.architecture.as_str()];
        if let Some(variant) = self.variant.as_deref().filter(|v| !v.is_empty()) {
            parts.push(variant);
        }
        if let Some(version) = self.os_version.as_deref().filter(|v| !v.is_empty()) {
            parts.push(version);
        }
        parts.join("/")
    }
}

/// Grade how well `candidate` matches `requested`.
///
/// Both strings lose one trailing `/` before splitting. Returns whether one
/// platform is a prefix of the other, and the number of leading components
/// the two share before the first mismatch.
pub fn platform_matches(candidate: &str, requested: &str) -> (bool, usize) {
    let a = strip_one_slash(candidate).split('/');
    let b = strip_one_slash(requested).split('/');
    let mut grade = 0;
    for (x, y) in a.zip(b) {
        if x != y {
            return (false, grade);
        }
        grade += 1;
    }
    (true, grade)
}

fn strip_one_slash(platform: &str) -> &str {
    platform.strip_suffix('/').unwrap_or(platform)
}

/// Whether `platform` matches any entry of `requested`.
pub fn platform_in<S: AsRef<str>>(platform: &str, requested: &[S]) -> bool {
    requested
        .iter()
        .any(|req| platform_matches(platform, req.as_ref()).0)
}

/// Manifests compatible with `platform`, in listing order, with their grade.
pub fn compatible_images<'a>(
    manifests: &'a [ManifestInfo],
    platform: &str,
) -> Vec<(usize, &'a ManifestInfo)> {
    manifests
        .iter()
        .filter_map(|man| {
            let candidate = man.platform.as_deref()?;
            match platform_matches(candidate, platform) {
                (true, grade) => Some((grade, man)),
                (false, _) => None,
            }
        })
        .collect()
}

/// Compatible manifests sorted best first.
///
/// When the two best candidates share a grade the tie is resolved by
/// `tie_break`: either an error, or the first listed candidate stays first.
pub fn rank_compatible_images<'a>(
    manifests: &'a [ManifestInfo],
    platform: &str,
    tie_break: TieBreak,
) -> Result<Vec<&'a ManifestInfo>> {
    let mut graded = compatible_images(manifests, platform);
    // Stable: equally graded manifests keep their listing order
    graded.sort_by(|a, b| b.0.cmp(&a.0));

    if graded.len() >= 2 && graded[0].0 == graded[1].0 {
        match tie_break {
            TieBreak::Fail => {
                return Err(LockboxError::InvalidData(format!(
                    "Multiple images are equally appropriate for platform {} ({} and {})",
                    platform, graded[0].1.digest, graded[1].1.digest
                )));
            }
            TieBreak::FirstListed => {
                tracing::warn!(
                    platform = %platform,
                    digest = %graded[0].1.digest,
                    "Multiple images equally appropriate for platform; using the first listed"
                );
            }
        }
    }

    Ok(graded.into_iter().map(|(_, man)| man).collect())
}
