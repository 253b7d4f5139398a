//! Ownership normalization of a finished bundle.

use std::path::Path;

use lockbox_core::error::Result;

/// Give every entry under `root` the owner and group of `root`'s parent
/// directory. Without the privilege to change ownership this is a no-op.
#[cfg(unix)]
pub fn normalize_ownership(root: &Path) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let parent = match root.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let owner = std::fs::metadata(parent)?;
    let (uid, gid) = (owner.uid(), owner.gid());

    let current = std::fs::symlink_metadata(root)?;
    if current.uid() == uid && current.gid() == gid {
        tracing::debug!(dir = %root.display(), "Ownership already matches parent");
        return Ok(());
    }

    match std::os::unix::fs::lchown(root, Some(uid), Some(gid)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            tracing::debug!(dir = %root.display(), "Not permitted to change ownership; skipping");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }
    chown_tree(root, uid, gid)?;
    tracing::info!(dir = %root.display(), uid, gid, "Normalized ownership");
    Ok(())
}

#[cfg(unix)]
fn chown_tree(dir: &Path, uid: u32, gid: u32) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        std::os::unix::fs::lchown(&path, Some(uid), Some(gid))?;
        if entry.file_type()?.is_dir() {
            chown_tree(&path, uid, gid)?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn normalize_ownership(_root: &Path) -> Result<()> {
    Ok(())
}
