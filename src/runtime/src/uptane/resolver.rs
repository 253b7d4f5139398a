//! Locating a target in the image-repository delegation tree.

use super::delegation::DelegationNode;
use super::metadata::Target;

/// Match `target` against the lookup criteria, warning on a hash hit whose
/// name or length disagrees.
fn target_matches(
    key: &str,
    target: &Target,
    sha256: &str,
    name: Option<&str>,
    length: Option<u64>,
) -> bool {
    if target.hashes.sha256 != sha256 {
        return false;
    }
    if let Some(name) = name {
        if key != name {
            tracing::warn!(
                sha256 = %sha256,
                expected = %name,
                found = %key,
                "Target found by hash but name does not match"
            );
            return false;
        }
    }
    if let Some(length) = length {
        if target.length != length {
            tracing::warn!(
                sha256 = %sha256,
                expected = length,
                found = target.length,
                "Target found by hash but length does not match"
            );
            return false;
        }
    }
    true
}

fn find_in_node<'a>(
    node: &'a DelegationNode,
    sha256: &str,
    name: Option<&str>,
    length: Option<u64>,
) -> Option<(&'a str, &'a Target)> {
    node.targets
        .iter()
        .find(|(key, target)| target_matches(key, target, sha256, name, length))
        .map(|(key, target)| (key.as_str(), target))
}

fn role_accepts(paths: &[String], name: &str) -> bool {
    paths.iter().any(|pattern| match glob::Pattern::new(pattern) {
        Ok(pattern) => pattern.matches(name),
        Err(e) => {
            tracing::debug!(pattern = %pattern, error = %e, "Ignoring invalid delegation path");
            false
        }
    })
}

fn find_in_delegations<'a>(
    node: &'a DelegationNode,
    sha256: &str,
    name: Option<&str>,
    length: Option<u64>,
) -> Option<(&'a str, &'a Target)> {
    for role in &node.roles {
        if let Some(name) = name {
            if !role_accepts(&role.paths, name) {
                tracing::debug!(name = %name, role = %role.name, paths = ?role.paths, "Name outside delegated paths");
                continue;
            }
        }
        let Some(child) = node.child(&role.name) else {
            continue;
        };
        if let Some(found) = find_in_node(child, sha256, name, length) {
            return Some(found);
        }
        if let Some(found) = find_in_delegations(child, sha256, name, length) {
            return Some(found);
        }
    }
    None
}

/// Find a target by hash, optionally also by name and length.
///
/// The top-level targets are searched first; then delegated roles in their
/// declared order, each one's own targets before its sub-delegations. When a
/// name is given, roles whose paths do not match it are skipped.
pub fn find_target<'a>(
    root: &'a DelegationNode,
    sha256: &str,
    name: Option<&str>,
    length: Option<u64>,
) -> Option<(&'a str, &'a Target)> {
    find_in_node(root, sha256, name, length)
        .or_else(|| find_in_delegations(root, sha256, name, length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uptane::delegation::load_delegated_targets;
    use serde_json::json;
    use std::path::Path;

    fn target(sha: &str, length: u64) -> serde_json::Value {
        json!({"hashes": {"sha256": sha}, "length": length,
               "custom": {"targetFormat": "BINARY"}})
    }

    fn write(dir: &Path, name: &str, targets: serde_json::Value, roles: serde_json::Value) {
        let doc = json!({"signed": {"_type": "Targets", "version": 1, "targets": targets,
                                    "delegations": {"keys": {}, "roles": roles}}});
        std::fs::write(dir.join(name), serde_json::to_vec(&doc).unwrap()).unwrap();
    }

    /// targets.json -> tdx-apps (paths: app-*) -> tdx-apps-beta (paths: *)
    ///              -> tdx-all (paths: *)
    fn tree(dir: &Path) -> DelegationNode {
        write(
            dir,
            "targets.json",
            json!({"root-target": target("r1", 10)}),
            json!([
                {"name": "tdx-apps", "paths": ["app-*"]},
                {"name": "tdx-all", "paths": ["*"]}
            ]),
        );
        write(
            dir,
            "tdx-apps.json",
            json!({"app-one": target("a1", 11)}),
            json!([{"name": "tdx-apps-beta", "paths": ["*"]}]),
        );
        write(
            dir,
            "tdx-apps-beta.json",
            json!({"app-two": target("a2", 12), "shared": target("s1", 13)}),
            json!([]),
        );
        write(
            dir,
            "tdx-all.json",
            json!({"other": target("o1", 14), "shared": target("s1", 13)}),
            json!([]),
        );
        load_delegated_targets(dir).unwrap()
    }

    #[test]
    fn test_top_level_target() {
        let dir = tempfile::tempdir().unwrap();
        let root = tree(dir.path());
        let (name, found) = find_target(&root, "r1", Some("root-target"), Some(10)).unwrap();
        assert_eq!(name, "root-target");
        assert_eq!(found.length, 10);
    }

    #[test]
    fn test_nested_delegation_reached_before_next_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let root = tree(dir.path());
        let (name, _) = find_target(&root, "a2", Some("app-two"), None).unwrap();
        assert_eq!(name, "app-two");

        // Without a name, depth-first order finds the copy under tdx-apps first
        let (name, _) = find_target(&root, "s1", None, None).unwrap();
        assert_eq!(name, "shared");
        let (_, found) = find_target(&root, "s1", None, Some(13)).unwrap();
        assert_eq!(found.hashes.sha256, "s1");
    }

    #[test]
    fn test_paths_filter_roles() {
        let dir = tempfile::tempdir().unwrap();
        let root = tree(dir.path());
        // "other" does not match app-*, so only tdx-all is consulted
        let (name, _) = find_target(&root, "o1", Some("other"), None).unwrap();
        assert_eq!(name, "other");
    }

    #[test]
    fn test_name_mismatch_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let root = tree(dir.path());
        assert!(find_target(&root, "r1", Some("wrong-name"), None).is_none());
    }

    #[test]
    fn test_length_mismatch_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let root = tree(dir.path());
        assert!(find_target(&root, "a1", Some("app-one"), Some(999)).is_none());
    }

    #[test]
    fn test_unknown_hash() {
        let dir = tempfile::tempdir().unwrap();
        let root = tree(dir.path());
        assert!(find_target(&root, "zz", None, None).is_none());
    }
}
