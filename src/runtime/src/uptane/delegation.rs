//! Tree of targets metadata linked by delegations.

use std::collections::HashMap;
use std::path::Path;

use lockbox_core::error::{LockboxError, Result};

use super::metadata::{
    check_safe_filename, parse_targets, ParseAs, SignedMetadata, Target, TARGETS_METADATA_MAXLEN,
};

/// Most delegated targets files loaded for one tree.
pub const MAX_DELEGATIONS: usize = 32;

const TARGETS_TYPE: &str = "Targets";
const TOP_LEVEL_TARGETS: &str = "targets.json";

/// A role delegated by a targets file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegatedRole {
    pub name: String,
    /// fnmatch-style target path patterns
    pub paths: Vec<String>,
}

/// One targets file with the files it delegates to.
#[derive(Debug, Clone)]
pub struct DelegationNode {
    pub metadata: SignedMetadata,
    /// Targets in declared order
    pub targets: Vec<(String, Target)>,
    /// Delegated roles in declared order
    pub roles: Vec<DelegatedRole>,
    pub children: HashMap<String, DelegationNode>,
}

impl DelegationNode {
    fn from_metadata(metadata: SignedMetadata) -> Result<Self> {
        if metadata.meta_type() != Some(TARGETS_TYPE) {
            return Err(LockboxError::InvalidData(format!(
                "{} is not targets metadata (type {:?})",
                metadata.file.display(),
                metadata.meta_type()
            )));
        }
        let targets = parse_targets(metadata.signed())?;
        let roles = parse_roles(metadata.signed())?;
        Ok(Self {
            metadata,
            targets,
            roles,
            children: HashMap::new(),
        })
    }

    /// Child node of a delegated role.
    pub fn child(&self, role: &str) -> Option<&DelegationNode> {
        self.children.get(role)
    }

    /// Number of targets files in the tree, this one included.
    pub fn file_count(&self) -> usize {
        1 + self.children.values().map(|c| c.file_count()).sum::<usize>()
    }
}

fn parse_roles(signed: &serde_json::Value) -> Result<Vec<DelegatedRole>> {
    let Some(roles) = signed["delegations"]["roles"].as_array() else {
        return Ok(Vec::new());
    };
    roles
        .iter()
        .map(|role| {
            let name = role["name"].as_str().ok_or_else(|| {
                LockboxError::InvalidData("Delegated role without a name".to_string())
            })?;
            let paths = role["paths"]
                .as_array()
                .map(|paths| {
                    paths
                        .iter()
                        .filter_map(|p| p.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            Ok(DelegatedRole {
                name: name.to_string(),
                paths,
            })
        })
        .collect()
}

/// Load `targets.json` from `source_dir` and every targets file it
/// delegates to, depth-first.
pub fn load_delegated_targets(source_dir: &Path) -> Result<DelegationNode> {
    let metadata = SignedMetadata::load(
        &source_dir.join(TOP_LEVEL_TARGETS),
        ParseAs::Json,
        TARGETS_METADATA_MAXLEN,
    )?;
    let mut root = DelegationNode::from_metadata(metadata)?;
    let mut loaded = 0;
    load_children(&mut root, source_dir, &mut loaded)?;
    tracing::debug!(files = loaded, "Loaded delegated targets");
    Ok(root)
}

fn load_children(node: &mut DelegationNode, source_dir: &Path, loaded: &mut usize) -> Result<()> {
    for role in node.roles.clone() {
        if node.children.contains_key(&role.name) {
            continue;
        }
        if *loaded >= MAX_DELEGATIONS {
            return Err(LockboxError::InvalidData(format!(
                "Too many delegated targets files (more than {})",
                MAX_DELEGATIONS
            )));
        }
        check_safe_filename(&role.name)?;

        let path = source_dir.join(format!("{}.json", role.name));
        let metadata = SignedMetadata::load(&path, ParseAs::Json, TARGETS_METADATA_MAXLEN)?;
        *loaded += 1;

        let mut child = DelegationNode::from_metadata(metadata)?;
        load_children(&mut child, source_dir, loaded)?;
        node.children.insert(role.name, child);
    }
    Ok(())
}
