//! Uptane metadata: download and validation, the image-repository delegation
//! tree, target lookup and the offline-update documents.

pub mod delegation;
pub mod metadata;
pub mod offline;
pub mod repo;
pub mod resolver;

pub use delegation::{load_delegated_targets, DelegatedRole, DelegationNode, MAX_DELEGATIONS};
pub use metadata::{
    check_safe_filename, FetchOptions, MetadataStore, ParseAs, SignedMetadata, Target,
    TargetCustom, TargetFormat,
};
pub use offline::{validate_offline_metadata, OfflineMetadata};
pub use repo::{fetch_director_metadata, fetch_image_repo_metadata, LockboxSource};
pub use resolver::find_target;
