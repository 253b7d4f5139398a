//! Lockbox Core - Foundational Types
//!
//! Error taxonomy, build configuration and the fixed lockbox layout shared
//! by the runtime and the CLI.

pub mod config;
pub mod error;
pub mod layout;

// Re-export commonly used types
pub use config::{BuildConfig, RegistryLogin, RegistryLogins, TieBreak, DEFAULT_PLATFORMS};
pub use error::{LockboxError, Result};
pub use layout::LockboxLayout;

/// Lockbox version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
