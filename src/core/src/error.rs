use thiserror::Error;

/// HTTP status: not found.
const STATUS_NOT_FOUND: u16 = 404;

/// HTTP status: failed dependency (returned for root versions not yet minted).
const STATUS_FAILED_DEPENDENCY: u16 = 424;

/// Lockbox error types
#[derive(Error, Debug)]
pub enum LockboxError {
    /// Server answered with a non-2xx status
    #[error("Fetch failed: {url} -> {status_code}")]
    Fetch { url: String, status_code: u16 },

    /// Digest, length, type or expiry mismatch
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Target referenced by the director is absent from the image repository
    #[error("Could not find target '{name}' in image-repo metadata")]
    TargetNotFound { name: String },

    /// Token exchange with the auth server failed
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// External tool (ostree, docker) failed
    #[error("{tool} failed: {message}")]
    Collaborator { tool: String, message: String },

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Bad user input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Precondition on the filesystem not met
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Build interrupted by a signal
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl LockboxError {
    /// Whether this is a "not found"-class fetch failure.
    ///
    /// Root version enumeration stops on these instead of failing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LockboxError::Fetch { status_code, .. }
                if *status_code == STATUS_NOT_FOUND || *status_code == STATUS_FAILED_DEPENDENCY
        )
    }

    /// HTTP status carried by a fetch failure, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            LockboxError::Fetch { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for LockboxError {
    fn from(err: serde_json::Error) -> Self {
        LockboxError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for LockboxError {
    fn from(err: serde_yaml::Error) -> Self {
        LockboxError::Serialization(err.to_string())
    }
}

/// Result type alias for lockbox operations
pub type Result<T> = std::result::Result<T, LockboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let error = LockboxError::Fetch {
            url: "https://ota.example/api/v1/user_repo/snapshot.json".to_string(),
            status_code: 500,
        };
        assert_eq!(
            error.to_string(),
            "Fetch failed: https://ota.example/api/v1/user_repo/snapshot.json -> 500"
        );
    }

    #[test]
    fn test_not_found_class() {
        let not_found = LockboxError::Fetch {
            url: "u".to_string(),
            status_code: 404,
        };
        let failed_dep = LockboxError::Fetch {
            url: "u".to_string(),
            status_code: 424,
        };
        let server = LockboxError::Fetch {
            url: "u".to_string(),
            status_code: 503,
        };
        assert!(not_found.is_not_found());
        assert!(failed_dep.is_not_found());
        assert!(!server.is_not_found());
        assert!(!LockboxError::InvalidData("x".to_string()).is_not_found());
    }

    #[test]
    fn test_status_code() {
        let error = LockboxError::Fetch {
            url: "u".to_string(),
            status_code: 401,
        };
        assert_eq!(error.status_code(), Some(401));
        assert_eq!(LockboxError::Other("x".to_string()).status_code(), None);
    }

    #[test]
    fn test_target_not_found_display() {
        let error = LockboxError::TargetNotFound {
            name: "app-v1".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Could not find target 'app-v1' in image-repo metadata"
        );
    }

    #[test]
    fn test_collaborator_error_display() {
        let error = LockboxError::Collaborator {
            tool: "ostree".to_string(),
            message: "exit status 1".to_string(),
        };
        assert_eq!(error.to_string(), "ostree failed: exit status 1");
    }

    #[test]
    fn test_registry_error_display() {
        let error = LockboxError::Registry {
            registry: "ghcr.io".to_string(),
            message: "Authentication failed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: ghcr.io - Authentication failed"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: LockboxError = io_error.into();
        assert!(matches!(error, LockboxError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope");
        let error: LockboxError = result.unwrap_err().into();
        assert!(matches!(error, LockboxError::Serialization(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: LockboxError = result.unwrap_err().into();
        assert!(matches!(error, LockboxError::Serialization(_)));
    }
}
