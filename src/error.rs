//! Error types for the OpenLDAP operator

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// A write lost an optimistic-concurrency race against another writer
    #[error("Conflict writing {kind} {name}: object was modified concurrently")]
    Conflict { kind: String, name: String },

    /// Failover found no alive and ready unit to promote
    #[error("No healthy unit available to promote in cluster {cluster}")]
    NoHealthyUnit { cluster: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

impl Error {
    /// Whether the error is worth retrying on the short backoff schedule
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => e.code >= 500 || e.code == 429,
            Error::KubeError(_) => true,
            Error::Conflict { .. } => true,
            Error::NoHealthyUnit { .. } => true,
            Error::SerializationError(_)
            | Error::ValidationError(_)
            | Error::ConfigError(_)
            | Error::MissingField(_) => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "InternalError".to_string(),
            code,
        }))
    }

    #[test]
    fn test_server_errors_are_retriable() {
        assert!(api_error(500).is_retriable());
        assert!(api_error(429).is_retriable());
        assert!(!api_error(403).is_retriable());
    }

    #[test]
    fn test_conflict_is_retriable() {
        let err = Error::Conflict {
            kind: "OpenldapCluster".to_string(),
            name: "ldap".to_string(),
        };
        assert!(err.is_retriable());
        assert!(err.is_conflict());
    }

    #[test]
    fn test_validation_is_not_retriable() {
        assert!(!Error::ValidationError("bad".to_string()).is_retriable());
        assert!(!Error::MissingField("metadata.name").is_retriable());
    }
}
