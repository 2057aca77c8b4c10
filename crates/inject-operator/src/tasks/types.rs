use crate::tasks::config::OperatorConfig;
use crate::tasks::engine::Engine;
use kube::Client;
use std::sync::Arc;
use thiserror::Error;

// Error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Remote executor error: {0}")]
    RemoteError(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported fault: {0}")]
    UnsupportedFault(String),

    #[error("has other running cluster task, please retry later")]
    ClusterTaskBusy,

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("Reconcile panicked: {0}")]
    ReconcilePanicked(String),
}

impl Error {
    /// Transport-level failure worth retrying until the experiment times out
    #[must_use]
    pub fn is_network(&self) -> bool {
        match self {
            Error::NetworkError(_) => true,
            Error::KubeError(kube::Error::HyperError(_) | kube::Error::Service(_)) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }

    /// The action was already applied under the same uid
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(response)) => response.code == 409,
            Error::RemoteError(message) => message.contains("UNIQUE") && message.contains("uid"),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Error::NetworkError(err.to_string())
        } else {
            Error::RemoteError(err.to_string())
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// Context for the experiment controller
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub config: Arc<OperatorConfig>,
    pub engine: Arc<Engine>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: String::new(),
            code,
        }))
    }

    #[test]
    fn test_not_found_classification() {
        assert!(api_error(404).is_not_found());
        assert!(Error::NotFound("task".to_string()).is_not_found());
        assert!(!api_error(500).is_not_found());
    }

    #[test]
    fn test_conflict_classification() {
        assert!(api_error(409).is_conflict());
        assert!(Error::RemoteError(
            "err code: 1, err msg: UNIQUE constraint failed: experiment.uid".to_string()
        )
        .is_conflict());
        assert!(!Error::RemoteError("UNIQUE constraint failed: name".to_string()).is_conflict());
    }

    #[test]
    fn test_network_classification() {
        assert!(Error::NetworkError("connection refused".to_string()).is_network());
        assert!(!api_error(500).is_network());
        assert!(!Error::RemoteError("bad".to_string()).is_network());
    }
}
