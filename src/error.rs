//! Error types for the stack controller

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The Stack spec itself is invalid; retrying will not help until it changes
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A child object with the desired name belongs to someone else
    #[error("{child} is not owned by stack {stack} (owner: {owner})")]
    OwnershipConflict {
        child: String,
        stack: String,
        owner: String,
    },

    /// A stored revision no longer matches its recorded content
    #[error("revision {0} was mutated")]
    RevisionMutated(u64),

    /// A listener never completed its initial list+watch handshake
    #[error("Cache sync failed: {0}")]
    SyncError(String),

    /// A guarded patch found the object changed since it was read
    #[error("{0} changed since it was observed")]
    StaleObject(String),

    #[error("Conversion error: {0}")]
    ConversionError(String),
}

impl Error {
    /// Whether requeueing the same key may succeed without a spec change.
    ///
    /// Conflicts on resourceVersion (409), throttling (429) and server-side
    /// failures are transient; everything the user must fix is not.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => {
                resp.code == 409 || resp.code == 429 || resp.code >= 500
            }
            Error::KubeError(kube::Error::SerdeError(_)) => false,
            Error::KubeError(_) => true,
            Error::SyncError(_) | Error::StaleObject(_) => true,
            Error::SerializationError(_)
            | Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::OwnershipConflict { .. }
            | Error::RevisionMutated(_)
            | Error::ConversionError(_) => false,
        }
    }

    /// Short label used for the error counter
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::OwnershipConflict { .. } => "conflict",
            Error::RevisionMutated(_) => "revision",
            Error::SyncError(_) => "sync",
            Error::StaleObject(_) => "stale",
            Error::ConversionError(_) => "conversion",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
