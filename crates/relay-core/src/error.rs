//! Error taxonomy for the transfer engine.

use std::path::PathBuf;

use forge_client::ForgeError;
use relay_state::StateError;

/// Errors produced while packing or ingesting a bundle.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("unsupported manifest format version: {0}")]
    UnsupportedVersion(String),

    #[error("bundle has no manifest.json under {}", .0.display())]
    MissingManifest(PathBuf),

    #[error("corrupt bundle {}: {detail}", .path.display())]
    CorruptBundle { path: PathBuf, detail: String },

    #[error("no mapping for repository '{0}'")]
    Unmapped(String),

    #[error("source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("corrupt source repository: {0}")]
    CorruptSource(String),

    #[error("ref {refname} has diverged on the destination and force-push is disabled")]
    DivergedRef { refname: String },

    #[error("push to {target} rejected: {detail}")]
    PushRejected { target: String, detail: String },

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("permission denied: missing '{capability}' capability")]
    PermissionDenied { capability: String },

    #[error("no artifacts: {0}")]
    NoArtifacts(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("job cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("forge error: {0}")]
    Forge(ForgeError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

impl TransferError {
    /// Whether retrying the failed call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::SourceUnreachable(_) | TransferError::Timeout { .. } => true,
            TransferError::Forge(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<ForgeError> for TransferError {
    fn from(err: ForgeError) -> Self {
        match err {
            ForgeError::Forbidden { capability } => TransferError::PermissionDenied { capability },
            ForgeError::Unauthorized(msg) => TransferError::AuthenticationFailed(msg),
            other => TransferError::Forge(other),
        }
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(err: tokio::task::JoinError) -> Self {
        TransferError::Task(err.to_string())
    }
}

/// Result type for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;
