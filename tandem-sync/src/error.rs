//! Error types for the store and the sync layer.

use tandem_core::{ConfigError, ModelError};

/// Failures reported by a [`KeyValueStore`](crate::store::KeyValueStore).
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The connection to the store is down
    Disconnected,
    /// A transaction kept conflicting with concurrent commits
    RetriesExhausted { path: String, attempts: u32 },
    /// Empty or malformed path segment
    InvalidPath(String),
    /// Any other backend failure
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Store disconnected"),
            Self::RetriesExhausted { path, attempts } => {
                write!(f, "Transaction at '{path}' gave up after {attempts} attempts")
            }
            Self::InvalidPath(p) => write!(f, "Invalid store path: '{p}'"),
            Self::Backend(e) => write!(f, "Store backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors surfaced by the session and state operations.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    Store(StoreError),
    Model(ModelError),
    Config(ConfigError),
    /// A state operation was issued outside an active session
    NoActiveSession,
    /// `join_session` called while already in a session
    AlreadyJoined,
    /// The client's event loop has shut down
    ClientClosed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "{e}"),
            Self::Model(e) => write!(f, "{e}"),
            Self::Config(e) => write!(f, "{e}"),
            Self::NoActiveSession => write!(f, "No active session"),
            Self::AlreadyJoined => write!(f, "Already joined a session"),
            Self::ClientClosed => write!(f, "Session client closed"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Model(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<ModelError> for SyncError {
    fn from(e: ModelError) -> Self {
        Self::Model(e)
    }
}

impl From<ConfigError> for SyncError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
