//! Store error types.

use thiserror::Error;

/// Result type alias using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by store operations.
///
/// `Transient` failures are safe to retry; `PermissionDenied` is not and is
/// kept distinct so callers can redirect instead of looping.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Temporary failure (network hiccup, contention cap). Retryable.
    #[error("Transient store error: {0}")]
    Transient(String),

    /// The store's rules rejected the write for this caller.
    #[error("Permission denied at {path}")]
    PermissionDenied { path: String },

    /// The client connection backing this handle is gone.
    #[error("Store client disconnected")]
    Disconnected,

    /// A value failed to (de)serialize.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same operation can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
