//! Error types for registration and discovery operations.
//!
//! The variants follow where a failure happens rather than which backend
//! produced it, so callers can tell a fatal startup problem from a transient
//! store hiccup without knowing anything about the store's client library.

use thiserror::Error;

/// Top-level error type for the coordination crate.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The coordination store could not be reached at startup (DNS, dial
    /// timeout, auth).
    #[error("connect error: {0}")]
    Connect(String),

    /// The process-wide client was used before `init_default`.
    #[error("default coordination client not initialized")]
    NotInitialized,

    /// Granting or revoking a lease failed.
    #[error("lease error: {0}")]
    Lease(String),

    /// Opening or driving a lease keepalive stream failed.
    #[error("keepalive error: {0}")]
    KeepAlive(String),

    /// Writing or deleting a key failed.
    #[error("write error: {0}")]
    Write(String),

    /// Reading a key or prefix failed.
    #[error("read error: {0}")]
    Read(String),

    /// A watch could not be opened or terminated unexpectedly.
    #[error("watch error: {0}")]
    Watch(String),

    /// The consumer rejected an address-set update.
    #[error("push error: {0}")]
    Push(String),

    /// Any other transport-level failure talking to the store.
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid input or configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The client handle has been closed.
    #[error("coordination client closed")]
    Closed,
}

impl CoordinationError {
    /// Returns true if this error indicates a transient failure that the
    /// resolver loop absorbs and retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::Read(_)
                | CoordinationError::Watch(_)
                | CoordinationError::Push(_)
                | CoordinationError::Transport(_)
        )
    }

    /// Returns true if this error should abort startup of the calling
    /// component.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            CoordinationError::Connect(_)
                | CoordinationError::NotInitialized
                | CoordinationError::Config(_)
        )
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
