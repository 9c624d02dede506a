//! Error types for the penlite controller.
//!
//! Every failure that crosses the public API is a `PenliteError`. Native
//! results are classified here once and never re-wrapped downstream.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type PenliteResult<T> = Result<T, PenliteError>;

/// Controller error kinds.
///
/// The lifecycle-facing variants map 1:1 to operation outcomes:
///
/// - `InvalidTransition`: the requested operation is not valid from the
///   instance's current state. Not retried; the caller must adjust.
/// - `PermissionDenied`: capability gate refusal. Terminal for the
///   operation, never silently downgraded.
/// - `NativeCallFailed`: the native layer returned failure. The instance
///   moves to `Error` and is not auto-retried.
/// - `Timeout`: the deadline elapsed. The operation is still tracked to
///   completion internally; the caller may resubmit.
/// - `IndeterminateState`: a handle was reused after a failed call or the
///   native side is in an unknown condition. Recovery requires
///   destroy-and-recreate, not retry.
/// - `Cancelled`: the operation's cancellation token fired (or a destroy
///   superseded it) before the native call started.
#[derive(Debug, Error)]
pub enum PenliteError {
    /// Operation not valid from the current lifecycle state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Capability gate refused the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The native runtime layer returned a failure status.
    #[error("native call failed: {op} (code {code}){}", .detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    NativeCallFailed {
        /// Native operation that failed.
        op: String,
        /// Status code returned by the native layer.
        code: i32,
        /// Optional error detail from the native layer.
        detail: Option<String>,
    },

    /// Deadline elapsed before the operation completed.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Native-side state is unknown; destroy and recreate the instance.
    #[error("indeterminate native state: {0}")]
    IndeterminateState(String),

    /// Operation was cancelled before reaching the native layer.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// No instance registered under this name.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// An instance with this name is already registered.
    #[error("instance already exists: {0}")]
    AlreadyExists(String),

    /// Persistence layer failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration or options.
    #[error("config error: {0}")]
    Config(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PenliteError {
    /// True for errors that indicate the instance itself is unusable
    /// (as opposed to a rejected or expired request).
    pub fn is_instance_fault(&self) -> bool {
        matches!(
            self,
            PenliteError::NativeCallFailed { .. } | PenliteError::IndeterminateState(_)
        )
    }
}

impl From<rusqlite::Error> for PenliteError {
    fn from(e: rusqlite::Error) -> Self {
        PenliteError::Storage(e.to_string())
    }
}
