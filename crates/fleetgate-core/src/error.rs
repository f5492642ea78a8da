//! Error types for core operations

use fleetgate_store::StoreError;
use fleetgate_util::SessionId;
use thiserror::Error;

/// Core error taxonomy. Every engine operation returns one of these;
/// the transport layer maps each variant to a user-visible status and
/// must not add semantics of its own.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Identity resolution failed.
    #[error("not authenticated")]
    NotAuthenticated,

    /// A referenced identity, machine, or session does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The authenticated identity lacks rights for the request.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Uniqueness violation, or a refused insert under the
    /// single-open-session invariant.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A close was attempted on a session that is already closed.
    #[error("session {0} is already closed")]
    AlreadyClosed(SessionId),

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => CoreError::Conflict(msg),
            StoreError::NotFound(what) => CoreError::NotFound(what),
            other => CoreError::Store(other.to_string()),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
