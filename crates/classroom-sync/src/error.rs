//! Error types for the classroom sync layer.

use thiserror::Error;

use crate::types::{EntityType, Generation};

/// Result alias used throughout the crate.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the sync layer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote store could not be reached (includes collaborator timeouts).
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    /// The remote store refused the operation for the acting user.
    #[error("remote store denied the operation: {0}")]
    RemotePermission(String),

    /// The remote store rejected the payload.
    #[error("remote store rejected the payload: {0}")]
    RemoteValidation(String),

    /// The on-device store failed to read or write.
    #[error("local store failure: {0}")]
    LocalStoreFailure(#[from] LocalStoreError),

    /// An async result finished after the active class changed.
    ///
    /// Never returned from public operations; kept so the discard path can be
    /// logged with the same vocabulary.
    #[error("result from generation {started} discarded (current generation {current})")]
    StaleGenerationDiscard {
        started: Generation,
        current: Generation,
    },

    /// A class-scoped operation was issued with no active class.
    #[error("no active class")]
    NoActiveClass,

    /// The targeted record does not exist in the active class.
    #[error("{entity_type} record not found: {id}")]
    EntityNotFound { entity_type: EntityType, id: String },

    /// A typed payload could not be converted to or from its JSON fields.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether the failure is absorbed by the local fallback path.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteUnavailable(_) | SyncError::RemotePermission(_)
        )
    }
}

/// Errors reported by a [`RemoteStore`](crate::remote::RemoteStore) implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failure or service outage.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The collaborator gave up waiting for the service.
    #[error("timed out")]
    Timeout,

    /// The acting user may not perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The document was refused by server-side validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The addressed document does not exist.
    #[error("document not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    /// Whether a mutation hitting this error should fall back to the local store.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RemoteError::Unavailable(_) | RemoteError::Timeout | RemoteError::PermissionDenied(_)
        )
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unavailable(msg) => SyncError::RemoteUnavailable(msg),
            RemoteError::Timeout => SyncError::RemoteUnavailable("timed out".to_string()),
            RemoteError::PermissionDenied(msg) => SyncError::RemotePermission(msg),
            RemoteError::Validation(msg) => SyncError::RemoteValidation(msg),
            RemoteError::NotFound(id) => {
                SyncError::RemoteValidation(format!("document not found: {id}"))
            }
        }
    }
}

/// Errors from a [`LocalStore`](crate::local_store::LocalStore).
#[derive(Debug, Error)]
pub enum LocalStoreError {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A document could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The persistence writer task is no longer running.
    #[error("local store writer stopped")]
    WriterStopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(RemoteError::Unavailable("offline".into()), true ; "unavailable")]
    #[test_case(RemoteError::Timeout, true ; "timeout")]
    #[test_case(RemoteError::PermissionDenied("rules".into()), true ; "permission")]
    #[test_case(RemoteError::Validation("title".into()), false ; "validation")]
    #[test_case(RemoteError::NotFound("doc-1".into()), false ; "not found")]
    fn test_remote_error_recoverability(err: RemoteError, recoverable: bool) {
        assert_eq!(err.is_recoverable(), recoverable);
        assert_eq!(SyncError::from(err).is_recoverable(), recoverable);
    }

    #[test]
    fn test_timeout_maps_to_unavailable() {
        assert!(matches!(
            SyncError::from(RemoteError::Timeout),
            SyncError::RemoteUnavailable(_)
        ));
    }
}
