//! Error taxonomy
//!
//! Enqueue-time failures are returned as [`EnqueueError`] and nothing is
//! queued. Remote failures are classified by [`RemoteError`]; the reconciler
//! turns them into retries or [`crate::sync::SyncEvent`]s rather than
//! propagating them to callers.

use thiserror::Error;

use crate::models::{EntityId, MutationKind};
use crate::permissions::Action;
use crate::storage::StorageError;

/// Why a mutation was refused at enqueue
#[derive(Error, Debug)]
pub enum EnqueueError {
    /// Malformed mutation
    #[error("Invalid {kind} for {entity_id}: {reason}")]
    Validation {
        entity_id: EntityId,
        kind: MutationKind,
        reason: String,
    },

    /// The acting role lacks the required permission
    #[error("Permission denied: '{action}' is required to {kind} {entity_id}")]
    PermissionDenied {
        entity_id: EntityId,
        kind: MutationKind,
        action: Action,
    },

    /// The mutation was valid but could not be persisted
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EnqueueError {
    pub fn validation(entity_id: &EntityId, kind: MutationKind, reason: impl Into<String>) -> Self {
        EnqueueError::Validation {
            entity_id: entity_id.clone(),
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, EnqueueError::Validation { .. })
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, EnqueueError::PermissionDenied { .. })
    }
}

/// Failures reported by the remote store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network error or timeout; safe to retry
    #[error("Transient remote error: {0}")]
    Transient(String),

    /// Non-retryable failure such as a schema mismatch
    #[error("Fatal remote error: {0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Why a reconciliation pass was aborted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The local store rejected a write mid-pass
    #[error("Local storage failed during sync: {0}")]
    Storage(String),
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::Storage(err.to_string())
    }
}
