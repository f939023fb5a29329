//! Remote store interface
//!
//! The reconciler talks to the authoritative server only through
//! [`RemoteStore`]. Transports live outside the core.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RemoteError;
use crate::models::{EntityId, Fields, MutationKind, SyncCursor};

/// One mutation submitted to the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub entity_id: EntityId,
    pub kind: MutationKind,
    pub payload: Fields,
    /// Repeating a token must not apply the mutation twice
    pub idempotency_token: Uuid,
    /// Revision the client last saw for this entity (0 if never)
    pub base_revision: u64,
    /// Resubmission after a conflict, built on top of the server state
    pub merge: bool,
}

/// Server view of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub entity_id: EntityId,
    pub revision: u64,
    pub payload: Fields,
    #[serde(default)]
    pub deleted: bool,
}

/// Successful replies to a push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PushOutcome {
    Acknowledged { revision: u64 },
    /// The entity changed on the server since `base_revision`
    Conflict { server: RemoteEntity },
}

/// Authoritative remote store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn push(&self, request: PushRequest) -> Result<PushOutcome, RemoteError>;

    /// Entities changed after `cursor`, in revision order
    async fn pull_since(&self, cursor: SyncCursor) -> Result<Vec<RemoteEntity>, RemoteError>;
}
