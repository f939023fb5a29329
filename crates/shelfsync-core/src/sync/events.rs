//! Reconciler phases and notifications

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{RemoteError, SyncError};
use crate::models::{EntityId, Fields, MutationKind, SyncCursor};

/// Where the reconciler is in its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Pushing,
    Pulling,
    /// The last pass hit a fatal remote error
    Failed,
}

/// Why a pass started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Startup,
    CameOnline,
    Requested,
    Periodic,
    Retry,
}

/// Summary of one completed pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassReport {
    pub pushed: usize,
    pub merged: usize,
    pub conflicts: usize,
    pub exhausted: usize,
    pub pulled: usize,
    pub cursor: SyncCursor,
    /// A transient failure cut the pass short; retry after this delay
    pub retry_after: Option<Duration>,
}

impl PassReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts == 0 && self.exhausted == 0 && self.retry_after.is_none()
    }
}

/// Notifications delivered to `on_sync_event` listeners
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Started {
        trigger: SyncTrigger,
    },
    Completed(PassReport),
    /// A merge resubmission conflicted again; the local change was dropped
    Conflict {
        entity_id: EntityId,
        mutation_id: Uuid,
        kind: MutationKind,
        /// The local change as originally enqueued
        payload: Fields,
    },
    /// A mutation ran out of retries and was dropped
    Exhausted {
        entity_id: EntityId,
        mutation_id: Uuid,
        kind: MutationKind,
        attempts: u32,
        last_error: RemoteError,
    },
    /// The pass was aborted; the failing mutation was left untouched
    Failed {
        error: SyncError,
    },
    /// Connectivity dropped mid-pass
    Interrupted,
}

/// How a call to `reconcile` ended
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// Offline; no pass was started
    Skipped,
    Completed(PassReport),
    Interrupted,
    Failed(SyncError),
}

impl PassOutcome {
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            PassOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}
