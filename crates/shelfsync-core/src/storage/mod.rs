//! Storage layer
//!
//! Durable, process-local persistence of entity snapshots, the mutation log
//! and the sync cursor.
//!
//! ## Architecture
//!
//! - **`LocalStore`**: the narrow interface the rest of the core depends on.
//!   A store loads everything once at startup and then receives atomic
//!   [`WriteBatch`]es; it never needs to answer queries.
//! - **SQLite**: the stock implementation, one transaction per batch.

pub mod error;
pub mod schema;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use schema::{migrate, SCHEMA_VERSION};
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{EntityId, EntitySnapshot, MutationRecord, SyncCursor};

/// Everything persisted by a store
#[derive(Debug, Default, Clone)]
pub struct PersistedState {
    pub snapshots: Vec<EntitySnapshot>,
    /// Ordered by `seq`
    pub mutations: Vec<MutationRecord>,
    pub cursor: SyncCursor,
    /// End of the last completed sync pass
    pub last_synced: Option<DateTime<Utc>>,
}

/// One logical write, applied atomically
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    pub put_snapshots: Vec<EntitySnapshot>,
    pub remove_snapshots: Vec<EntityId>,
    pub put_mutations: Vec<MutationRecord>,
    pub remove_mutations: Vec<Uuid>,
    pub cursor: Option<SyncCursor>,
    pub last_synced: Option<DateTime<Utc>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.put_snapshots.is_empty()
            && self.remove_snapshots.is_empty()
            && self.put_mutations.is_empty()
            && self.remove_mutations.is_empty()
            && self.cursor.is_none()
            && self.last_synced.is_none()
    }

    pub fn put_snapshot(&mut self, snapshot: EntitySnapshot) -> &mut Self {
        self.remove_snapshots.retain(|id| *id != snapshot.id);
        self.put_snapshots.retain(|s| s.id != snapshot.id);
        self.put_snapshots.push(snapshot);
        self
    }

    pub fn remove_snapshot(&mut self, id: EntityId) -> &mut Self {
        self.put_snapshots.retain(|s| s.id != id);
        if !self.remove_snapshots.contains(&id) {
            self.remove_snapshots.push(id);
        }
        self
    }

    pub fn put_mutation(&mut self, record: MutationRecord) -> &mut Self {
        self.put_mutations.retain(|r| r.id != record.id);
        self.put_mutations.push(record);
        self
    }

    pub fn remove_mutation(&mut self, id: Uuid) -> &mut Self {
        self.put_mutations.retain(|r| r.id != id);
        if !self.remove_mutations.contains(&id) {
            self.remove_mutations.push(id);
        }
        self
    }

    pub fn set_cursor(&mut self, cursor: SyncCursor) -> &mut Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn set_last_synced(&mut self, at: DateTime<Utc>) -> &mut Self {
        self.last_synced = Some(at);
        self
    }
}

/// Durable local persistence
pub trait LocalStore: Send {
    /// Read the full persisted state
    fn load(&self) -> StorageResult<PersistedState>;

    /// Apply a batch atomically: either every change lands or none does
    fn commit(&mut self, batch: &WriteBatch) -> StorageResult<()>;
}
