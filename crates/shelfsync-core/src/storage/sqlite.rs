//! SQLite-backed local store
//!
//! Every [`WriteBatch`] is applied in a single transaction, so a crash
//! mid-write leaves either the old or the new state on disk, never a mix.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use super::schema::migrate;
use super::{LocalStore, PersistedState, WriteBatch};
use crate::config::Config;
use crate::models::{
    EntityId, EntitySnapshot, Fields, MutationKind, MutationRecord, SyncCursor,
};

const CURSOR_KEY: &str = "cursor";
const LAST_SYNCED_KEY: &str = "last_synced";

/// Local store persisted in a SQLite database
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the database configured for this installation
    pub fn open(config: &Config) -> StorageResult<Self> {
        Self::open_path(&config.sqlite_path())
    }

    /// Open or create a database at a specific path
    pub fn open_path(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
        }

        Self::prepare(Connection::open(path)?)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> StorageResult<Self> {
        migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn load_snapshots(&self) -> StorageResult<Vec<EntitySnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, revision, payload, confirmed, dirty, deleted, updated_at
             FROM snapshots ORDER BY entity_id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(SnapshotRow {
                entity_id: row.get(0)?,
                revision: row.get(1)?,
                payload: row.get(2)?,
                confirmed: row.get(3)?,
                dirty: row.get(4)?,
                deleted: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?.hydrate()?);
        }
        Ok(snapshots)
    }

    fn load_mutations(&self) -> StorageResult<Vec<MutationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, seq, entity_id, kind, payload, client_timestamp, attempts, dispatched
             FROM mutations ORDER BY seq",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(MutationRow {
                id: row.get(0)?,
                seq: row.get(1)?,
                entity_id: row.get(2)?,
                kind: row.get(3)?,
                payload: row.get(4)?,
                client_timestamp: row.get(5)?,
                attempts: row.get(6)?,
                dispatched: row.get(7)?,
            })
        })?;

        let mut mutations = Vec::new();
        for row in rows {
            mutations.push(row?.hydrate()?);
        }
        Ok(mutations)
    }

    fn load_meta(&self, key: &str) -> StorageResult<Option<String>> {
        let value: Option<String> = self
            .conn
            .query_row("SELECT value FROM sync_meta WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn load_cursor(&self) -> StorageResult<SyncCursor> {
        match self.load_meta(CURSOR_KEY)? {
            None => Ok(SyncCursor::default()),
            Some(v) => v
                .parse()
                .map(SyncCursor)
                .map_err(|e| StorageError::corrupt("sync_meta", CURSOR_KEY, e)),
        }
    }

    fn load_last_synced(&self) -> StorageResult<Option<DateTime<Utc>>> {
        self.load_meta(LAST_SYNCED_KEY)?
            .map(|v| parse_timestamp("sync_meta", LAST_SYNCED_KEY, &v))
            .transpose()
    }
}

impl LocalStore for SqliteStore {
    fn load(&self) -> StorageResult<PersistedState> {
        Ok(PersistedState {
            snapshots: self.load_snapshots()?,
            mutations: self.load_mutations()?,
            cursor: self.load_cursor()?,
            last_synced: self.load_last_synced()?,
        })
    }

    fn commit(&mut self, batch: &WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        apply_batch(&tx, batch)?;
        tx.commit()?;

        debug!(
            snapshots = batch.put_snapshots.len(),
            removed = batch.remove_snapshots.len(),
            mutations = batch.put_mutations.len(),
            acknowledged = batch.remove_mutations.len(),
            "Committed local write"
        );
        Ok(())
    }
}

fn apply_batch(tx: &Transaction<'_>, batch: &WriteBatch) -> StorageResult<()> {
    for snapshot in &batch.put_snapshots {
        let confirmed = snapshot
            .confirmed
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        tx.execute(
            "INSERT OR REPLACE INTO snapshots
             (entity_id, kind, revision, payload, confirmed, dirty, deleted, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot.id.to_string(),
                snapshot.id.kind.as_str(),
                to_sql_u64(snapshot.revision),
                serde_json::to_string(&snapshot.payload)?,
                confirmed,
                snapshot.dirty,
                snapshot.deleted,
                snapshot.updated_at.to_rfc3339(),
            ],
        )?;
    }

    for id in &batch.remove_snapshots {
        tx.execute(
            "DELETE FROM snapshots WHERE entity_id = ?",
            [id.to_string()],
        )?;
    }

    for id in &batch.remove_mutations {
        tx.execute("DELETE FROM mutations WHERE id = ?", [id.to_string()])?;
    }

    for record in &batch.put_mutations {
        tx.execute(
            "INSERT OR REPLACE INTO mutations
             (id, seq, entity_id, kind, payload, client_timestamp, attempts, dispatched)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id.to_string(),
                to_sql_u64(record.seq),
                record.entity_id.to_string(),
                record.kind.as_str(),
                serde_json::to_string(&record.payload)?,
                record.client_timestamp.to_rfc3339(),
                record.attempts,
                record.dispatched,
            ],
        )?;
    }

    if let Some(cursor) = batch.cursor {
        tx.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
            params![CURSOR_KEY, cursor.0.to_string()],
        )?;
    }

    if let Some(at) = batch.last_synced {
        tx.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
            params![LAST_SYNCED_KEY, at.to_rfc3339()],
        )?;
    }

    Ok(())
}

fn to_sql_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn parse_timestamp(table: &'static str, key: &str, value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::corrupt(table, key, e))
}

fn parse_fields(table: &'static str, key: &str, value: &str) -> StorageResult<Fields> {
    serde_json::from_str(value).map_err(|e| StorageError::corrupt(table, key, e))
}

/// Intermediate struct for snapshot rows
struct SnapshotRow {
    entity_id: String,
    revision: i64,
    payload: String,
    confirmed: Option<String>,
    dirty: bool,
    deleted: bool,
    updated_at: String,
}

impl SnapshotRow {
    fn hydrate(self) -> StorageResult<EntitySnapshot> {
        let id = self
            .entity_id
            .parse::<EntityId>()
            .map_err(|e| StorageError::corrupt("snapshots", &self.entity_id, e))?;
        let confirmed = self
            .confirmed
            .as_deref()
            .map(|c| parse_fields("snapshots", &self.entity_id, c))
            .transpose()?;

        Ok(EntitySnapshot {
            revision: self.revision.max(0) as u64,
            payload: parse_fields("snapshots", &self.entity_id, &self.payload)?,
            confirmed,
            dirty: self.dirty,
            deleted: self.deleted,
            updated_at: parse_timestamp("snapshots", &self.entity_id, &self.updated_at)?,
            id,
        })
    }
}

/// Intermediate struct for mutation rows
struct MutationRow {
    id: String,
    seq: i64,
    entity_id: String,
    kind: String,
    payload: String,
    client_timestamp: String,
    attempts: u32,
    dispatched: bool,
}

impl MutationRow {
    fn hydrate(self) -> StorageResult<MutationRecord> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StorageError::corrupt("mutations", &self.id, e))?;
        let entity_id = self
            .entity_id
            .parse::<EntityId>()
            .map_err(|e| StorageError::corrupt("mutations", &self.id, e))?;
        let kind = self
            .kind
            .parse::<MutationKind>()
            .map_err(|e| StorageError::corrupt("mutations", &self.id, e))?;

        Ok(MutationRecord {
            seq: self.seq.max(0) as u64,
            entity_id,
            kind,
            payload: parse_fields("mutations", &self.id, &self.payload)?,
            client_timestamp: parse_timestamp("mutations", &self.id, &self.client_timestamp)?,
            attempts: self.attempts,
            dispatched: self.dispatched,
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn sample_batch() -> (WriteBatch, MutationRecord) {
        let id = EntityId::product("milk");
        let payload = fields(json!({"name": "Milk", "quantity": 4}));
        let record = MutationRecord::new(1, id.clone(), MutationKind::Create, payload.clone());

        let mut batch = WriteBatch::new();
        batch
            .put_snapshot(EntitySnapshot::local(id, payload))
            .put_mutation(record.clone())
            .set_cursor(SyncCursor(12));
        (batch, record)
    }

    #[test]
    fn test_empty_store_loads_defaults() {
        let store = SqliteStore::open_in_memory().unwrap();
        let state = store.load().unwrap();
        assert!(state.snapshots.is_empty());
        assert!(state.mutations.is_empty());
        assert_eq!(state.cursor, SyncCursor(0));
        assert!(state.last_synced.is_none());
    }

    #[test]
    fn test_commit_and_load() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let (batch, record) = sample_batch();
        store.commit(&batch).unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.snapshots.len(), 1);
        assert_eq!(state.snapshots[0].quantity(), Some(4.0));
        assert!(state.snapshots[0].dirty);
        assert_eq!(state.mutations, vec![record]);
        assert_eq!(state.cursor, SyncCursor(12));
    }

    #[test]
    fn test_removals() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let (batch, record) = sample_batch();
        store.commit(&batch).unwrap();

        let mut removal = WriteBatch::new();
        removal
            .remove_mutation(record.id)
            .remove_snapshot(EntityId::product("milk"));
        store.commit(&removal).unwrap();

        let state = store.load().unwrap();
        assert!(state.snapshots.is_empty());
        assert!(state.mutations.is_empty());
        // Cursor untouched by a batch that doesn't set it
        assert_eq!(state.cursor, SyncCursor(12));
    }

    #[test]
    fn test_mutations_load_in_seq_order() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = EntityId::product("a");
        let mut batch = WriteBatch::new();
        for seq in [3, 1, 2] {
            batch.put_mutation(MutationRecord::new(
                seq,
                id.clone(),
                MutationKind::Update,
                fields(json!({"quantity": seq})),
            ));
        }
        store.commit(&batch).unwrap();

        let seqs: Vec<u64> = store.load().unwrap().mutations.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_data_persists_across_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("store.db");

        {
            let mut store = SqliteStore::open_path(&path).unwrap();
            let (batch, _) = sample_batch();
            store.commit(&batch).unwrap();
        }

        let store = SqliteStore::open_path(&path).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.snapshots.len(), 1);
        assert_eq!(state.mutations.len(), 1);
        assert_eq!(state.cursor, SyncCursor(12));
    }

    #[test]
    fn test_dispatched_flag_and_last_synced_persist() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.db");
        let synced_at = DateTime::parse_from_rfc3339("2026-10-16T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let (batch, mut record) = sample_batch();
        record.dispatched = true;

        {
            let mut store = SqliteStore::open_path(&path).unwrap();
            store.commit(&batch).unwrap();
            let mut update = WriteBatch::new();
            update.put_mutation(record.clone()).set_last_synced(synced_at);
            store.commit(&update).unwrap();
        }

        let state = SqliteStore::open_path(&path).unwrap().load().unwrap();
        assert_eq!(state.mutations, vec![record]);
        assert_eq!(state.last_synced, Some(synced_at));
        assert_eq!(state.cursor, SyncCursor(12));
    }

    #[test]
    fn test_rejects_newer_schema() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.db");
        {
            let store = SqliteStore::open_path(&path).unwrap();
            store
                .connection()
                .execute(
                    "UPDATE schema_info SET value = '99' WHERE key = 'version'",
                    [],
                )
                .unwrap();
        }

        let err = SqliteStore::open_path(&path).err().unwrap();
        assert!(matches!(err, StorageError::UnsupportedSchema { found: 99, .. }));
    }

    #[test]
    fn test_corrupt_payload_is_reported() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let (batch, _) = sample_batch();
        store.commit(&batch).unwrap();
        store
            .connection()
            .execute("UPDATE snapshots SET payload = 'not json'", [])
            .unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(err, StorageError::CorruptRow { table: "snapshots", .. }));
    }
}
