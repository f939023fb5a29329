//! SQLite schema for the local store
//!
//! Snapshots and mutation records keep their payloads as JSON text; the
//! columns outside the payload are the ones the store needs to order and
//! key rows. The schema is built by replaying [`MIGRATIONS`] from the
//! version recorded in `schema_info`.

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use super::error::{StorageError, StorageResult};

/// Version bookkeeping, created before any migration runs
const SCHEMA_INFO: &str = "CREATE TABLE IF NOT EXISTS schema_info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);";

/// Migration `n` (zero-based) upgrades a database from version `n` to `n + 1`
const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE snapshots (
        entity_id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        revision INTEGER NOT NULL,
        payload TEXT NOT NULL,
        confirmed TEXT,
        dirty INTEGER NOT NULL,
        deleted INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    );

    -- Replayed in seq order on startup
    CREATE TABLE mutations (
        id TEXT PRIMARY KEY,
        seq INTEGER NOT NULL UNIQUE,
        entity_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        client_timestamp TEXT NOT NULL,
        attempts INTEGER NOT NULL
    );

    CREATE TABLE sync_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE INDEX idx_mutations_entity ON mutations(entity_id, seq);
    CREATE INDEX idx_snapshots_kind ON snapshots(kind);
"#,
    // Set once a record has been handed to the remote store
    "ALTER TABLE mutations ADD COLUMN dispatched INTEGER NOT NULL DEFAULT 0;",
];

/// Version a fully migrated database reports
pub const SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

/// Bring the database up to [`SCHEMA_VERSION`]
///
/// Each migration runs in its own transaction together with the version
/// bump. A database written by a newer release is refused untouched.
pub fn migrate(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(SCHEMA_INFO)?;

    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchema {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    for (step, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = step as i32 + 1;
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?1)",
            [version.to_string()],
        )?;
        tx.commit()?;
        debug!(version, "Applied schema migration");
    }
    Ok(())
}

/// Recorded schema version, 0 for a fresh database
pub fn schema_version(conn: &Connection) -> StorageResult<i32> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_info WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match value {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| StorageError::corrupt("schema_info", "version", raw)),
    }
}
