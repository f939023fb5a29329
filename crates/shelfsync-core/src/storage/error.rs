//! Storage error handling
//!
//! SQLite failures are classified on the way in so callers can tell a full
//! disk or an unreadable data directory apart from a bug.

use std::io;
use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// The data directory could not be created
    #[error("Failed to create data directory '{path}': {source}")]
    DataDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Permission denied: cannot access '{path}'")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// SQLite could not grow the database file
    #[error("Disk full: the local store could not be written")]
    DiskFull(#[source] rusqlite::Error),

    /// The database file is read-only or locked by another process
    #[error("Local store is not writable: {0}")]
    ReadOnly(#[source] rusqlite::Error),

    /// A stored row could not be decoded
    #[error("Corrupt {table} row '{key}': {details}")]
    CorruptRow {
        table: &'static str,
        key: String,
        details: String,
    },

    /// Database was written by a newer schema
    #[error("Database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i32, supported: i32 },

    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StorageError {
    fn from(error: rusqlite::Error) -> Self {
        match error.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => StorageError::DiskFull(error),
            Some(ErrorCode::ReadOnly | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                StorageError::ReadOnly(error)
            }
            _ => StorageError::Database(error),
        }
    }
}

impl StorageError {
    /// Wrap a failure to prepare the directory at `path`
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            _ => StorageError::DataDirectory {
                path,
                source: error,
            },
        }
    }

    pub(crate) fn corrupt(table: &'static str, key: impl Into<String>, details: impl ToString) -> Self {
        StorageError::CorruptRow {
            table,
            key: key.into(),
            details: details.to_string(),
        }
    }

    /// What an operator can do about this error, if anything
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull(_) => Some("Free up disk space and try again."),
            StorageError::PermissionDenied { .. } | StorageError::DataDirectory { .. } => {
                Some("Check that data_dir points at a directory you can write to.")
            }
            StorageError::ReadOnly(_) => {
                Some("Close other processes using the store, or check the database file permissions.")
            }
            StorageError::UnsupportedSchema { .. } => {
                Some("Upgrade shelfsync, or point data_dir at a different directory.")
            }
            StorageError::CorruptRow { .. } => {
                Some("Move the database aside to start from an empty store; pending changes in it will be lost.")
            }
            StorageError::Database(_) | StorageError::Serialization(_) => None,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
