//! Shelfsync Core Library
//!
//! This crate provides the offline-first synchronization core for shelfsync,
//! a small inventory manager for products and stock transactions.
//!
//! # Architecture
//!
//! - **SQLite**: durable local store for snapshots, the mutation log and the
//!   sync cursor
//! - **Mutation queue**: every local write is validated, persisted and
//!   applied optimistically before any network traffic
//! - **Reconciler**: pushes queued mutations to a [`RemoteStore`] and pulls
//!   remote changes back, driven by connectivity, timers and explicit
//!   requests
//!
//! All queries are served from memory and never wait on the network.
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let store = Store::open_with_config(&config)?;
//! let network = NetworkMonitor::new(NetworkStatus::Offline, config.debounce());
//! let core = SyncCore::new(store, remote, network.clone(), SyncOptions::from(&config));
//!
//! let session = Session::new("dana", Role::Admin);
//! core.enqueue(&session, &EntityId::product("milk"), MutationKind::Create,
//!     json!({"name": "Milk", "quantity": 2, "reorder_threshold": 5}))?;
//!
//! let _alerts = core.on_alerts_changed(|view| println!("{} alerts", view.badge_count()));
//! ```
//!
//! # Modules
//!
//! - `store`: Unified storage interface (main entry point for local data)
//! - `sync`: Reconciler, scheduler and the remote store interface
//! - `network`: Debounced connectivity monitor
//! - `alerts`: Low-stock and expiring-product views
//! - `queue`: In-memory index over pending mutations
//! - `models`: Entities, mutation records and connectivity types
//! - `permissions`: Roles and the permission check used at enqueue
//! - `storage`: SQLite persistence
//! - `config`: Application configuration

pub mod alerts;
pub mod config;
pub mod error;
pub mod models;
pub mod network;
pub mod observers;
pub mod permissions;
pub mod queue;
pub mod storage;
pub mod store;
pub mod sync;

pub use alerts::{AlertView, AlertsEngine, Clock, SystemClock};
pub use config::Config;
pub use error::{EnqueueError, RemoteError, SyncError};
pub use models::{
    ConnectivityState, EntityId, EntityKind, EntitySnapshot, Fields, MutationKind,
    MutationRecord, NetworkStatus, SyncCursor,
};
pub use network::NetworkMonitor;
pub use observers::Subscription;
pub use permissions::{Action, Permissions, Role, Session};
pub use storage::{LocalStore, SqliteStore, StorageError};
pub use store::{PullSummary, Store};
pub use sync::{
    spawn_sync_task, PassOutcome, PassReport, PushOutcome, PushRequest, RemoteEntity,
    RemoteStore, RetryPolicy, SyncCore, SyncEvent, SyncHandle, SyncOptions, SyncPhase,
    SyncTrigger,
};
