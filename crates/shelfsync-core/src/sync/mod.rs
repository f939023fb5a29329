//! Reconciliation with the remote store
//!
//! ## Architecture
//!
//! - **`RemoteStore`**: the transport-agnostic server interface
//! - **`SyncCore`**: owns the local store, runs reconciliation passes and
//!   exposes the synchronous query surface
//! - **Scheduler**: a background task deciding when passes run
//!
//! ## Usage
//!
//! ```ignore
//! let store = Store::open_with_config(&config)?;
//! let network = NetworkMonitor::new(NetworkStatus::Offline, config.debounce());
//! let core = SyncCore::new(store, remote, network.clone(), SyncOptions::from(&config));
//!
//! network.spawn();
//! let handle = spawn_sync_task(core.clone()).expect("first spawn");
//!
//! // Platform code reports connectivity; the core pushes when it comes online
//! network.report(NetworkStatus::Online);
//! ```

mod events;
mod reconciler;
mod remote;
mod retry;
mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use events::{PassOutcome, PassReport, SyncEvent, SyncPhase, SyncTrigger};
pub use reconciler::{SyncCore, SyncOptions};
pub use remote::{PushOutcome, PushRequest, RemoteEntity, RemoteStore};
pub use retry::RetryPolicy;
pub use scheduler::{spawn_sync_task, SyncCommand, SyncHandle};
