//! Sync reconciler
//!
//! One pass moves the core through `Idle -> Pushing -> Pulling -> Idle`:
//!
//! 1. **Push**: every entity with pending records is drained concurrently.
//!    Within an entity, records go out one at a time in enqueue order, each
//!    carrying its id as the idempotency token.
//! 2. **Pull**: changes since the stored cursor are applied in one batch.
//!    Remote state wins for entities with nothing pending.
//!
//! A conflicting push is merged once: the record's fields are laid over the
//! server state and resubmitted. A second conflict drops the local change and
//! raises [`SyncEvent::Conflict`]. Transient failures count against the
//! record's retry budget; fatal ones abort the pass without touching the
//! failing record.
//!
//! Losing connectivity mid-pass stops new requests from going out, but
//! requests already on the wire run to completion and their results are
//! settled. A record is marked dispatched before its first request so later
//! local edits never fold into a change the remote may already hold.
//!
//! The [`Store`] sits behind a std mutex that is never held across an await,
//! so queries such as [`SyncCore::pending_count`] stay synchronous.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{PassOutcome, PassReport, SyncEvent, SyncPhase, SyncTrigger};
use super::remote::{PushOutcome, PushRequest, RemoteEntity, RemoteStore};
use super::retry::RetryPolicy;
use super::scheduler::SyncCommand;
use crate::alerts::AlertView;
use crate::config::Config;
use crate::error::{EnqueueError, RemoteError, SyncError};
use crate::models::{
    overlay, ConnectivityState, EntityId, EntitySnapshot, Fields, MutationKind, MutationRecord,
};
use crate::network::NetworkMonitor;
use crate::observers::{Observers, Subscription};
use crate::permissions::Permissions;
use crate::store::Store;

/// Tunables for the reconciler and its scheduler
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Run passes on startup, reconnect, timer and retry; when off, only
    /// explicit requests sync
    pub enabled: bool,
    pub retry: RetryPolicy,
    /// Upper bound for a single push or pull call
    pub remote_timeout: Duration,
    /// Period of the background pass while online
    pub sync_interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SyncOptions {
    fn from(config: &Config) -> Self {
        Self {
            enabled: config.sync_enabled,
            retry: config.retry_policy(),
            remote_timeout: config.remote_timeout(),
            sync_interval: config.sync_interval(),
        }
    }
}

/// What happened to one record during the push phase
enum Step {
    Pushed,
    Merged,
    Conflicted,
    Exhausted,
    Retry(Duration),
    /// Went offline before the next request; the record stays queued
    Interrupted,
    Abort(SyncError),
}

/// Push results for one entity
#[derive(Default)]
struct EntityTally {
    pushed: usize,
    merged: usize,
    conflicts: usize,
    exhausted: usize,
    retry_after: Option<Duration>,
    /// Stopped dispatching because connectivity was lost
    interrupted: bool,
    error: Option<SyncError>,
}

/// Offline-first sync core
///
/// Owns the local store and reconciles it with a [`RemoteStore`]. Share it
/// as `Arc<SyncCore>`; background scheduling is done by
/// [`spawn_sync_task`](super::spawn_sync_task).
pub struct SyncCore {
    store: Mutex<Store>,
    remote: Arc<dyn RemoteStore>,
    network: NetworkMonitor,
    options: SyncOptions,
    phase: watch::Sender<SyncPhase>,
    alert_observers: Observers<AlertView>,
    event_observers: Observers<SyncEvent>,
    /// Serialises passes
    pass_lock: tokio::sync::Mutex<()>,
    command_tx: mpsc::UnboundedSender<SyncCommand>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncCommand>>>,
}

impl SyncCore {
    pub fn new(
        store: Store,
        remote: Arc<dyn RemoteStore>,
        network: NetworkMonitor,
        options: SyncOptions,
    ) -> Arc<Self> {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            store: Mutex::new(store),
            remote,
            network,
            options,
            phase,
            alert_observers: Observers::new(),
            event_observers: Observers::new(),
            pass_lock: tokio::sync::Mutex::new(()),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
        })
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    // ==================== Local API ====================

    /// Validate and queue a local change, applying it optimistically
    pub fn enqueue<P: Permissions + ?Sized>(
        &self,
        session: &P,
        entity_id: &EntityId,
        kind: MutationKind,
        payload: Value,
    ) -> Result<Uuid, EnqueueError> {
        let id = self.store().enqueue(session, entity_id, kind, payload)?;
        self.flush_alerts();
        Ok(id)
    }

    /// Number of queued mutations, O(1)
    pub fn pending_count(&self) -> usize {
        self.store().pending_count()
    }

    /// Connectivity and pending count, for the status badge
    pub fn connectivity_state(&self) -> ConnectivityState {
        ConnectivityState {
            status: self.network.current_state(),
            pending_count: self.pending_count(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Run `f` against the store without holding it across an await
    pub fn with_store<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        f(&self.store())
    }

    pub fn snapshot(&self, id: &EntityId) -> Option<EntitySnapshot> {
        self.store().snapshot(id).cloned()
    }

    pub fn peek_ordered(&self, id: &EntityId) -> Vec<MutationRecord> {
        self.store().peek_ordered(id)
    }

    pub fn low_stock(&self) -> Vec<EntitySnapshot> {
        self.store().low_stock()
    }

    pub fn expiring_within(&self, days: u32) -> Vec<EntitySnapshot> {
        self.store().expiring_within(days)
    }

    pub fn alert_view(&self) -> AlertView {
        self.store().alert_view()
    }

    /// Re-evaluate date-dependent alerts; called at day rollover
    pub fn roll_day(&self) {
        self.store().roll_day();
        self.flush_alerts();
    }

    pub fn on_alerts_changed<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AlertView) + Send + Sync + 'static,
    {
        self.alert_observers.subscribe(listener)
    }

    pub fn on_sync_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.event_observers.subscribe(listener)
    }

    /// Ask the background task for a pass as soon as possible
    ///
    /// Ignores any retry backoff in effect. Does nothing if no task runs.
    pub fn request_sync(&self) {
        if self.command_tx.send(SyncCommand::RequestSync).is_err() {
            debug!("Sync requested but no sync task is running");
        }
    }

    pub(crate) fn command_sender(&self) -> mpsc::UnboundedSender<SyncCommand> {
        self.command_tx.clone()
    }

    /// Take the command receiver; only the first caller gets it
    pub(crate) fn take_commands(&self) -> Option<mpsc::UnboundedReceiver<SyncCommand>> {
        self.command_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn emit(&self, event: SyncEvent) {
        self.event_observers.emit(&event);
    }

    fn flush_alerts(&self) {
        let change = self.store().take_alert_change();
        if let Some(view) = change {
            self.alert_observers.emit(&view);
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_replace(phase);
    }

    // ==================== Reconciliation ====================

    /// Run one reconciliation pass
    ///
    /// Passes never overlap; a call made during a pass waits for it.
    pub async fn reconcile(&self, trigger: SyncTrigger) -> PassOutcome {
        let _pass = self.pass_lock.lock().await;

        if !self.network.current_state().is_online() {
            debug!(?trigger, "Offline, skipping pass");
            return PassOutcome::Skipped;
        }

        info!(?trigger, pending = self.pending_count(), "Starting sync pass");
        self.emit(SyncEvent::Started { trigger });
        self.set_phase(SyncPhase::Pushing);

        let mut report = PassReport::default();

        let tally = self.push_all().await;
        self.flush_alerts();

        report.pushed = tally.pushed;
        report.merged = tally.merged;
        report.conflicts = tally.conflicts;
        report.exhausted = tally.exhausted;
        report.retry_after = tally.retry_after;
        if let Some(error) = tally.error {
            return self.failed(error);
        }
        if tally.interrupted {
            return self.interrupted(&report);
        }

        if report.retry_after.is_none() {
            if !self.network.current_state().is_online() {
                return self.interrupted(&report);
            }
            self.set_phase(SyncPhase::Pulling);
            match self.pull().await {
                Ok(count) => report.pulled = count,
                Err(SyncError::Remote(e)) if e.is_transient() => {
                    warn!(error = %e, "Pull failed, will retry");
                    report.retry_after = Some(self.options.retry.delay_for(1));
                }
                Err(error) => return self.failed(error),
            }
            self.flush_alerts();
        } else {
            debug!("Skipping pull after a transient push failure");
        }

        if report.retry_after.is_none() {
            let marked = self.store().mark_synced(Utc::now());
            if let Err(e) = marked {
                return self.failed(e.into());
            }
        }

        report.cursor = self.store().cursor();
        self.set_phase(SyncPhase::Idle);
        info!(
            pushed = report.pushed,
            merged = report.merged,
            conflicts = report.conflicts,
            exhausted = report.exhausted,
            pulled = report.pulled,
            retry_after_ms = report.retry_after.map(|d| d.as_millis() as u64),
            "Sync pass complete"
        );
        self.emit(SyncEvent::Completed(report.clone()));
        PassOutcome::Completed(report)
    }

    fn interrupted(&self, report: &PassReport) -> PassOutcome {
        self.flush_alerts();
        self.set_phase(SyncPhase::Idle);
        info!(
            pushed = report.pushed,
            merged = report.merged,
            pending = self.pending_count(),
            "Connectivity lost, sync pass interrupted"
        );
        self.emit(SyncEvent::Interrupted);
        PassOutcome::Interrupted
    }

    fn failed(&self, error: SyncError) -> PassOutcome {
        self.store().clear_all_in_flight();
        self.set_phase(SyncPhase::Failed);
        warn!(error = %error, "Sync pass failed");
        self.emit(SyncEvent::Failed {
            error: error.clone(),
        });
        PassOutcome::Failed(error)
    }

    async fn push_all(&self) -> EntityTally {
        let entities = self.store().pending_entities();
        let abort = AtomicBool::new(false);
        let tallies = join_all(
            entities
                .into_iter()
                .map(|entity| self.push_entity(entity, &abort)),
        )
        .await;

        let mut total = EntityTally::default();
        for tally in tallies {
            total.pushed += tally.pushed;
            total.merged += tally.merged;
            total.conflicts += tally.conflicts;
            total.exhausted += tally.exhausted;
            total.retry_after = match (total.retry_after, tally.retry_after) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            total.interrupted |= tally.interrupted;
            if total.error.is_none() {
                total.error = tally.error;
            }
        }
        total
    }

    /// Drain one entity's records in order until one has to wait
    async fn push_entity(&self, entity_id: EntityId, abort: &AtomicBool) -> EntityTally {
        let mut tally = EntityTally::default();

        while !abort.load(Ordering::SeqCst) {
            let (record, base_revision, dispatched) = {
                let mut store = self.store();
                let Some(record) = store.peek_ordered(&entity_id).into_iter().next() else {
                    break;
                };
                if !self.network.current_state().is_online() {
                    tally.interrupted = true;
                    break;
                }
                let base_revision = store.snapshot(&entity_id).map_or(0, |s| s.revision);
                store.mark_in_flight(record.id);
                let dispatched = store.mark_dispatched(&record.id);
                (record, base_revision, dispatched)
            };

            let step = match dispatched {
                Ok(_) => self.push_record(&record, base_revision).await,
                Err(e) => self.abort_record(&record, e.into()),
            };
            match step {
                Step::Pushed => tally.pushed += 1,
                Step::Merged => tally.merged += 1,
                Step::Conflicted => tally.conflicts += 1,
                Step::Exhausted => tally.exhausted += 1,
                Step::Retry(delay) => {
                    tally.retry_after = Some(delay);
                    break;
                }
                Step::Interrupted => {
                    tally.interrupted = true;
                    break;
                }
                Step::Abort(error) => {
                    abort.store(true, Ordering::SeqCst);
                    tally.error = Some(error);
                    break;
                }
            }
        }
        tally
    }

    async fn push_record(&self, record: &MutationRecord, base_revision: u64) -> Step {
        let request = PushRequest {
            entity_id: record.entity_id.clone(),
            kind: record.kind,
            payload: record.payload.clone(),
            idempotency_token: record.id,
            base_revision,
            merge: false,
        };
        debug!(
            entity = %record.entity_id,
            kind = %record.kind,
            attempts = record.attempts,
            "Pushing mutation"
        );

        let result = self.call_remote(self.remote.push(request)).await;
        match result {
            Ok(PushOutcome::Acknowledged { revision }) => {
                let settled = self.store().acknowledge(&record.id, revision);
                match settled {
                    Ok(_) => Step::Pushed,
                    Err(e) => self.abort_record(record, e.into()),
                }
            }
            Ok(PushOutcome::Conflict { server }) => self.merge(record, server).await,
            Err(e) if e.is_transient() => self.fail_attempt(record, e),
            Err(e) => self.abort_record(record, e.into()),
        }
    }

    /// Resubmit a conflicting record on top of the server state, once
    async fn merge(&self, record: &MutationRecord, server: RemoteEntity) -> Step {
        if !self.network.current_state().is_online() {
            self.store().clear_in_flight(&record.id);
            return Step::Interrupted;
        }
        let (kind, payload) = match (record.kind, server.deleted) {
            (MutationKind::Delete, _) => (MutationKind::Delete, Fields::new()),
            (_, deleted) => {
                let mut merged = if deleted {
                    Fields::new()
                } else {
                    server.payload.clone()
                };
                overlay(&mut merged, &record.payload);
                let kind = if deleted {
                    MutationKind::Create
                } else {
                    MutationKind::Update
                };
                (kind, merged)
            }
        };
        info!(
            entity = %record.entity_id,
            server_revision = server.revision,
            "Push conflicted, resubmitting as merge"
        );

        let request = PushRequest {
            entity_id: record.entity_id.clone(),
            kind,
            payload: payload.clone(),
            idempotency_token: record.merge_token(server.revision),
            base_revision: server.revision,
            merge: true,
        };

        let result = self.call_remote(self.remote.push(request)).await;
        match result {
            Ok(PushOutcome::Acknowledged { revision }) => {
                let settled = if kind == MutationKind::Delete {
                    self.store().acknowledge(&record.id, revision)
                } else {
                    self.store().acknowledge_merge(&record.id, payload, revision)
                };
                match settled {
                    Ok(_) => Step::Merged,
                    Err(e) => self.abort_record(record, e.into()),
                }
            }
            Ok(PushOutcome::Conflict { server }) => {
                warn!(
                    entity = %record.entity_id,
                    mutation = %record.id,
                    "Merge conflicted again, dropping local change"
                );
                let dropped = self.store().abandon(&record.id, Some(server));
                if let Err(e) = dropped {
                    return self.abort_record(record, e.into());
                }
                self.emit(SyncEvent::Conflict {
                    entity_id: record.entity_id.clone(),
                    mutation_id: record.id,
                    kind: record.kind,
                    payload: record.payload.clone(),
                });
                Step::Conflicted
            }
            Err(e) if e.is_transient() => self.fail_attempt(record, e),
            Err(e) => self.abort_record(record, e.into()),
        }
    }

    fn fail_attempt(&self, record: &MutationRecord, error: RemoteError) -> Step {
        let policy = self.options.retry;
        let counted = {
            let mut store = self.store();
            store.clear_in_flight(&record.id);
            store.record_failure(&record.id)
        };
        let attempts = match counted {
            Ok(attempts) => attempts.unwrap_or(record.attempts + 1),
            Err(e) => return self.abort_record(record, e.into()),
        };

        if !policy.is_exhausted(attempts) {
            let delay = policy.delay_for(attempts);
            warn!(
                entity = %record.entity_id,
                attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Push failed, will retry"
            );
            return Step::Retry(delay);
        }

        warn!(
            entity = %record.entity_id,
            mutation = %record.id,
            attempts,
            error = %error,
            "Retry budget exhausted, dropping mutation"
        );
        let dropped = self.store().abandon(&record.id, None);
        if let Err(e) = dropped {
            return self.abort_record(record, e.into());
        }
        self.emit(SyncEvent::Exhausted {
            entity_id: record.entity_id.clone(),
            mutation_id: record.id,
            kind: record.kind,
            attempts,
            last_error: error,
        });
        Step::Exhausted
    }

    fn abort_record(&self, record: &MutationRecord, error: SyncError) -> Step {
        self.store().clear_in_flight(&record.id);
        Step::Abort(error)
    }

    async fn pull(&self) -> Result<usize, SyncError> {
        let cursor = self.store().cursor();
        let entities = self.call_remote(self.remote.pull_since(cursor)).await?;
        let received = entities.len();

        let summary = self.store().apply_pull(entities)?;
        debug!(
            received,
            applied = summary.applied,
            skipped = summary.skipped,
            cursor = summary.cursor.0,
            "Applied pull batch"
        );
        Ok(summary.applied)
    }

    async fn call_remote<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        match tokio::time::timeout(self.options.remote_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transient(format!(
                "remote call timed out after {:?}",
                self.options.remote_timeout
            ))),
        }
    }
}
