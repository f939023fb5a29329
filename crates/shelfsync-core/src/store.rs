//! Unified storage interface
//!
//! The `Store` owns the in-memory view of everything the core knows and
//! coordinates between:
//! - the durable [`LocalStore`] (source of truth across restarts)
//! - the [`MutationQueue`] index over pending records
//! - the [`AlertsEngine`] derived views
//!
//! Every change is expressed as a [`WriteBatch`]. The batch is committed to
//! the backend first and only then applied to memory, so a failed write
//! leaves both sides as they were.
//!
//! ## Usage
//!
//! ```ignore
//! let mut store = Store::open()?;
//! let session = Session::new("dana", Role::Admin);
//!
//! store.enqueue(&session, &EntityId::product("milk"), MutationKind::Create,
//!     json!({"name": "Milk", "quantity": 3, "reorder_threshold": 5}))?;
//!
//! assert_eq!(store.pending_count(), 1);
//! assert_eq!(store.low_stock().len(), 1);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::alerts::{AlertView, AlertsEngine, Clock, SystemClock};
use crate::config::Config;
use crate::error::EnqueueError;
use crate::models::{
    overlay, EntityId, EntityKind, EntitySnapshot, Fields, MutationKind, MutationRecord,
    SyncCursor, EXPIRY_DATE_FIELD, EXPIRY_DATE_FORMAT, QUANTITY_FIELD, REORDER_THRESHOLD_FIELD,
};
use crate::permissions::{Action, Permissions};
use crate::queue::MutationQueue;
use crate::storage::{LocalStore, SqliteStore, StorageResult, WriteBatch};
use crate::sync::RemoteEntity;

/// Counts from applying one pull batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub applied: usize,
    /// Entities left alone because they still had pending mutations
    pub skipped: usize,
    pub cursor: SyncCursor,
}

/// How a pending record leaves the queue
enum Settlement {
    /// Accepted as sent
    Acknowledged { revision: Option<u64> },
    /// Accepted after a merge; the server now holds `payload`
    Merged { payload: Fields, revision: u64 },
    /// Dropped; adopt the server state if one is known
    Abandoned { server: Option<RemoteEntity> },
}

/// Unified storage interface for shelfsync
pub struct Store {
    backend: Box<dyn LocalStore>,
    snapshots: BTreeMap<EntityId, EntitySnapshot>,
    queue: MutationQueue,
    cursor: SyncCursor,
    last_synced: Option<DateTime<Utc>>,
    alerts: AlertsEngine,
    /// Bumped by every write that touches snapshots
    version: u64,
}

impl Store {
    /// Open the store using the configuration on disk
    pub fn open() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Self::open_with_config(&config)
    }

    /// Open the store with a specific configuration
    pub fn open_with_config(config: &Config) -> Result<Self> {
        let backend = SqliteStore::open(config).context("Failed to open SQLite database")?;
        Self::with_backend(
            Box::new(backend),
            Arc::new(SystemClock),
            config.expiry_horizon_days,
        )
        .context("Failed to load local state")
    }

    /// Build a store over any backend, loading its persisted state
    pub fn with_backend(
        backend: Box<dyn LocalStore>,
        clock: Arc<dyn Clock>,
        horizon_days: u32,
    ) -> StorageResult<Self> {
        let state = backend.load()?;
        let snapshots: BTreeMap<EntityId, EntitySnapshot> = state
            .snapshots
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        let queue = MutationQueue::from_records(state.mutations);

        let mut alerts = AlertsEngine::new(clock, horizon_days);
        alerts.refresh(&snapshots, 0);
        // The initial computation is not a change listeners need to hear about
        alerts.take_changed();

        Ok(Self {
            backend,
            snapshots,
            queue,
            cursor: state.cursor,
            last_synced: state.last_synced,
            alerts,
            version: 0,
        })
    }

    // ==================== Mutation Queue ====================

    /// Validate, persist and optimistically apply a local change
    ///
    /// Returns the id of the queued record. When an update is folded into an
    /// earlier record, that record's id is returned.
    pub fn enqueue<P: Permissions + ?Sized>(
        &mut self,
        session: &P,
        entity_id: &EntityId,
        kind: MutationKind,
        payload: Value,
    ) -> Result<Uuid, EnqueueError> {
        let action = required_action(kind);
        if !session.has_permission(action) {
            return Err(EnqueueError::PermissionDenied {
                entity_id: entity_id.clone(),
                kind,
                action,
            });
        }

        let fields = validate_payload(entity_id, kind, payload)?;
        let existing = self.snapshots.get(entity_id);
        match (kind, existing) {
            (MutationKind::Create, Some(_)) => {
                return Err(EnqueueError::validation(
                    entity_id,
                    kind,
                    "entity already exists",
                ));
            }
            (MutationKind::Update | MutationKind::Delete, None) => {
                return Err(EnqueueError::validation(
                    entity_id,
                    kind,
                    "entity does not exist",
                ));
            }
            (MutationKind::Update | MutationKind::Delete, Some(s)) if s.deleted => {
                return Err(EnqueueError::validation(
                    entity_id,
                    kind,
                    "entity has a pending delete",
                ));
            }
            _ => {}
        }

        let snapshot = match (kind, existing) {
            (MutationKind::Create, _) | (_, None) => {
                EntitySnapshot::local(entity_id.clone(), fields.clone())
            }
            (MutationKind::Update, Some(current)) => {
                let mut next = current.clone();
                overlay(&mut next.payload, &fields);
                next.dirty = true;
                next.updated_at = Utc::now();
                next
            }
            (MutationKind::Delete, Some(current)) => {
                let mut next = current.clone();
                next.deleted = true;
                next.dirty = true;
                next.updated_at = Utc::now();
                next
            }
        };

        let planned = self.queue.plan(entity_id, kind, fields);
        let id = planned.record.id;

        let mut batch = WriteBatch::new();
        batch
            .put_mutation(planned.record)
            .put_snapshot(snapshot);
        self.commit(batch)?;

        tracing::debug!(
            entity = %entity_id,
            kind = %kind,
            coalesced = planned.coalesced,
            pending = self.queue.len(),
            "Enqueued mutation"
        );
        Ok(id)
    }

    /// Number of pending records, O(1)
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Pending records for one entity, oldest first
    pub fn peek_ordered(&self, entity_id: &EntityId) -> Vec<MutationRecord> {
        self.queue.peek_ordered(entity_id)
    }

    /// All pending records in log order
    pub fn pending_records(&self) -> Vec<MutationRecord> {
        self.queue.iter().cloned().collect()
    }

    /// Entities with pending records, ordered by their oldest record
    pub fn pending_entities(&self) -> Vec<EntityId> {
        self.queue.pending_entities()
    }

    pub fn record(&self, id: &Uuid) -> Option<&MutationRecord> {
        self.queue.get(id)
    }

    /// Remove a record the remote store has accepted
    ///
    /// Idempotent: returns `false` and changes nothing if the record is no
    /// longer pending.
    pub fn dequeue(&mut self, id: &Uuid) -> StorageResult<bool> {
        self.settle(id, Settlement::Acknowledged { revision: None })
            .map(|r| r.is_some())
    }

    /// Remove an accepted record and record the revision the server assigned
    pub fn acknowledge(&mut self, id: &Uuid, revision: u64) -> StorageResult<bool> {
        self.settle(
            id,
            Settlement::Acknowledged {
                revision: Some(revision),
            },
        )
        .map(|r| r.is_some())
    }

    /// Remove a record whose merge resubmission was accepted
    pub fn acknowledge_merge(
        &mut self,
        id: &Uuid,
        payload: Fields,
        revision: u64,
    ) -> StorageResult<bool> {
        self.settle(id, Settlement::Merged { payload, revision })
            .map(|r| r.is_some())
    }

    /// Drop a record without applying it
    ///
    /// The entity's optimistic state is rebuilt from the confirmed state
    /// (or `server`, when given) plus whatever remains queued.
    pub fn abandon(
        &mut self,
        id: &Uuid,
        server: Option<RemoteEntity>,
    ) -> StorageResult<Option<MutationRecord>> {
        self.settle(id, Settlement::Abandoned { server })
    }

    /// Count one failed delivery; returns the new attempt count
    pub fn record_failure(&mut self, id: &Uuid) -> StorageResult<Option<u32>> {
        let Some(mut record) = self.queue.get(id).cloned() else {
            return Ok(None);
        };
        record.attempts += 1;
        let attempts = record.attempts;

        let mut batch = WriteBatch::new();
        batch.put_mutation(record);
        self.commit(batch)?;
        Ok(Some(attempts))
    }

    pub fn mark_in_flight(&mut self, id: Uuid) {
        self.queue.mark_in_flight(id);
    }

    /// Persist that a record is about to reach the remote store
    ///
    /// From then on the record may already be applied remotely, so later
    /// updates append instead of folding into it. Returns `false` if the
    /// record is no longer pending.
    pub fn mark_dispatched(&mut self, id: &Uuid) -> StorageResult<bool> {
        let Some(mut record) = self.queue.get(id).cloned() else {
            return Ok(false);
        };
        if !record.dispatched {
            record.dispatched = true;
            let mut batch = WriteBatch::new();
            batch.put_mutation(record);
            self.commit(batch)?;
        }
        Ok(true)
    }

    pub fn clear_in_flight(&mut self, id: &Uuid) {
        self.queue.clear_in_flight(id);
    }

    pub fn clear_all_in_flight(&mut self) {
        self.queue.clear_all_in_flight();
    }

    fn settle(
        &mut self,
        id: &Uuid,
        settlement: Settlement,
    ) -> StorageResult<Option<MutationRecord>> {
        let Some(record) = self.queue.get(id).cloned() else {
            return Ok(None);
        };

        let mut batch = WriteBatch::new();
        batch.remove_mutation(record.id);

        let current = self.snapshots.get(&record.entity_id).cloned();
        let base = match (&settlement, current) {
            (_, Some(snapshot)) => Some(snapshot),
            (Settlement::Abandoned { server: Some(s) }, None) => Some(EntitySnapshot::from_remote(
                s.entity_id.clone(),
                s.revision,
                s.payload.clone(),
            )),
            _ => None,
        };

        if let Some(mut snapshot) = base {
            match settlement {
                Settlement::Acknowledged { revision } => {
                    snapshot.confirmed = confirm(snapshot.confirmed.take(), &record);
                    if let Some(revision) = revision {
                        snapshot.revision = snapshot.revision.max(revision);
                    }
                }
                Settlement::Merged { payload, revision } => {
                    snapshot.confirmed = Some(payload);
                    snapshot.revision = snapshot.revision.max(revision);
                }
                Settlement::Abandoned { server: Some(server) } => {
                    snapshot.confirmed = (!server.deleted).then_some(server.payload);
                    snapshot.revision = snapshot.revision.max(server.revision);
                }
                Settlement::Abandoned { server: None } => {}
            }

            match self.replay(snapshot, &record.id) {
                Some(rebuilt) => batch.put_snapshot(rebuilt),
                None => batch.remove_snapshot(record.entity_id.clone()),
            };
        }

        self.commit(batch)?;
        Ok(Some(record))
    }

    /// Recompute the optimistic state from the confirmed state and the
    /// records still queued, skipping `leaving`
    ///
    /// `None` when nothing remains of the entity.
    fn replay(&self, mut snapshot: EntitySnapshot, leaving: &Uuid) -> Option<EntitySnapshot> {
        let pending: Vec<MutationRecord> = self
            .queue
            .peek_ordered(&snapshot.id)
            .into_iter()
            .filter(|r| r.id != *leaving)
            .collect();

        let mut payload = snapshot.confirmed.clone();
        let mut deleted = false;
        for record in &pending {
            match record.kind {
                MutationKind::Create => payload = Some(record.payload.clone()),
                MutationKind::Update => {
                    overlay(payload.get_or_insert_with(Fields::new), &record.payload)
                }
                MutationKind::Delete => deleted = true,
            }
        }

        snapshot.payload = payload?;
        snapshot.deleted = deleted;
        snapshot.dirty = !pending.is_empty();
        snapshot.updated_at = Utc::now();
        Some(snapshot)
    }

    // ==================== Pull ====================

    pub fn cursor(&self) -> SyncCursor {
        self.cursor
    }

    /// When the last sync pass ran to completion
    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.last_synced
    }

    pub fn mark_synced(&mut self, at: DateTime<Utc>) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.set_last_synced(at);
        self.commit(batch)
    }

    /// Apply a batch of remote changes in one write
    ///
    /// Entities with pending mutations keep their local state and hold the
    /// cursor back so they are fetched again once their queue drains.
    pub fn apply_pull(&mut self, mut entities: Vec<RemoteEntity>) -> StorageResult<PullSummary> {
        entities.sort_by_key(|e| e.revision);

        let mut batch = WriteBatch::new();
        let mut summary = PullSummary {
            cursor: self.cursor,
            ..PullSummary::default()
        };
        let mut held_back = false;
        let mut staged: BTreeMap<EntityId, Option<u64>> = BTreeMap::new();

        for entity in entities {
            if self.queue.has_pending(&entity.entity_id) {
                summary.skipped += 1;
                held_back = true;
                continue;
            }
            if !held_back {
                summary.cursor = summary.cursor.max(SyncCursor(entity.revision));
            }

            let local_revision = match staged.get(&entity.entity_id) {
                Some(revision) => *revision,
                None => self.snapshots.get(&entity.entity_id).map(|s| s.revision),
            };
            if local_revision.is_some_and(|r| r >= entity.revision) {
                continue;
            }

            if entity.deleted {
                if local_revision.is_some() {
                    batch.remove_snapshot(entity.entity_id.clone());
                    staged.insert(entity.entity_id, None);
                    summary.applied += 1;
                }
            } else {
                staged.insert(entity.entity_id.clone(), Some(entity.revision));
                batch.put_snapshot(EntitySnapshot::from_remote(
                    entity.entity_id,
                    entity.revision,
                    entity.payload,
                ));
                summary.applied += 1;
            }
        }

        if summary.cursor != self.cursor {
            batch.set_cursor(summary.cursor);
        }
        self.commit(batch)?;
        Ok(summary)
    }

    // ==================== Queries ====================

    /// Current snapshot of an entity, including pending-delete tombstones
    pub fn snapshot(&self, id: &EntityId) -> Option<&EntitySnapshot> {
        self.snapshots.get(id)
    }

    /// Live entities of one kind
    pub fn entities(&self, kind: EntityKind) -> Vec<EntitySnapshot> {
        self.snapshots
            .values()
            .filter(|s| s.id.kind == kind && s.is_live())
            .cloned()
            .collect()
    }

    /// Bumped by every write that changes a snapshot
    pub fn version(&self) -> u64 {
        self.version
    }

    // ==================== Alerts ====================

    pub fn low_stock(&self) -> Vec<EntitySnapshot> {
        self.alerts.low_stock().to_vec()
    }

    pub fn expiring_within(&self, days: u32) -> Vec<EntitySnapshot> {
        self.alerts.expiring_within(&self.snapshots, days)
    }

    pub fn alert_view(&self) -> AlertView {
        self.alerts.view(&self.snapshots)
    }

    pub fn today(&self) -> NaiveDate {
        self.alerts.today()
    }

    /// Re-evaluate the alerts after the calendar day changed
    pub fn roll_day(&mut self) {
        self.alerts.refresh(&self.snapshots, self.version);
    }

    /// The current view, if it changed since the last call
    pub fn take_alert_change(&mut self) -> Option<AlertView> {
        self.alerts
            .take_changed()
            .then(|| self.alerts.view(&self.snapshots))
    }

    // ==================== Persistence ====================

    fn commit(&mut self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.backend.commit(&batch)?;

        let touches_snapshots =
            !batch.put_snapshots.is_empty() || !batch.remove_snapshots.is_empty();
        let WriteBatch {
            put_snapshots,
            remove_snapshots,
            put_mutations,
            remove_mutations,
            cursor,
            last_synced,
        } = batch;

        for id in &remove_mutations {
            self.queue.remove(id);
        }
        for record in put_mutations {
            self.queue.install(record);
        }
        for id in &remove_snapshots {
            self.snapshots.remove(id);
        }
        for snapshot in put_snapshots {
            self.snapshots.insert(snapshot.id.clone(), snapshot);
        }
        if let Some(cursor) = cursor {
            self.cursor = cursor;
        }
        if last_synced.is_some() {
            self.last_synced = last_synced;
        }

        if touches_snapshots {
            self.version += 1;
            self.alerts.refresh(&self.snapshots, self.version);
        }
        Ok(())
    }
}

fn required_action(kind: MutationKind) -> Action {
    match kind {
        MutationKind::Create => Action::Add,
        MutationKind::Update => Action::Edit,
        MutationKind::Delete => Action::Delete,
    }
}

/// Confirmed state after the server accepted `record` as sent
fn confirm(confirmed: Option<Fields>, record: &MutationRecord) -> Option<Fields> {
    match record.kind {
        MutationKind::Create => Some(record.payload.clone()),
        MutationKind::Update => {
            let mut base = confirmed.unwrap_or_default();
            overlay(&mut base, &record.payload);
            Some(base)
        }
        MutationKind::Delete => None,
    }
}

fn validate_payload(
    entity_id: &EntityId,
    kind: MutationKind,
    payload: Value,
) -> Result<Fields, EnqueueError> {
    if entity_id.key.trim().is_empty() {
        return Err(EnqueueError::validation(entity_id, kind, "entity key is empty"));
    }

    let fields = match (kind, payload) {
        (MutationKind::Delete, Value::Null) => return Ok(Fields::new()),
        (_, Value::Object(fields)) => fields,
        (_, other) => {
            return Err(EnqueueError::validation(
                entity_id,
                kind,
                format!("payload must be a JSON object, got {}", json_type(&other)),
            ));
        }
    };

    match kind {
        MutationKind::Delete if !fields.is_empty() => {
            return Err(EnqueueError::validation(
                entity_id,
                kind,
                "delete does not take a payload",
            ));
        }
        MutationKind::Create | MutationKind::Update if fields.is_empty() => {
            return Err(EnqueueError::validation(entity_id, kind, "payload is empty"));
        }
        _ => {}
    }

    if entity_id.kind == EntityKind::Product {
        check_product_fields(&fields)
            .map_err(|reason| EnqueueError::validation(entity_id, kind, reason))?;
    }
    Ok(fields)
}

fn check_product_fields(fields: &Fields) -> Result<(), String> {
    for name in [QUANTITY_FIELD, REORDER_THRESHOLD_FIELD] {
        if let Some(value) = fields.get(name) {
            match value.as_f64() {
                Some(n) if n >= 0.0 => {}
                _ => return Err(format!("'{}' must be a non-negative number", name)),
            }
        }
    }

    match fields.get(EXPIRY_DATE_FIELD) {
        None | Some(Value::Null) => Ok(()),
        Some(Value::String(s)) if NaiveDate::parse_from_str(s, EXPIRY_DATE_FORMAT).is_ok() => {
            Ok(())
        }
        Some(_) => Err(format!(
            "'{}' must be a YYYY-MM-DD date or null",
            EXPIRY_DATE_FIELD
        )),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
