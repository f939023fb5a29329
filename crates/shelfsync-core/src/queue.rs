//! In-memory index over the persisted mutation log
//!
//! The log itself lives in the [`LocalStore`](crate::storage::LocalStore);
//! this index answers the questions the reconciler asks without touching
//! storage: the pending count, the ordered records of one entity, and where
//! a new update can be folded into an existing record.
//!
//! Planning and installing are separate steps. [`MutationQueue::plan`]
//! computes the record a mutation turns into without changing the index, the
//! store persists it, and only then [`MutationQueue::install`] makes it
//! visible. A failed write therefore leaves the index untouched.

use std::collections::{BTreeMap, HashMap, HashSet};

use uuid::Uuid;

use crate::models::{overlay, EntityId, Fields, MutationKind, MutationRecord};

/// Result of planning one enqueue
#[derive(Debug, Clone, PartialEq)]
pub struct Planned {
    pub record: MutationRecord,
    /// The record replaces an existing one rather than appending
    pub coalesced: bool,
}

#[derive(Debug, Default)]
pub struct MutationQueue {
    /// Pending records keyed by `seq`
    records: BTreeMap<u64, MutationRecord>,
    by_id: HashMap<Uuid, u64>,
    by_entity: HashMap<EntityId, Vec<u64>>,
    in_flight: HashSet<Uuid>,
    next_seq: u64,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            ..Self::default()
        }
    }

    /// Rebuild the index from records loaded at startup
    pub fn from_records(records: impl IntoIterator<Item = MutationRecord>) -> Self {
        let mut queue = Self::new();
        for record in records {
            queue.install(record);
        }
        queue
    }

    /// Number of pending records, O(1)
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&MutationRecord> {
        self.by_id.get(id).and_then(|seq| self.records.get(seq))
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn has_pending(&self, entity_id: &EntityId) -> bool {
        self.by_entity
            .get(entity_id)
            .is_some_and(|seqs| !seqs.is_empty())
    }

    /// Records for one entity, oldest first
    pub fn peek_ordered(&self, entity_id: &EntityId) -> Vec<MutationRecord> {
        self.by_entity
            .get(entity_id)
            .map(|seqs| {
                seqs.iter()
                    .filter_map(|seq| self.records.get(seq))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entities with pending records, ordered by their oldest record
    pub fn pending_entities(&self) -> Vec<EntityId> {
        let mut seen = HashSet::new();
        self.records
            .values()
            .filter(|r| seen.insert(r.entity_id.clone()))
            .map(|r| r.entity_id.clone())
            .collect()
    }

    /// All pending records in log order
    pub fn iter(&self) -> impl Iterator<Item = &MutationRecord> {
        self.records.values()
    }

    /// Compute the record an enqueue would produce
    ///
    /// An update folds into the entity's newest record when that record is a
    /// create or update that has never been handed to the remote store and
    /// has no failed attempts.
    pub fn plan(&self, entity_id: &EntityId, kind: MutationKind, payload: Fields) -> Planned {
        if kind == MutationKind::Update {
            if let Some(tail) = self.coalescible_tail(entity_id) {
                let mut record = tail.clone();
                overlay(&mut record.payload, &payload);
                return Planned {
                    record,
                    coalesced: true,
                };
            }
        }

        Planned {
            record: MutationRecord::new(self.next_seq, entity_id.clone(), kind, payload),
            coalesced: false,
        }
    }

    fn coalescible_tail(&self, entity_id: &EntityId) -> Option<&MutationRecord> {
        let seq = self.by_entity.get(entity_id)?.last()?;
        let tail = self.records.get(seq)?;
        let foldable = matches!(tail.kind, MutationKind::Create | MutationKind::Update)
            && tail.attempts == 0
            && !tail.dispatched
            && !self.in_flight.contains(&tail.id);
        foldable.then_some(tail)
    }

    /// Insert or replace a record after it has been persisted
    pub fn install(&mut self, record: MutationRecord) {
        let seq = record.seq;
        if let Some(old_seq) = self.by_id.insert(record.id, seq) {
            if old_seq != seq {
                self.records.remove(&old_seq);
                if let Some(seqs) = self.by_entity.get_mut(&record.entity_id) {
                    seqs.retain(|s| *s != old_seq);
                }
            }
        }

        let seqs = self.by_entity.entry(record.entity_id.clone()).or_default();
        if let Err(pos) = seqs.binary_search(&seq) {
            seqs.insert(pos, seq);
        }
        self.next_seq = self.next_seq.max(seq + 1);
        self.records.insert(seq, record);
    }

    /// Remove a record; `None` if it was not pending
    pub fn remove(&mut self, id: &Uuid) -> Option<MutationRecord> {
        let seq = self.by_id.remove(id)?;
        let record = self.records.remove(&seq)?;
        if let Some(seqs) = self.by_entity.get_mut(&record.entity_id) {
            seqs.retain(|s| *s != seq);
            if seqs.is_empty() {
                self.by_entity.remove(&record.entity_id);
            }
        }
        self.in_flight.remove(id);
        Some(record)
    }

    /// Exclude a record from coalescing while it is on the wire
    pub fn mark_in_flight(&mut self, id: Uuid) {
        if self.by_id.contains_key(&id) {
            self.in_flight.insert(id);
        }
    }

    pub fn clear_in_flight(&mut self, id: &Uuid) {
        self.in_flight.remove(id);
    }

    /// Forget every in-flight mark, after a pass was cut short
    pub fn clear_all_in_flight(&mut self) {
        self.in_flight.clear();
    }

    pub fn is_in_flight(&self, id: &Uuid) -> bool {
        self.in_flight.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn enqueue(
        queue: &mut MutationQueue,
        entity: &EntityId,
        kind: MutationKind,
        payload: Value,
    ) -> Planned {
        let planned = queue.plan(entity, kind, fields(payload));
        queue.install(planned.record.clone());
        planned
    }

    #[test]
    fn test_updates_fold_into_unsent_create() {
        let mut queue = MutationQueue::new();
        let p1 = EntityId::product("p1");

        let create = enqueue(&mut queue, &p1, MutationKind::Create, json!({"quantity": 0}));
        let update = enqueue(&mut queue, &p1, MutationKind::Update, json!({"quantity": 3}));

        assert!(update.coalesced);
        assert_eq!(update.record.id, create.record.id);
        assert_eq!(queue.len(), 1);

        let records = queue.peek_ordered(&p1);
        assert_eq!(records[0].kind, MutationKind::Create);
        assert_eq!(Value::Object(records[0].payload.clone()), json!({"quantity": 3}));
    }

    #[test]
    fn test_no_folding_into_attempted_or_in_flight_records() {
        let mut queue = MutationQueue::new();
        let p1 = EntityId::product("p1");

        let first = enqueue(&mut queue, &p1, MutationKind::Update, json!({"a": 1}));
        queue.mark_in_flight(first.record.id);
        let second = enqueue(&mut queue, &p1, MutationKind::Update, json!({"b": 2}));
        assert!(!second.coalesced);

        let mut attempted = second.record.clone();
        attempted.attempts = 1;
        queue.install(attempted);
        let third = enqueue(&mut queue, &p1, MutationKind::Update, json!({"c": 3}));
        assert!(!third.coalesced);

        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_no_folding_into_dispatched_record_after_marks_clear() {
        let mut queue = MutationQueue::new();
        let p1 = EntityId::product("p1");

        let sent = enqueue(&mut queue, &p1, MutationKind::Update, json!({"quantity": 4}));
        let mut dispatched = sent.record.clone();
        dispatched.dispatched = true;
        queue.install(dispatched);
        queue.mark_in_flight(sent.record.id);
        queue.clear_all_in_flight();

        let edit = enqueue(&mut queue, &p1, MutationKind::Update, json!({"quantity": 9}));
        assert!(!edit.coalesced);
        assert_ne!(edit.record.id, sent.record.id);

        let records = queue.peek_ordered(&p1);
        assert_eq!(records.len(), 2);
        assert_eq!(Value::Object(records[0].payload.clone()), json!({"quantity": 4}));
    }

    #[test]
    fn test_no_folding_across_delete() {
        let mut queue = MutationQueue::new();
        let p1 = EntityId::product("p1");
        enqueue(&mut queue, &p1, MutationKind::Delete, json!({}));

        let planned = queue.plan(&p1, MutationKind::Update, fields(json!({"a": 1})));
        assert!(!planned.coalesced);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut queue = MutationQueue::new();
        let p1 = EntityId::product("p1");
        let planned = enqueue(&mut queue, &p1, MutationKind::Create, json!({"a": 1}));

        assert!(queue.remove(&planned.record.id).is_some());
        assert!(queue.remove(&planned.record.id).is_none());
        assert_eq!(queue.len(), 0);
        assert!(!queue.has_pending(&p1));
    }

    #[test]
    fn test_pending_entities_follow_log_order() {
        let mut queue = MutationQueue::new();
        let a = EntityId::product("a");
        let b = EntityId::product("b");
        enqueue(&mut queue, &b, MutationKind::Create, json!({"x": 1}));
        enqueue(&mut queue, &a, MutationKind::Create, json!({"x": 1}));
        enqueue(&mut queue, &b, MutationKind::Delete, json!({}));

        assert_eq!(queue.pending_entities(), vec![b.clone(), a]);
        let kinds: Vec<MutationKind> = queue.peek_ordered(&b).iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![MutationKind::Create, MutationKind::Delete]);
    }

    #[test]
    fn test_from_records_resumes_sequence() {
        let p1 = EntityId::product("p1");
        let record = MutationRecord::new(41, p1.clone(), MutationKind::Create, Fields::new());
        let queue = MutationQueue::from_records(vec![record]);

        let planned = queue.plan(&p1, MutationKind::Delete, Fields::new());
        assert_eq!(planned.record.seq, 42);
    }
}
