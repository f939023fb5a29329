//! In-memory remote store for tests

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::remote::{PushOutcome, PushRequest, RemoteEntity, RemoteStore};
use crate::error::RemoteError;
use crate::models::{overlay, EntityId, Fields, MutationKind, SyncCursor};

/// Scripted behaviour for the next push
pub(crate) enum Script {
    /// Fail without applying anything
    Fail(RemoteError),
    /// Another client writes these fields first, then the push is handled
    ConcurrentWrite(Fields),
    /// Apply the push, then lose the acknowledgement
    DropAck,
}

#[derive(Default)]
struct State {
    revision: u64,
    entities: BTreeMap<EntityId, RemoteEntity>,
    /// Idempotency token to the revision it produced
    applied: HashMap<Uuid, u64>,
    pushes: Vec<PushRequest>,
    scripts: VecDeque<Script>,
    pull_failures: VecDeque<RemoteError>,
    pulls: usize,
    push_delay: Option<Duration>,
    /// Applied first, answered after this long
    ack_delay: Option<Duration>,
}

/// Authoritative store with a global revision counter
#[derive(Default)]
pub(crate) struct FakeRemote {
    state: Mutex<State>,
}

impl FakeRemote {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Server-side write by some other client
    pub(crate) fn write(&self, id: &EntityId, fields: Fields) -> u64 {
        let mut state = self.state();
        write_fields(&mut state, id, fields)
    }

    pub(crate) fn entity(&self, id: &EntityId) -> Option<RemoteEntity> {
        self.state().entities.get(id).cloned()
    }

    pub(crate) fn script(&self, script: Script) {
        self.state().scripts.push_back(script);
    }

    pub(crate) fn fail_next_pull(&self, error: RemoteError) {
        self.state().pull_failures.push_back(error);
    }

    pub(crate) fn delay_pushes(&self, delay: Duration) {
        self.state().push_delay = Some(delay);
    }

    /// Apply each push right away but hold back the answer
    pub(crate) fn delay_acks(&self, delay: Duration) {
        self.state().ack_delay = Some(delay);
    }

    pub(crate) fn pushes(&self) -> Vec<PushRequest> {
        self.state().pushes.clone()
    }

    pub(crate) fn push_count(&self) -> usize {
        self.state().pushes.len()
    }

    pub(crate) fn pull_count(&self) -> usize {
        self.state().pulls
    }
}

fn write_fields(state: &mut State, id: &EntityId, fields: Fields) -> u64 {
    state.revision += 1;
    let revision = state.revision;
    let entity = state
        .entities
        .entry(id.clone())
        .or_insert_with(|| RemoteEntity {
            entity_id: id.clone(),
            revision,
            payload: Fields::new(),
            deleted: false,
        });
    overlay(&mut entity.payload, &fields);
    entity.revision = revision;
    entity.deleted = false;
    revision
}

fn apply(state: &mut State, request: &PushRequest) -> Result<PushOutcome, RemoteError> {
    if let Some(revision) = state.applied.get(&request.idempotency_token) {
        return Ok(PushOutcome::Acknowledged {
            revision: *revision,
        });
    }

    let current = state.entities.get(&request.entity_id).cloned();
    let server_revision = current.as_ref().map_or(0, |e| e.revision);
    if server_revision > request.base_revision {
        if let Some(server) = current {
            return Ok(PushOutcome::Conflict { server });
        }
    }

    state.revision += 1;
    let revision = state.revision;
    let payload = match (request.kind, current) {
        (MutationKind::Create, _) => request.payload.clone(),
        (MutationKind::Update, Some(existing)) if !existing.deleted => {
            let mut payload = existing.payload;
            overlay(&mut payload, &request.payload);
            payload
        }
        (MutationKind::Update, _) => {
            return Err(RemoteError::Fatal(format!(
                "update of unknown entity {}",
                request.entity_id
            )));
        }
        (MutationKind::Delete, _) => Fields::new(),
    };

    state.entities.insert(
        request.entity_id.clone(),
        RemoteEntity {
            entity_id: request.entity_id.clone(),
            revision,
            payload,
            deleted: request.kind == MutationKind::Delete,
        },
    );
    state.applied.insert(request.idempotency_token, revision);
    Ok(PushOutcome::Acknowledged { revision })
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn push(&self, request: PushRequest) -> Result<PushOutcome, RemoteError> {
        let delay = self.state().push_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (result, ack_delay) = {
            let mut state = self.state();
            state.pushes.push(request.clone());
            let result = match state.scripts.pop_front() {
                Some(Script::Fail(error)) => Err(error),
                Some(Script::ConcurrentWrite(fields)) => {
                    write_fields(&mut state, &request.entity_id, fields);
                    apply(&mut state, &request)
                }
                Some(Script::DropAck) => apply(&mut state, &request)
                    .and(Err(RemoteError::Transient("connection reset".into()))),
                None => apply(&mut state, &request),
            };
            (result, state.ack_delay)
        };

        if let Some(delay) = ack_delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn pull_since(&self, cursor: SyncCursor) -> Result<Vec<RemoteEntity>, RemoteError> {
        let mut state = self.state();
        state.pulls += 1;
        if let Some(error) = state.pull_failures.pop_front() {
            return Err(error);
        }

        let mut changed: Vec<RemoteEntity> = state
            .entities
            .values()
            .filter(|e| e.revision > cursor.0)
            .cloned()
            .collect();
        changed.sort_by_key(|e| e.revision);
        Ok(changed)
    }
}
