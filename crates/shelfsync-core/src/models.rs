//! Data models for shelfsync
//!
//! Defines entity snapshots, mutation records and the sync cursor.
//! Payloads are JSON objects so the core stays agnostic of the product
//! and transaction schemas; only the fields the alerts engine reads are typed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Field-level payload of an entity or mutation
pub type Fields = Map<String, Value>;

/// Stock on hand
pub const QUANTITY_FIELD: &str = "quantity";
/// Quantity at or below which a product needs reordering
pub const REORDER_THRESHOLD_FIELD: &str = "reorder_threshold";
/// Calendar expiry date, `YYYY-MM-DD`
pub const EXPIRY_DATE_FIELD: &str = "expiry_date";

/// Expiry dates are stored as plain calendar dates
pub const EXPIRY_DATE_FORMAT: &str = "%Y-%m-%d";

/// Kinds of domain records tracked by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Product,
    Transaction,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Transaction => "transaction",
        }
    }
}

/// Stable identifier of an entity, rendered as `kind:key`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    pub kind: EntityKind,
    pub key: String,
}

impl EntityId {
    pub fn new(kind: EntityKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }

    pub fn product(key: impl Into<String>) -> Self {
        Self::new(EntityKind::Product, key)
    }

    pub fn transaction(key: impl Into<String>) -> Self {
        Self::new(EntityKind::Transaction, key)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.key)
    }
}

impl FromStr for EntityId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, key) = s
            .split_once(':')
            .ok_or_else(|| format!("entity id '{}' is missing a kind prefix", s))?;
        let kind = match kind {
            "product" => EntityKind::Product,
            "transaction" => EntityKind::Transaction,
            other => return Err(format!("unknown entity kind '{}'", other)),
        };
        if key.is_empty() {
            return Err(format!("entity id '{}' has an empty key", s));
        }
        Ok(Self::new(kind, key))
    }
}

impl TryFrom<String> for EntityId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.to_string()
    }
}

/// Last known state of one domain record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySnapshot {
    pub id: EntityId,
    /// Revision assigned by the remote store (0 until first acknowledged)
    pub revision: u64,
    /// Optimistic state: confirmed state with pending mutations applied
    pub payload: Fields,
    /// State last acknowledged by the remote store, if any
    pub confirmed: Option<Fields>,
    /// Has unacknowledged local mutations
    pub dirty: bool,
    /// Deleted locally, awaiting acknowledgment
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

impl EntitySnapshot {
    /// Snapshot created by a local create, never seen by the remote store
    pub fn local(id: EntityId, payload: Fields) -> Self {
        Self {
            id,
            revision: 0,
            payload,
            confirmed: None,
            dirty: true,
            deleted: false,
            updated_at: Utc::now(),
        }
    }

    /// Snapshot mirroring remote state exactly
    pub fn from_remote(id: EntityId, revision: u64, payload: Fields) -> Self {
        Self {
            id,
            revision,
            confirmed: Some(payload.clone()),
            payload,
            dirty: false,
            deleted: false,
            updated_at: Utc::now(),
        }
    }

    pub fn is_product(&self) -> bool {
        self.id.kind == EntityKind::Product
    }

    /// Visible to queries: not tombstoned by a pending delete
    pub fn is_live(&self) -> bool {
        !self.deleted
    }

    pub fn quantity(&self) -> Option<f64> {
        self.payload.get(QUANTITY_FIELD).and_then(Value::as_f64)
    }

    pub fn reorder_threshold(&self) -> Option<f64> {
        self.payload
            .get(REORDER_THRESHOLD_FIELD)
            .and_then(Value::as_f64)
    }

    pub fn expiry_date(&self) -> Option<NaiveDate> {
        self.payload
            .get(EXPIRY_DATE_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, EXPIRY_DATE_FORMAT).ok())
    }
}

/// Kinds of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(MutationKind::Create),
            "update" => Ok(MutationKind::Update),
            "delete" => Ok(MutationKind::Delete),
            other => Err(format!("unknown mutation kind '{}'", other)),
        }
    }
}

/// One entry of the append-only mutation log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MutationRecord {
    /// Unique token, doubles as the idempotency token for the remote store
    pub id: Uuid,
    /// Position in the log; program order across all entities
    pub seq: u64,
    pub entity_id: EntityId,
    pub kind: MutationKind,
    pub payload: Fields,
    pub client_timestamp: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub attempts: u32,
    /// Handed to the remote store at least once, so the remote may hold it
    #[serde(default)]
    pub dispatched: bool,
}

impl MutationRecord {
    pub fn new(seq: u64, entity_id: EntityId, kind: MutationKind, payload: Fields) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq,
            entity_id,
            kind,
            payload,
            client_timestamp: Utc::now(),
            attempts: 0,
            dispatched: false,
        }
    }

    /// Token for a merge resubmission against a given server revision
    ///
    /// Deterministic, so a retried merge is still recognisable as a duplicate.
    pub fn merge_token(&self, server_revision: u64) -> Uuid {
        Uuid::new_v5(&self.id, &server_revision.to_be_bytes())
    }
}

/// Watermark of the last successful pull
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncCursor(pub u64);

/// Connectivity as seen by the network monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    Offline,
}

impl NetworkStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online)
    }
}

/// Connectivity plus the pending-mutation badge, as exposed to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
    pub status: NetworkStatus,
    pub pending_count: usize,
}

/// Apply a mutation payload on top of an existing field set
pub fn overlay(base: &mut Fields, changes: &Fields) {
    for (key, value) in changes {
        base.insert(key.clone(), value.clone());
    }
}
