//! Derived alerts engine
//!
//! Two views over the live product snapshots:
//! - **low stock**: quantity at or below the product's reorder threshold
//! - **expiring**: expiry date between today and today + N days
//!
//! The store calls [`AlertsEngine::refresh`] after every committed write, so
//! the low-stock view is never older than the last write. The expiring view
//! depends on the calendar day as well, so its cache is keyed by
//! (snapshot version, day, horizon) and recomputed lazily on the first query
//! after either changes.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{Days, Local, NaiveDate};
use serde::Serialize;

use crate::models::{EntityId, EntitySnapshot};

/// Source of the current calendar date
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local wall-clock date
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Snapshot of both alert views
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertView {
    /// Store version the view was computed from
    pub version: u64,
    pub day: NaiveDate,
    pub horizon_days: u32,
    pub low_stock: Vec<EntitySnapshot>,
    pub expiring: Vec<EntitySnapshot>,
}

impl AlertView {
    /// Combined badge count, as shown next to the dashboard entry
    pub fn badge_count(&self) -> usize {
        self.low_stock.len() + self.expiring.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AlertKeys {
    day: NaiveDate,
    low_stock: Vec<EntityId>,
    expiring: Vec<EntityId>,
}

struct ExpiringEntry {
    version: u64,
    day: NaiveDate,
    items: Vec<EntitySnapshot>,
}

/// Cached alert views, invalidated by store writes and day rollover
pub struct AlertsEngine {
    clock: Arc<dyn Clock>,
    horizon_days: u32,
    version: u64,
    low_stock: Vec<EntitySnapshot>,
    expiring: RefCell<HashMap<u32, ExpiringEntry>>,
    published: Option<AlertKeys>,
    changed: bool,
}

impl AlertsEngine {
    pub fn new(clock: Arc<dyn Clock>, horizon_days: u32) -> Self {
        Self {
            clock,
            horizon_days,
            version: 0,
            low_stock: Vec::new(),
            expiring: RefCell::new(HashMap::new()),
            published: None,
            changed: false,
        }
    }

    pub fn horizon_days(&self) -> u32 {
        self.horizon_days
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Recompute after a write that produced `version`
    ///
    /// Also used on day rollover with an unchanged version; the expiring
    /// cache notices the new day on its own.
    pub fn refresh(&mut self, snapshots: &BTreeMap<EntityId, EntitySnapshot>, version: u64) {
        self.version = version;
        self.low_stock = snapshots
            .values()
            .filter(|s| is_low_stock(s))
            .cloned()
            .collect();
        self.expiring
            .borrow_mut()
            .retain(|_, entry| entry.version == version);

        let day = self.clock.today();
        let expiring = self.expiring_within(snapshots, self.horizon_days);
        let keys = AlertKeys {
            day,
            low_stock: self.low_stock.iter().map(|s| s.id.clone()).collect(),
            expiring: expiring.iter().map(|s| s.id.clone()).collect(),
        };

        if self.published.as_ref() != Some(&keys) {
            self.published = Some(keys);
            self.changed = true;
        }
    }

    /// Products at or below their reorder threshold
    pub fn low_stock(&self) -> &[EntitySnapshot] {
        &self.low_stock
    }

    /// Products expiring between today and today + `days`, soonest first
    pub fn expiring_within(
        &self,
        snapshots: &BTreeMap<EntityId, EntitySnapshot>,
        days: u32,
    ) -> Vec<EntitySnapshot> {
        let today = self.clock.today();
        if let Some(entry) = self.expiring.borrow().get(&days) {
            if entry.version == self.version && entry.day == today {
                return entry.items.clone();
            }
        }

        let items = compute_expiring(snapshots, today, days);
        self.expiring.borrow_mut().insert(
            days,
            ExpiringEntry {
                version: self.version,
                day: today,
                items: items.clone(),
            },
        );
        items
    }

    /// Both views at the configured horizon
    pub fn view(&self, snapshots: &BTreeMap<EntityId, EntitySnapshot>) -> AlertView {
        AlertView {
            version: self.version,
            day: self.clock.today(),
            horizon_days: self.horizon_days,
            low_stock: self.low_stock.clone(),
            expiring: self.expiring_within(snapshots, self.horizon_days),
        }
    }

    /// True once per change of either view since the last call
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }
}

fn is_low_stock(snapshot: &EntitySnapshot) -> bool {
    if !snapshot.is_product() || !snapshot.is_live() {
        return false;
    }
    match (snapshot.quantity(), snapshot.reorder_threshold()) {
        (Some(quantity), Some(threshold)) => quantity <= threshold,
        _ => false,
    }
}

fn compute_expiring(
    snapshots: &BTreeMap<EntityId, EntitySnapshot>,
    today: NaiveDate,
    days: u32,
) -> Vec<EntitySnapshot> {
    // Windows reaching past the calendar's end cover everything ahead
    let horizon = today
        .checked_add_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MAX);
    let mut items: Vec<(NaiveDate, EntitySnapshot)> = snapshots
        .values()
        .filter(|s| s.is_product() && s.is_live())
        .filter_map(|s| s.expiry_date().map(|d| (d, s)))
        .filter(|(date, _)| *date >= today && *date <= horizon)
        .map(|(date, s)| (date, s.clone()))
        .collect();
    items.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
    items.into_iter().map(|(_, s)| s).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::Fields;
    use serde_json::json;
    use std::sync::Mutex;

    /// Clock pinned to a settable date
    pub(crate) struct FixedClock(Mutex<NaiveDate>);

    impl FixedClock {
        pub(crate) fn new(date: NaiveDate) -> Self {
            Self(Mutex::new(date))
        }

        pub(crate) fn set(&self, date: NaiveDate) {
            *self.0.lock().unwrap() = date;
        }
    }

    impl Clock for FixedClock {
        fn today(&self) -> NaiveDate {
            *self.0.lock().unwrap()
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn product(key: &str, value: serde_json::Value) -> (EntityId, EntitySnapshot) {
        let id = EntityId::product(key);
        let fields: Fields = value.as_object().cloned().unwrap();
        (id.clone(), EntitySnapshot::from_remote(id, 1, fields))
    }

    fn snapshots(items: Vec<(EntityId, EntitySnapshot)>) -> BTreeMap<EntityId, EntitySnapshot> {
        items.into_iter().collect()
    }

    #[test]
    fn test_low_stock_boundary() {
        let clock = Arc::new(FixedClock::new(date(2026, 10, 16)));
        let mut engine = AlertsEngine::new(clock, 30);
        let set = snapshots(vec![
            product("at", json!({"quantity": 5, "reorder_threshold": 5})),
            product("below", json!({"quantity": 1, "reorder_threshold": 5})),
            product("above", json!({"quantity": 9, "reorder_threshold": 5})),
            product("untracked", json!({"quantity": 0})),
        ]);

        engine.refresh(&set, 1);

        let keys: Vec<&str> = engine.low_stock().iter().map(|s| s.id.key.as_str()).collect();
        assert_eq!(keys, vec!["at", "below"]);
    }

    #[test]
    fn test_transactions_and_tombstones_are_ignored() {
        let clock = Arc::new(FixedClock::new(date(2026, 10, 16)));
        let mut engine = AlertsEngine::new(clock, 30);

        let (id, mut gone) = product("gone", json!({"quantity": 0, "reorder_threshold": 5}));
        gone.deleted = true;
        let tx_id = EntityId::transaction("t1");
        let tx = EntitySnapshot::from_remote(
            tx_id.clone(),
            1,
            json!({"quantity": 0, "reorder_threshold": 5})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let set = snapshots(vec![(id, gone), (tx_id, tx)]);

        engine.refresh(&set, 1);
        assert!(engine.low_stock().is_empty());
    }

    #[test]
    fn test_expiring_window() {
        let clock = Arc::new(FixedClock::new(date(2026, 10, 16)));
        let mut engine = AlertsEngine::new(clock, 30);
        let set = snapshots(vec![
            product("expired", json!({"expiry_date": "2026-10-15"})),
            product("today", json!({"expiry_date": "2026-10-16"})),
            product("edge", json!({"expiry_date": "2026-10-23"})),
            product("later", json!({"expiry_date": "2026-10-24"})),
            product("soon", json!({"expiry_date": "2026-10-18"})),
            product("undated", json!({"expiry_date": null})),
        ]);
        engine.refresh(&set, 1);

        let keys: Vec<String> = engine
            .expiring_within(&set, 7)
            .into_iter()
            .map(|s| s.id.key)
            .collect();
        assert_eq!(keys, vec!["today", "soon", "edge"]);
    }

    #[test]
    fn test_unbounded_window_covers_every_future_date() {
        let clock = Arc::new(FixedClock::new(date(2026, 10, 16)));
        let mut engine = AlertsEngine::new(clock, u32::MAX);
        let set = snapshots(vec![
            product("expired", json!({"expiry_date": "2026-10-15"})),
            product("far", json!({"expiry_date": "9999-12-31"})),
            product("soon", json!({"expiry_date": "2026-10-18"})),
        ]);
        engine.refresh(&set, 1);

        let keys: Vec<String> = engine
            .expiring_within(&set, u32::MAX)
            .into_iter()
            .map(|s| s.id.key)
            .collect();
        assert_eq!(keys, vec!["soon", "far"]);
        assert_eq!(engine.view(&set).expiring.len(), 2);
    }

    #[test]
    fn test_expiring_cache_rolls_over_with_the_day() {
        let clock = Arc::new(FixedClock::new(date(2026, 10, 16)));
        let mut engine = AlertsEngine::new(clock.clone(), 30);
        let set = snapshots(vec![product("milk", json!({"expiry_date": "2026-10-20"}))]);
        engine.refresh(&set, 1);

        assert!(engine.expiring_within(&set, 3).is_empty());

        // No write happened, only the day changed
        clock.set(date(2026, 10, 17));
        assert_eq!(engine.expiring_within(&set, 3).len(), 1);

        clock.set(date(2026, 10, 21));
        assert!(engine.expiring_within(&set, 3).is_empty());
    }

    #[test]
    fn test_change_flag_only_on_real_changes() {
        let clock = Arc::new(FixedClock::new(date(2026, 10, 16)));
        let mut engine = AlertsEngine::new(clock, 30);

        let mut set = snapshots(vec![product(
            "milk",
            json!({"quantity": 9, "reorder_threshold": 5}),
        )]);
        engine.refresh(&set, 1);
        assert!(engine.take_changed());
        assert!(!engine.take_changed());

        // Quantity changes but stays above threshold
        set.get_mut(&EntityId::product("milk"))
            .unwrap()
            .payload
            .insert("quantity".into(), json!(7));
        engine.refresh(&set, 2);
        assert!(!engine.take_changed());

        set.get_mut(&EntityId::product("milk"))
            .unwrap()
            .payload
            .insert("quantity".into(), json!(2));
        engine.refresh(&set, 3);
        assert!(engine.take_changed());
        assert_eq!(engine.view(&set).badge_count(), 1);
    }
}
