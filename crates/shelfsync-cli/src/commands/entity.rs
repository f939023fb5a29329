//! Product and transaction command handlers
//!
//! Writes go through the mutation queue only: they are validated, persisted
//! and applied locally, then left for the sync task to deliver.

use anyhow::{bail, Context, Result};
use serde_json::Value;

use shelfsync_core::{EntityId, EntityKind, MutationKind, Session, Store};

use super::confirm;
use crate::output::{Output, OutputFormat};

/// Queue a create from a JSON object of fields
pub fn add(
    store: &mut Store,
    session: &Session,
    id: EntityId,
    fields: &str,
    output: &Output,
) -> Result<()> {
    let payload = parse_fields(fields)?;
    let mutation = store
        .enqueue(session, &id, MutationKind::Create, payload)
        .with_context(|| format!("Failed to add {}", id))?;

    output.success(&format!(
        "Queued create of {} ({})",
        id,
        &mutation.to_string()[..8]
    ));
    if let Some(snapshot) = store.snapshot(&id) {
        if !output.is_json() {
            output.print_snapshot(snapshot);
        }
    }

    Ok(())
}

/// Queue a field-wise update
pub fn update(
    store: &mut Store,
    session: &Session,
    id: EntityId,
    fields: &str,
    output: &Output,
) -> Result<()> {
    let payload = parse_fields(fields)?;
    store
        .enqueue(session, &id, MutationKind::Update, payload)
        .with_context(|| format!("Failed to update {}", id))?;

    output.success(&format!("Queued update of {}", id));
    if let Some(snapshot) = store.snapshot(&id) {
        if !output.is_json() {
            output.print_snapshot(snapshot);
        }
    }

    Ok(())
}

/// Queue a delete, asking first unless `yes` is set
pub fn delete(
    store: &mut Store,
    session: &Session,
    id: EntityId,
    yes: bool,
    output: &Output,
) -> Result<()> {
    if store.snapshot(&id).is_none() {
        bail!("{} not found", id);
    }

    if !yes && output.format == OutputFormat::Human {
        println!("Delete {}", id);
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    store
        .enqueue(session, &id, MutationKind::Delete, Value::Null)
        .with_context(|| format!("Failed to delete {}", id))?;

    output.success(&format!("Queued delete of {}", id));
    Ok(())
}

/// List live entities of one kind
pub fn list(store: &Store, kind: EntityKind, output: &Output) -> Result<()> {
    let entities = store.entities(kind);
    output.print_snapshots(&entities);
    Ok(())
}

/// Show one entity, including a pending-delete tombstone
pub fn show(store: &Store, id: EntityId, output: &Output) -> Result<()> {
    let snapshot = store
        .snapshot(&id)
        .ok_or_else(|| anyhow::anyhow!("{} not found", id))?;
    output.print_snapshot(snapshot);
    Ok(())
}

/// Parse a command-line JSON object
fn parse_fields(raw: &str) -> Result<Value> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("Fields are not valid JSON: {}", raw))?;
    if !value.is_object() {
        bail!("Fields must be a JSON object, e.g. '{{\"quantity\": 3}}'");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfsync_core::{Config, EnqueueError, Role};
    use tempfile::TempDir;

    fn setup() -> (Store, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        };
        let store = Store::open_with_config(&config).unwrap();
        (store, temp_dir)
    }

    fn quiet() -> Output {
        Output::new(OutputFormat::Quiet)
    }

    #[test]
    fn test_add_then_update() {
        let (mut store, _temp) = setup();
        let admin = Session::new("dana", Role::Admin);
        let id = EntityId::product("milk");

        add(
            &mut store,
            &admin,
            id.clone(),
            r#"{"name": "Milk", "quantity": 8, "reorder_threshold": 3}"#,
            &quiet(),
        )
        .unwrap();
        update(&mut store, &admin, id.clone(), r#"{"quantity": 2}"#, &quiet()).unwrap();

        let snapshot = store.snapshot(&id).unwrap();
        assert_eq!(snapshot.quantity(), Some(2.0));
        assert!(snapshot.dirty);
        // The update folds into the untried create
        assert_eq!(store.pending_count(), 1);
        assert_eq!(store.low_stock().len(), 1);
    }

    #[test]
    fn test_employee_cannot_update() {
        let (mut store, _temp) = setup();
        let employee = Session::new("sam", Role::Employee);
        let id = EntityId::product("bread");

        add(&mut store, &employee, id.clone(), r#"{"name": "Bread"}"#, &quiet()).unwrap();
        let err = update(&mut store, &employee, id, r#"{"quantity": 1}"#, &quiet()).unwrap_err();

        let enqueue = err.downcast_ref::<EnqueueError>().unwrap();
        assert!(enqueue.is_permission_denied());
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let (mut store, _temp) = setup();
        let admin = Session::new("dana", Role::Admin);
        let id = EntityId::product("eggs");

        add(&mut store, &admin, id.clone(), r#"{"name": "Eggs"}"#, &quiet()).unwrap();
        delete(&mut store, &admin, id.clone(), true, &quiet()).unwrap();

        assert!(store.snapshot(&id).unwrap().deleted);
        assert!(store.entities(EntityKind::Product).is_empty());
        assert!(show(&store, id, &quiet()).is_ok());
    }

    #[test]
    fn test_delete_unknown_entity() {
        let (mut store, _temp) = setup();
        let admin = Session::new("dana", Role::Admin);
        let err = delete(&mut store, &admin, EntityId::product("ghost"), true, &quiet());
        assert!(err.is_err());
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_parse_fields_rejects_non_objects() {
        assert!(parse_fields(r#"{"quantity": 1}"#).is_ok());
        assert!(parse_fields("[1, 2]").is_err());
        assert!(parse_fields("quantity=1").is_err());
    }

    #[test]
    fn test_invalid_typed_field_is_refused() {
        let (mut store, _temp) = setup();
        let admin = Session::new("dana", Role::Admin);
        let err = add(
            &mut store,
            &admin,
            EntityId::product("yogurt"),
            r#"{"expiry_date": "next tuesday"}"#,
            &quiet(),
        )
        .unwrap_err();

        assert!(err.downcast_ref::<EnqueueError>().unwrap().is_validation());
        assert!(store.snapshot(&EntityId::product("yogurt")).is_none());
    }
}
