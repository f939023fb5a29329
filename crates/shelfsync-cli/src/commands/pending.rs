//! Pending queue command handler

use anyhow::Result;

use shelfsync_core::{EntityId, Store};

use crate::output::Output;

/// List pending mutations, optionally for one entity only
pub fn list(store: &Store, entity: Option<EntityId>, output: &Output) -> Result<()> {
    let records = match entity {
        Some(ref id) => store.peek_ordered(id),
        None => store.pending_records(),
    };
    output.print_records(&records);
    Ok(())
}
