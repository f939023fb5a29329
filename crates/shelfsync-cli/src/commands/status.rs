//! Status command handler

use anyhow::Result;
use chrono::{DateTime, Local, Utc};

use shelfsync_core::{Config, EntityKind, Store};

use crate::output::{Output, OutputFormat};

/// Show local sync status
pub fn show(store: &Store, config: &Config, output: &Output) -> Result<()> {
    let pending = store.pending_count();
    let cursor = store.cursor().0;
    let last_synced = store.last_synced();
    let products = store.entities(EntityKind::Product).len();
    let transactions = store.entities(EntityKind::Transaction).len();
    let alerts = store.alert_view().badge_count();

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "pending": pending,
                    "cursor": cursor,
                    "last_synced": last_synced.map(|at| at.to_rfc3339()),
                    "sync_enabled": config.sync_enabled,
                    "data_dir": config.data_dir,
                    "role": config.role,
                    "counts": {
                        "products": products,
                        "transactions": transactions
                    },
                    "alerts": alerts
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", pending);
        }
        OutputFormat::Human => {
            println!("Shelfsync Status");
            println!("================");
            println!();
            println!("Sync:");
            println!(
                "  Status:  {}",
                if config.sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            println!("  Pending: {}", pending);
            println!("  Cursor:  {}", cursor);
            println!("  Last:    {}", last_synced_label(last_synced));
            println!();
            println!("Storage:");
            println!("  Location: {}", config.data_dir.display());
            println!();
            println!("Contents:");
            println!("  Products:     {}", products);
            println!("  Transactions: {}", transactions);
            println!("  Alerts:       {}", alerts);
        }
    }

    Ok(())
}

fn last_synced_label(at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => "never".to_string(),
    }
}
