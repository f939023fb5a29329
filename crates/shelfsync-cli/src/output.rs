//! Output formatting for CLI
//!
//! Every command prints through [`Output`] so the three modes stay consistent:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;
use serde_json::Value;

use shelfsync_core::{AlertView, EntitySnapshot, MutationRecord};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print one entity with its sync state
    pub fn print_snapshot(&self, snapshot: &EntitySnapshot) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:       {}", snapshot.id);
                println!("Revision: {}", snapshot.revision);
                println!("State:    {}", sync_state(snapshot));
                println!("Updated:  {}", snapshot.updated_at.format("%Y-%m-%d %H:%M"));
                if !snapshot.payload.is_empty() {
                    println!();
                    for (key, value) in &snapshot.payload {
                        println!("  {:<18} {}", key, render_value(value));
                    }
                }
            }
            OutputFormat::Json => print_json(snapshot),
            OutputFormat::Quiet => println!("{}", snapshot.id),
        }
    }

    /// Print a list of entities
    pub fn print_snapshots(&self, snapshots: &[EntitySnapshot]) {
        match self.format {
            OutputFormat::Human => {
                if snapshots.is_empty() {
                    println!("No entities found.");
                    return;
                }
                for snapshot in snapshots {
                    println!(
                        "{:<32} | {:<9} | {}",
                        truncate(&snapshot.id.to_string(), 32),
                        sync_state(snapshot),
                        truncate(&summarize(snapshot), 50)
                    );
                }
                println!("\n{} entity(ies)", snapshots.len());
            }
            OutputFormat::Json => print_json(&snapshots),
            OutputFormat::Quiet => {
                for snapshot in snapshots {
                    println!("{}", snapshot.id);
                }
            }
        }
    }

    /// Print pending mutation records in log order
    pub fn print_records(&self, records: &[MutationRecord]) {
        match self.format {
            OutputFormat::Human => {
                if records.is_empty() {
                    println!("Nothing pending.");
                    return;
                }
                for record in records {
                    println!(
                        "{:>4} | {} | {:<6} | {:<28} | attempts: {}{}",
                        record.seq,
                        &record.id.to_string()[..8],
                        record.kind,
                        truncate(&record.entity_id.to_string(), 28),
                        record.attempts,
                        if record.dispatched { " (sent)" } else { "" }
                    );
                }
                println!("\n{} pending mutation(s)", records.len());
            }
            OutputFormat::Json => print_json(&records),
            OutputFormat::Quiet => {
                for record in records {
                    println!("{}", record.id);
                }
            }
        }
    }

    /// Print both alert lists
    pub fn print_alerts(&self, view: &AlertView) {
        match self.format {
            OutputFormat::Human => {
                println!("Alerts for {}", view.day);
                println!();
                println!("── Low stock ({}) ──", view.low_stock.len());
                for snapshot in &view.low_stock {
                    println!(
                        "{:<32} quantity {} / threshold {}",
                        truncate(&snapshot.id.to_string(), 32),
                        render_number(snapshot.quantity()),
                        render_number(snapshot.reorder_threshold())
                    );
                }
                println!();
                println!(
                    "── Expiring within {} day(s) ({}) ──",
                    view.horizon_days,
                    view.expiring.len()
                );
                for snapshot in &view.expiring {
                    let expiry = snapshot
                        .expiry_date()
                        .map(|d| d.to_string())
                        .unwrap_or_default();
                    println!("{:<32} expires {}", truncate(&snapshot.id.to_string(), 32), expiry);
                }
                println!();
                println!("{} alert(s)", view.badge_count());
            }
            OutputFormat::Json => print_json(view),
            OutputFormat::Quiet => println!("{}", view.badge_count()),
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

fn sync_state(snapshot: &EntitySnapshot) -> &'static str {
    if snapshot.deleted {
        "deleting"
    } else if snapshot.dirty {
        "pending"
    } else {
        "synced"
    }
}

/// One-line summary of a payload: its name if it has one, otherwise its keys
fn summarize(snapshot: &EntitySnapshot) -> String {
    if let Some(name) = snapshot.payload.get("name").and_then(Value::as_str) {
        return name.to_string();
    }
    snapshot
        .payload
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "(none)".to_string(),
        other => other.to_string(),
    }
}

fn render_number(value: Option<f64>) -> String {
    match value {
        Some(n) if n.fract() == 0.0 => format!("{}", n as i64),
        Some(n) => n.to_string(),
        None => "-".to_string(),
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shelfsync_core::EntityId;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("crème brûlée au café", 8), "crème...");
    }

    #[test]
    fn test_sync_state() {
        let payload = json!({"name": "Milk"}).as_object().cloned().unwrap();
        let mut snapshot = EntitySnapshot::from_remote(EntityId::product("milk"), 3, payload);
        assert_eq!(sync_state(&snapshot), "synced");

        snapshot.dirty = true;
        assert_eq!(sync_state(&snapshot), "pending");

        snapshot.deleted = true;
        assert_eq!(sync_state(&snapshot), "deleting");
    }

    #[test]
    fn test_summarize_prefers_name() {
        let named = json!({"name": "Oat milk", "quantity": 3});
        let snapshot = EntitySnapshot::local(
            EntityId::product("oat"),
            named.as_object().cloned().unwrap(),
        );
        assert_eq!(summarize(&snapshot), "Oat milk");

        let unnamed = json!({"product": "oat", "delta": -2});
        let snapshot = EntitySnapshot::local(
            EntityId::transaction("t1"),
            unnamed.as_object().cloned().unwrap(),
        );
        assert_eq!(summarize(&snapshot), "delta, product");
    }

    #[test]
    fn test_render_number() {
        assert_eq!(render_number(Some(4.0)), "4");
        assert_eq!(render_number(Some(2.5)), "2.5");
        assert_eq!(render_number(None), "-");
    }
}
