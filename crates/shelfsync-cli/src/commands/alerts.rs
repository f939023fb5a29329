//! Alerts command handler

use anyhow::Result;

use shelfsync_core::Store;

use crate::output::Output;

/// Show low-stock and expiring products
///
/// `days` overrides the configured expiry horizon for this call only.
pub fn show(store: &Store, days: Option<u32>, output: &Output) -> Result<()> {
    let mut view = store.alert_view();
    if let Some(days) = days {
        view.expiring = store.expiring_within(days);
        view.horizon_days = days;
    }
    output.print_alerts(&view);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;
    use chrono::Duration;
    use serde_json::json;
    use shelfsync_core::{Config, EntityId, MutationKind, Role, Session};
    use tempfile::TempDir;

    #[test]
    fn test_show_with_custom_horizon() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            expiry_horizon_days: 3,
            ..Config::default()
        };
        let mut store = Store::open_with_config(&config).unwrap();
        let session = Session::new("dana", Role::Admin);

        let in_ten_days = store.today() + Duration::days(10);
        store
            .enqueue(
                &session,
                &EntityId::product("cheese"),
                MutationKind::Create,
                json!({"name": "Cheese", "expiry_date": in_ten_days.format("%Y-%m-%d").to_string()}),
            )
            .unwrap();

        assert!(store.alert_view().expiring.is_empty());
        assert_eq!(store.expiring_within(14).len(), 1);
        assert!(show(&store, Some(14), &Output::new(OutputFormat::Quiet)).is_ok());
    }
}
