//! Config command handlers

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use shelfsync_core::{Config, Role};

use crate::output::{Output, OutputFormat};

const KEYS: &str = "data_dir, sync_enabled, sync_interval_secs, max_attempts, backoff_base_ms, \
                    backoff_max_ms, remote_timeout_secs, debounce_ms, expiry_horizon_days, role, \
                    log_file";

/// Load from `config_path` when given, otherwise from the default location
pub fn load(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

/// Show current configuration
pub fn show(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let config = load(config_path)?;

    match output.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .map(Path::to_path_buf)
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:            {}", config.data_dir.display());
            println!("  sync_enabled:        {}", config.sync_enabled);
            println!("  sync_interval_secs:  {}", config.sync_interval_secs);
            println!("  max_attempts:        {}", config.max_attempts);
            println!("  backoff_base_ms:     {}", config.backoff_base_ms);
            println!("  backoff_max_ms:      {}", config.backoff_max_ms);
            println!("  remote_timeout_secs: {}", config.remote_timeout_secs);
            println!("  debounce_ms:         {}", config.debounce_ms);
            println!("  expiry_horizon_days: {}", config.expiry_horizon_days);
            println!("  role:                {}", config.role);
            println!(
                "  log_file:            {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, config_path: Option<&Path>, output: &Output) -> Result<()> {
    let mut config = load(config_path)?;
    apply(&mut config, &key, &value)?;

    let save_path: PathBuf = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

/// Parse `value` into the field named by `key`
fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => config.data_dir = value.into(),
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "sync_interval_secs" => config.sync_interval_secs = parse_number(key, value)?,
        "max_attempts" => config.max_attempts = parse_number(key, value)?,
        "backoff_base_ms" => config.backoff_base_ms = parse_number(key, value)?,
        "backoff_max_ms" => config.backoff_max_ms = parse_number(key, value)?,
        "remote_timeout_secs" => config.remote_timeout_secs = parse_number(key, value)?,
        "debounce_ms" => config.debounce_ms = parse_number(key, value)?,
        "expiry_horizon_days" => config.expiry_horizon_days = parse_number(key, value)?,
        "role" => {
            config.role = value
                .parse::<Role>()
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        "log_file" => {
            config.log_file = if value.is_empty() || value == "none" {
                None
            } else {
                Some(value.into())
            };
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                KEYS
            );
        }
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {}: expected a non-negative integer", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_apply_known_keys() {
        let mut config = Config::default();
        apply(&mut config, "max_attempts", "6").unwrap();
        apply(&mut config, "role", "admin").unwrap();
        apply(&mut config, "sync_enabled", "false").unwrap();
        apply(&mut config, "log_file", "/tmp/shelfsync.log").unwrap();

        assert_eq!(config.max_attempts, 6);
        assert_eq!(config.role, Role::Admin);
        assert!(!config.sync_enabled);
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/shelfsync.log")));

        apply(&mut config, "log_file", "none").unwrap();
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = Config::default();
        assert!(apply(&mut config, "max_attempts", "-1").is_err());
        assert!(apply(&mut config, "role", "owner").is_err());
        assert!(apply(&mut config, "favorite_color", "blue").is_err());
        assert_eq!(config.max_attempts, 4);
    }

    #[test]
    fn test_set_writes_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        let data_dir = temp_dir.path().join("data");
        std::fs::write(&path, format!("data_dir = {:?}\n", data_dir)).unwrap();
        let output = Output::new(OutputFormat::Quiet);

        set("expiry_horizon_days".to_string(), "7".to_string(), Some(&path), &output).unwrap();
        set("role".to_string(), "admin".to_string(), Some(&path), &output).unwrap();

        let saved = Config::load_from_path(&path).unwrap();
        assert_eq!(saved.expiry_horizon_days, 7);
        assert_eq!(saved.role, Role::Admin);
        assert_eq!(saved.data_dir, data_dir);
    }
}
