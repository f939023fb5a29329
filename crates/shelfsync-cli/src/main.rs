//! Shelfsync CLI
//!
//! Operator interface over the local half of the shelfsync core: queue
//! product and transaction changes, inspect the pending queue and alerts.
//! It never talks to a remote store; queued changes are delivered by the
//! sync task of whichever application embeds the core.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shelfsync_core::{Config, EntityId, EntityKind, Role, Session, StorageError, Store};

mod commands;
mod output;

use output::{Output, OutputFormat};

/// Environment variable holding the tracing filter
const LOG_ENV: &str = "SHELFSYNC_LOG";

#[derive(Parser)]
#[command(name = "shelfsync")]
#[command(about = "Shelfsync - offline-first inventory queue")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Act with this role instead of the configured one
    #[arg(long, global = true)]
    role: Option<Role>,

    /// Name recorded as the acting user
    #[arg(long, global = true)]
    user: Option<String>,

    /// Use this config file instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage products
    Product {
        #[command(subcommand)]
        command: ProductCommands,
    },
    /// Record stock transactions
    Transaction {
        #[command(subcommand)]
        command: TransactionCommands,
    },
    /// List mutations waiting to be synced
    Pending {
        /// Only show mutations for this entity (e.g. product:milk)
        #[arg(long)]
        entity: Option<EntityId>,
    },
    /// Show low-stock and expiring products
    Alerts {
        /// Expiry window in days (defaults to expiry_horizon_days)
        #[arg(long)]
        days: Option<u32>,
    },
    /// Show status (pending count, cursor, last sync, contents)
    Status,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ProductCommands {
    /// Create a product from a JSON object of fields
    #[command(alias = "create")]
    Add {
        /// Product key
        key: String,
        /// Fields, e.g. '{"name": "Milk", "quantity": 4, "reorder_threshold": 2}'
        fields: String,
    },
    /// Change some fields of a product
    #[command(alias = "edit")]
    Update {
        /// Product key
        key: String,
        /// Fields to change, e.g. '{"quantity": 1}'
        fields: String,
    },
    /// Delete a product
    #[command(alias = "rm")]
    Delete {
        /// Product key
        key: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// List products
    #[command(alias = "ls")]
    List,
    /// Show one product
    Show {
        /// Product key
        key: String,
    },
}

#[derive(Subcommand)]
enum TransactionCommands {
    /// Record a transaction from a JSON object of fields
    #[command(alias = "create")]
    Add {
        /// Transaction key
        key: String,
        /// Fields, e.g. '{"product": "milk", "delta": -2}'
        fields: String,
    },
    /// List transactions
    #[command(alias = "ls")]
    List,
    /// Show one transaction
    Show {
        /// Transaction key
        key: String,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, role, max_attempts, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_deref();

    // Config commands must work even when the config is unusable
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, config_path, &output)
            }
        };
    }

    let config = commands::config::load(config_path)?;
    init_logging(&config);

    let mut store = Store::open_with_config(&config).inspect_err(print_storage_hint)?;
    let session = Session::new(
        cli.user.clone().unwrap_or_else(default_user),
        cli.role.unwrap_or(config.role),
    );
    tracing::debug!(user = %session.user, role = %session.role, "Opened store");

    match cli.command {
        Commands::Product { command } => {
            handle_product_command(command, &mut store, &session, &output)
        }
        Commands::Transaction { command } => {
            handle_transaction_command(command, &mut store, &session, &output)
        }
        Commands::Pending { entity } => commands::pending::list(&store, entity, &output),
        Commands::Alerts { days } => commands::alerts::show(&store, days, &output),
        Commands::Status => commands::status::show(&store, &config, &output),
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

fn handle_product_command(
    command: ProductCommands,
    store: &mut Store,
    session: &Session,
    output: &Output,
) -> Result<()> {
    match command {
        ProductCommands::Add { key, fields } => {
            commands::entity::add(store, session, EntityId::product(key), &fields, output)
        }
        ProductCommands::Update { key, fields } => {
            commands::entity::update(store, session, EntityId::product(key), &fields, output)
        }
        ProductCommands::Delete { key, yes } => {
            commands::entity::delete(store, session, EntityId::product(key), yes, output)
        }
        ProductCommands::List => commands::entity::list(store, EntityKind::Product, output),
        ProductCommands::Show { key } => {
            commands::entity::show(store, EntityId::product(key), output)
        }
    }
}

fn handle_transaction_command(
    command: TransactionCommands,
    store: &mut Store,
    session: &Session,
    output: &Output,
) -> Result<()> {
    match command {
        TransactionCommands::Add { key, fields } => {
            commands::entity::add(store, session, EntityId::transaction(key), &fields, output)
        }
        TransactionCommands::List => {
            commands::entity::list(store, EntityKind::Transaction, output)
        }
        TransactionCommands::Show { key } => {
            commands::entity::show(store, EntityId::transaction(key), output)
        }
    }
}

/// Point the operator at a fix when the store cannot be opened
fn print_storage_hint(err: &anyhow::Error) {
    let hint = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<StorageError>())
        .and_then(StorageError::recovery_suggestion);
    if let Some(hint) = hint {
        eprintln!("Hint: {}", hint);
    }
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "operator".to_string())
}

/// Install the tracing subscriber
///
/// Logs go to `log_file` when configured, otherwise to stderr. The filter
/// comes from `SHELFSYNC_LOG` and defaults to warnings only.
fn init_logging(config: &Config) {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    let Some(log_path) = config.log_file.as_ref() else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
        return;
    };

    let log_file = match open_log_file(log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: {:#}", e);
            return;
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(log_file))
        .try_init();
}

fn open_log_file(path: &Path) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Could not open log file {:?}", path))
}
