// ABOUTME: CLI entry point for table-changes
// ABOUTME: Parses commands, loads the table catalogue, and routes to handlers

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use table_changes::commands::{self, parse_binding, Connection, SyncOptions};
use table_changes::config::Config;

#[derive(Parser)]
#[command(name = "table-changes")]
#[command(about = "Row-level change tracking and replay for PostgreSQL tables", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML file declaring the database and table models
    #[arg(long, global = true, default_value = "table-changes.toml")]
    config: PathBuf,
    /// PostgreSQL connection URL (overrides [database] url)
    #[arg(long = "database-url", env = "TABLE_CHANGES_DATABASE_URL", global = true)]
    database_url: Option<String>,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file and list the table models
    CheckConfig,
    /// Drop and recreate change tables (and transaction_history if missing)
    CreateChangeTable {
        /// Entities to act on (default: all, in catalogue order)
        #[arg(long = "entity")]
        entities: Vec<String>,
    },
    /// Seed change tables with a non-public snapshot of the live tables
    Init {
        #[arg(long = "entity")]
        entities: Vec<String>,
        #[arg(long, default_value = "init change tables")]
        description: String,
    },
    /// First full load of empty live tables from source relations
    Load {
        /// ENTITY=RELATION (repeatable)
        #[arg(long = "source", value_parser = parse_binding, required = true)]
        sources: Vec<(String, String)>,
        /// ENTITY=COL1,COL2 restricting the loaded columns (repeatable)
        #[arg(long = "columns", value_parser = parse_binding)]
        columns: Vec<(String, String)>,
        #[arg(long, default_value = "initial load")]
        description: String,
    },
    /// Diff source relations against the live tables, record and apply the changes
    Sync {
        /// ENTITY=RELATION holding the new state (repeatable)
        #[arg(long = "source", value_parser = parse_binding, required = true)]
        sources: Vec<(String, String)>,
        /// ENTITY=RELATION of primary keys that may have changed (repeatable)
        #[arg(long = "dirty", value_parser = parse_binding)]
        dirty: Vec<(String, String)>,
        /// ENTITY=COL1,COL2 refreshed from the source; other columns keep their values
        #[arg(long = "columns", value_parser = parse_binding)]
        columns: Vec<(String, String)>,
        #[arg(long, default_value = "sync")]
        description: String,
        /// Report the changes without committing them
        #[arg(long)]
        dry_run: bool,
    },
    /// Replace history with a single snapshot of the live tables
    ClearHistory {
        #[arg(long = "entity")]
        entities: Vec<String>,
        #[arg(long, default_value = "clear history")]
        description: String,
    },
    /// Count the change rows a transaction recorded
    Count {
        #[arg(long)]
        txid: i64,
        #[arg(long = "entity")]
        entities: Vec<String>,
    },
    /// Hide a transaction's change rows from replication consumers
    Hide {
        #[arg(long)]
        txid: i64,
        #[arg(long = "entity")]
        entities: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(&cli.config)?;
    if let Commands::CheckConfig = cli.command {
        return commands::check_config(&config);
    }

    let catalog = config.catalog().context("Invalid table catalogue")?;
    let connection = Connection::resolve(cli.database_url, cli.allow_self_signed_certs, &config)?;

    match cli.command {
        Commands::CheckConfig => Ok(()),
        Commands::CreateChangeTable { entities } => {
            commands::create_change_tables(&connection, &catalog, &entities).await
        }
        Commands::Init {
            entities,
            description,
        } => commands::init(&connection, &catalog, &entities, &description).await,
        Commands::Load {
            sources,
            columns,
            description,
        } => commands::load(&connection, &catalog, sources, columns, &description).await,
        Commands::Sync {
            sources,
            dirty,
            columns,
            description,
            dry_run,
        } => {
            commands::sync(
                &connection,
                &catalog,
                SyncOptions {
                    sources,
                    dirty,
                    columns,
                    description,
                    dry_run,
                },
            )
            .await
        }
        Commands::ClearHistory {
            entities,
            description,
        } => commands::clear_history(&connection, &catalog, &entities, &description).await,
        Commands::Count { txid, entities } => {
            commands::count(&connection, &catalog, txid, &entities).await
        }
        Commands::Hide { txid, entities } => {
            commands::hide(&connection, &catalog, txid, &entities).await
        }
    }
}
