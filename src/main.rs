//! # docpipe CLI
//!
//! The `docpipe` binary runs the document pipeline and its maintenance
//! commands.
//!
//! ## Usage
//!
//! ```bash
//! docpipe --config ./config/docpipe.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docpipe init` | Create the SQLite database and run schema migrations |
//! | `docpipe run` | Watch the inbox and process files as they arrive |
//! | `docpipe process <file>` | Push a single file through the pipeline |
//! | `docpipe status` | Show file counts per status and recent quarantines |
//! | `docpipe sync-suppliers` | Re-fetch supplier records older than a cutoff |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use docpipe::ai_fallback::AiClient;
use docpipe::config::{load_config, Config};
use docpipe::extract::{DocumentExtractor, TesseractOcr};
use docpipe::models::IntakeEvent;
use docpipe::processor::Processor;
use docpipe::registry::{HttpRegistryTransport, RegistryClient};
use docpipe::storage::{SqliteStorage, StoragePort};
use docpipe::watcher::Watcher;

/// Watched-folder pipeline for invoices and receipts.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docpipe.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docpipe",
    about = "Watched-folder pipeline for invoices and receipts",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docpipe.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Watch the inbox and process files until interrupted.
    Run,

    /// Push a single file through the pipeline and print the outcome.
    Process {
        /// Path to the document file (PDF or image).
        file: PathBuf,
    },

    /// Show file counts per status and the most recent quarantines.
    Status,

    /// Re-fetch supplier records whose last sync is older than the cutoff.
    SyncSuppliers {
        /// Staleness cutoff in days.
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
    },
}

fn build_processor(
    config: &Config,
    pool: sqlx::SqlitePool,
) -> Result<Processor<SqliteStorage, HttpRegistryTransport>> {
    let storage = SqliteStorage::new(pool);
    let ocr = Arc::new(TesseractOcr::default());
    let extractor = Arc::new(DocumentExtractor::new(
        ocr,
        config.extraction.page_quality_threshold,
    ));
    let transport = HttpRegistryTransport::new(&config.registry)?;
    let registry = RegistryClient::new(transport, &config.registry)?;
    let ai = if config.ai.enabled {
        Some(AiClient::new(&config.ai)?)
    } else {
        None
    };
    Ok(Processor::new(storage, extractor, registry, ai, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docpipe=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = docpipe::db::connect(&config.db.path).await?;
            docpipe::migrate::run_migrations(&pool).await?;
            println!("Database initialized at {}", config.db.path.display());
        }

        Commands::Run => {
            let pool = docpipe::db::connect(&config.db.path).await?;
            docpipe::migrate::run_migrations(&pool).await?;
            std::fs::create_dir_all(&config.paths.inbox)?;

            let processor = build_processor(&config, pool)?;
            let watcher = Watcher::new(&config.paths.inbox, &config.watcher)?;
            let (tx, rx) = mpsc::channel::<IntakeEvent>(64);

            tokio::spawn(watcher.run(tx));
            processor.run(rx).await?;
        }

        Commands::Process { file } => {
            let pool = docpipe::db::connect(&config.db.path).await?;
            docpipe::migrate::run_migrations(&pool).await?;

            let processor = build_processor(&config, pool)?;
            let event = IntakeEvent {
                path: file,
                discovered_at: chrono::Utc::now(),
            };
            let outcome = processor.process(event).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Status => {
            let pool = docpipe::db::connect(&config.db.path).await?;
            docpipe::migrate::run_migrations(&pool).await?;
            print_status(&pool).await?;
        }

        Commands::SyncSuppliers { older_than_days } => {
            let pool = docpipe::db::connect(&config.db.path).await?;
            docpipe::migrate::run_migrations(&pool).await?;

            let storage = SqliteStorage::new(pool);
            let transport = HttpRegistryTransport::new(&config.registry)?;
            let registry = RegistryClient::new(transport, &config.registry)?;

            let cutoff = chrono::Utc::now() - chrono::Duration::days(older_than_days);
            let stale = storage.stale_suppliers(cutoff).await?;
            println!("{} supplier(s) to refresh", stale.len());
            for tax_id in stale {
                match registry.refresh(&tax_id).await {
                    Ok(Some(record)) => {
                        storage.update_supplier(&record).await?;
                        println!("  {} refreshed", tax_id);
                    }
                    Ok(None) => println!("  {} no longer in registry", tax_id),
                    Err(err) => println!("  {} failed: {}", tax_id, err),
                }
            }
        }
    }

    Ok(())
}

async fn print_status(pool: &sqlx::SqlitePool) -> Result<()> {
    use sqlx::Row;

    let counts = sqlx::query("SELECT status, COUNT(*) AS n FROM files GROUP BY status ORDER BY status")
        .fetch_all(pool)
        .await?;
    if counts.is_empty() {
        println!("No files processed yet");
        return Ok(());
    }

    println!("Files by status:");
    for row in counts {
        println!("  {:<12} {}", row.get::<String, _>("status"), row.get::<i64, _>("n"));
    }

    let recent = sqlx::query(
        "SELECT original_name, last_error FROM files \
         WHERE status = 'quarantined' ORDER BY processed_at DESC LIMIT 10",
    )
    .fetch_all(pool)
    .await?;
    if !recent.is_empty() {
        println!("\nRecent quarantines:");
        for row in recent {
            println!(
                "  {} — {}",
                row.get::<String, _>("original_name"),
                row.get::<Option<String>, _>("last_error")
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}
