//! schemashift CLI
//!
//! Command-line tool for planning and applying cross-dialect migrations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::any::AnyPoolOptions;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use schemashift::prelude::*;

/// Cross-dialect schema translation and migration diffing.
#[derive(Parser)]
#[command(name = "schemashift")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL.
    #[arg(short, long, env = "DATABASE_URL")]
    database: Option<String>,

    /// Target dialect (postgres or mysql).
    #[arg(long, env = "SCHEMASHIFT_DIALECT", default_value = "postgres")]
    dialect: Dialect,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the ledger, progress and lease tables.
    Init,

    /// Show the DDL that would bring the database to a logical schema.
    Plan {
        /// Logical schema file (JSON).
        #[arg(short, long)]
        schema: PathBuf,

        /// Diff against an empty schema instead of the database ledger.
        #[arg(long)]
        from_empty: bool,

        /// Show the reverse script instead of the forward one.
        #[arg(short, long)]
        reverse: bool,

        /// Fail instead of warning when the migration discards data.
        #[arg(long)]
        block_lossy: bool,
    },

    /// Apply the migration to a logical schema.
    Apply {
        /// Logical schema file (JSON).
        #[arg(short, long)]
        schema: PathBuf,

        /// Fail instead of warning when the migration discards data.
        #[arg(long)]
        block_lossy: bool,

        /// Per-attempt timeout in seconds.
        #[arg(long, default_value_t = 300)]
        timeout: u64,

        /// Attempts before a transient failure is reported.
        #[arg(long, default_value_t = 3)]
        max_attempts: u32,

        /// Lease lifetime in seconds; must exceed the timeout.
        #[arg(long, default_value_t = 600)]
        lease_ttl: u64,

        /// Lease holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Revert the most recent migration.
    Rollback {
        /// Reason recorded in the audit table.
        #[arg(short, long)]
        reason: String,

        /// Per-attempt timeout in seconds.
        #[arg(long, default_value_t = 300)]
        timeout: u64,

        /// Lease lifetime in seconds; must exceed the timeout.
        #[arg(long, default_value_t = 600)]
        lease_ttl: u64,
    },

    /// Show applied migrations.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let dialect = cli.dialect;

    match cli.command {
        Commands::Init => {
            let applier = connect(cli.database.as_deref(), dialect, ApplyOptions::new()).await?;
            info!("Initializing ledger tables...");
            applier.init().await?;
            info!("Ledger tables created successfully.");
        }

        Commands::Plan {
            schema,
            from_empty,
            reverse,
            block_lossy,
        } => {
            let logical = read_schema(&schema)?;
            let current = if from_empty {
                PhysicalSchema::empty(dialect)
            } else {
                let applier =
                    connect(cli.database.as_deref(), dialect, ApplyOptions::new()).await?;
                applier.init().await?;
                applier.ledger().await?.current_schema().clone()
            };

            let plan = planner(block_lossy).generate(&logical, dialect, &current)?;
            if plan.is_empty() {
                info!("No changes detected.");
            } else if reverse {
                println!("{}", plan.script.reverse_sql());
            } else {
                println!("{}", plan.script.forward_sql());
            }
        }

        Commands::Apply {
            schema,
            block_lossy,
            timeout,
            max_attempts,
            lease_ttl,
            holder,
        } => {
            let logical = read_schema(&schema)?;
            let mut options = ApplyOptions::new()
                .timeout(Duration::from_secs(timeout))
                .max_attempts(max_attempts)
                .lease_ttl(Duration::from_secs(lease_ttl));
            if let Some(holder) = holder {
                options = options.holder(holder);
            }

            let applier = connect(cli.database.as_deref(), dialect, options).await?;
            applier.init().await?;
            let ledger = applier.ledger().await?;
            let plan = planner(block_lossy).generate(&logical, dialect, ledger.current_schema())?;

            match applier.apply(&plan).await? {
                Some(entry) => info!(
                    "Applied migration {} ({}): {}",
                    entry.sequence, entry.migration_id, entry.description
                ),
                None => info!("No changes detected."),
            }
        }

        Commands::Rollback {
            reason,
            timeout,
            lease_ttl,
        } => {
            let options = ApplyOptions::new()
                .timeout(Duration::from_secs(timeout))
                .lease_ttl(Duration::from_secs(lease_ttl));
            let applier = connect(cli.database.as_deref(), dialect, options).await?;
            applier.init().await?;
            let entry = applier.rollback(&reason).await?;
            info!(
                "Rolled back migration {} ({}): {}",
                entry.sequence, entry.migration_id, entry.description
            );
        }

        Commands::Status => {
            let applier = connect(cli.database.as_deref(), dialect, ApplyOptions::new()).await?;
            applier.init().await?;
            let ledger = applier.ledger().await?;

            if ledger.is_empty() {
                info!("No migrations have been applied yet.");
            } else {
                println!("\nApplied migrations:");
                println!("{:-<60}", "");
                for entry in ledger.entries() {
                    println!(
                        " [{}] {} {} ({})",
                        entry.sequence,
                        &entry.migration_id[..12.min(entry.migration_id.len())],
                        entry.description,
                        entry.applied_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!();
                println!(
                    "Current schema: {} tables, fingerprint {}",
                    ledger.current_schema().tables().len(),
                    ledger.current_schema().fingerprint()
                );
            }
        }
    }

    Ok(())
}

fn planner(block_lossy: bool) -> MigrationPlanner {
    let policy = if block_lossy {
        LossyPolicy::Block
    } else {
        LossyPolicy::Warn
    };
    MigrationPlanner::default().lossy_policy(policy)
}

fn read_schema(path: &Path) -> anyhow::Result<LogicalSchema> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file {}", path.display()))?;
    let schema = serde_json::from_str(&content)
        .with_context(|| format!("Invalid schema file {}", path.display()))?;
    Ok(schema)
}

async fn connect(
    database: Option<&str>,
    dialect: Dialect,
    options: ApplyOptions,
) -> anyhow::Result<MigrationApplier> {
    let url = database.context("No database URL given (use --database or DATABASE_URL)")?;
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new().max_connections(5).connect(url).await?;
    Ok(MigrationApplier::new(pool, dialect, options))
}
