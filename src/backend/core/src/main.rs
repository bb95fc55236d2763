//! Cadence Server - Main entry point
//!
//! Hosts the job engine with its system jobs. Applications embed the library and
//! register their own handlers on [`JobEngine::builder`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};

use cadence_core::{
    config::Config,
    db::Database,
    jobs::{JobEngine, ScheduleExpr},
    telemetry::init_telemetry,
};

#[derive(Parser)]
#[command(
    name = "cadence-server",
    version,
    about = "Cadence - background job scheduling and execution engine",
    propagate_version = true
)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, global = true, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and workers until SIGINT/SIGTERM (default)
    Run,

    /// Load and validate the configuration, then print it
    CheckConfig,

    /// Print the upcoming fire times of a schedule expression
    NextFire {
        /// Cron expression, `@hourly`-style shorthand or `@every <duration>`
        expression: String,

        /// Number of fire times to print
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = load_config(cli.config.as_ref())?;
            run(config).await
        }
        Commands::CheckConfig => {
            let config = load_config(cli.config.as_ref())?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::NextFire { expression, count } => {
            let schedule = ScheduleExpr::parse(&expression)?;
            for at in schedule.upcoming(Utc::now(), count) {
                println!("{}", at.to_rfc3339());
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::load().context("Failed to load configuration")?,
    };
    Ok(config)
}

async fn run(config: Config) -> anyhow::Result<()> {
    init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Cadence Server"
    );

    let mut builder = JobEngine::builder(config.clone());
    let database = match &config.database {
        Some(db_config) => {
            let db = Database::connect(db_config).await?;
            if db_config.run_migrations {
                db.migrate().await?;
            }
            builder = builder
                .with_store(Arc::new(db.job_store()))
                .with_maintenance(Arc::new(db.maintenance()))
                .with_probe(Arc::new(db.probe()));
            Some(db)
        }
        None => {
            tracing::warn!("No database configured, jobs are kept in memory only");
            None
        }
    };

    let engine = builder.build()?;
    engine.start().await?;

    shutdown_signal().await;

    engine.shutdown().await;
    if let Some(db) = database {
        db.close().await;
    }

    tracing::info!("Cadence Server stopped");
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
