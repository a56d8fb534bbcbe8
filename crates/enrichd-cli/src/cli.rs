//! Command-line interface: one subcommand per control action, plus `serve`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use enrichd::{default_database_path, load_config, ControlRequest, Database, Orchestrator};

#[derive(Parser)]
#[command(name = "enrichd")]
#[command(about = "Batch orchestrator for enrichment pipelines")]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "ENRICHD_CONFIG", default_value = "enrichd.json")]
    config: PathBuf,

    /// Database file (default: ~/.enrichd/data/enrichd.db)
    #[arg(long, global = true, env = "ENRICHD_DATABASE")]
    database: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the control surface over HTTP
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },

    /// Plan jobs and process them until done
    Start {
        /// Only plan tasks of this priority
        #[arg(long, conflicts_with = "task")]
        phase: Option<i32>,
        /// Only plan this task
        #[arg(long)]
        task: Option<String>,
    },

    /// Show recent jobs and their batches
    Status,

    /// Run the watchdog, then dispatch one batch for every open job
    Continue,

    /// Reset batches stuck in processing
    Recover,

    /// Abort all but the newest open job of every task
    AbortDuplicates,

    /// Abort the open jobs of a phase and plan it again
    Restart {
        #[arg(long)]
        phase: i32,
    },

    /// Delete all jobs and batches
    ClearAll {
        /// Confirm the purge
        #[arg(long)]
        yes: bool,
    },

    /// Plan the smoke-test tasks and process them
    Test,
}

impl Commands {
    fn into_request(self) -> Option<ControlRequest> {
        Some(match self {
            Commands::Serve { .. } => return None,
            Commands::Start { phase, task } => ControlRequest::Start {
                phase,
                task_name: task,
            },
            Commands::Status => ControlRequest::Status,
            Commands::Continue => ControlRequest::Continue,
            Commands::Recover => ControlRequest::Recover,
            Commands::AbortDuplicates => ControlRequest::AbortDuplicates,
            Commands::Restart { phase } => ControlRequest::Restart { phase },
            Commands::ClearAll { .. } => ControlRequest::ClearAll,
            Commands::Test => ControlRequest::Test,
        })
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::ClearAll { yes: false } = cli.command {
        bail!("clear-all deletes every job and batch; pass --yes to confirm");
    }

    let config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let db_path = match cli.database.or_else(default_database_path) {
        Some(path) => path,
        None => bail!("no home directory; pass --database"),
    };
    log::info!("Using database {}", db_path.display());
    let db = Database::open(&db_path)?;

    let orchestrator = Arc::new(Orchestrator::from_config(db, config)?);

    if let Commands::Serve { bind } = cli.command {
        return crate::server::serve(orchestrator, bind).await;
    }

    let Some(request) = cli.command.into_request() else {
        return Ok(());
    };
    let waits = matches!(
        request,
        ControlRequest::Start { .. } | ControlRequest::Restart { .. } | ControlRequest::Test
    );

    let reply = orchestrator.handle(request).await;
    println!("{}", serde_json::to_string_pretty(&reply.body)?);
    if !reply.is_success() {
        bail!("action failed with status {}", reply.status);
    }

    if waits {
        wait_for_processors(&orchestrator).await;
    }
    Ok(())
}

/// Waits for launched processors; Ctrl-C asks them to stop after the current batch.
async fn wait_for_processors(orchestrator: &Orchestrator) {
    let wait = orchestrator.wait_for_processors();
    tokio::pin!(wait);

    let summaries = tokio::select! {
        summaries = &mut wait => summaries,
        _ = tokio::signal::ctrl_c() => {
            log::warn!("Interrupted, stopping processors after the current batch");
            orchestrator.stop_all().await;
            wait.await
        }
    };

    for summary in summaries {
        match summary {
            Ok(summary) => log::info!(
                "Processor finished ({:?}): {} cycle(s), {} dispatch(es), {} recovered batch(es)",
                summary.exit,
                summary.cycles,
                summary.dispatches,
                summary.recovered_batches
            ),
            Err(e) => log::error!("{}", e),
        }
    }
}
