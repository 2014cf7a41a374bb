use anyhow::Result;
use board_sync::board::GraphQlBoardClient;
use board_sync::config;
use board_sync::db;
use board_sync::orchestrator::Orchestrator;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Detect changes in a source and push them to the board
    Run {
        /// Source table to sync
        #[arg(long)]
        source: String,
        /// Override the target board id
        #[arg(long)]
        board: Option<String>,
        /// Plan and validate without calling the board; converts values with the
        /// schema stored by the last live run
        #[arg(long)]
        dry_run: bool,
    },
    /// Revert every field a batch wrote
    Rollback {
        #[arg(long)]
        batch: String,
        #[arg(long, default_value = "manual rollback")]
        reason: String,
    },
    /// Mark a finished batch as cleaned
    Clean {
        #[arg(long)]
        batch: String,
    },
    /// Drop staged records of cleaned batches past retention
    Sweep,
    /// Print an example configuration
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let mut cfg = config::load(Some(&args.config))?;
    if let Command::Run { board, dry_run, .. } = &args.command {
        if let Some(board) = board {
            cfg.board.board_id = board.clone();
        }
        cfg.sync.dry_run |= *dry_run;
    }
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let api = Arc::new(GraphQlBoardClient::from_config(&cfg)?);
    let orchestrator = Orchestrator::from_config(&cfg, pool, api);

    match args.command {
        Command::Run { source, .. } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight calls");
                    on_signal.cancel();
                }
            });

            let report = orchestrator.run(&source, &cancel).await?;
            print!("{report}");
            std::process::exit(report.exit_code());
        }
        Command::Rollback { batch, reason } => {
            let entries = orchestrator.rollback(&batch, &reason).await?;
            info!(batch = %batch, reverted = entries.len(), "rollback done");
            println!("reverted {} field(s) of batch {}", entries.len(), batch);
        }
        Command::Clean { batch } => {
            let status = orchestrator.clean(&batch).await?;
            println!("batch {batch}: {status}");
        }
        Command::Sweep => {
            let removed = orchestrator.sweep().await?;
            println!("removed {removed} staged record(s)");
        }
        Command::ExampleConfig => {}
    }
    Ok(())
}
