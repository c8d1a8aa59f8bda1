mod demo;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepgraph_core::config::{AppConfig, StorageBackend};
use stepgraph_core::event::EventBus;
use stepgraph_core::traits::StorageConnector;
use stepgraph_core::types::{ProcessEvent, RunId};
use stepgraph_engine::{ProcessRuntime, RunLogger, StartOptions};
use stepgraph_store::{InMemoryStorage, SqliteStorage};

#[derive(Parser)]
#[command(name = "stepgraph", version, about = "Resumable event-driven process runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepgraph.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sum-of-squares process over a list of integers
    Run {
        /// Comma-separated values (default: 1..=10)
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        values: Vec<i64>,
        /// Resume the instance persisted under this run id
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Print the persisted state of a run
    Inspect {
        #[arg(long)]
        run_id: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stepgraph=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stepgraph", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run { values, run_id } => {
            let values = if values.is_empty() {
                (1..=10).collect()
            } else {
                values
            };
            run_demo(&config, values, run_id).await?;
        }
        Commands::Inspect { run_id } => {
            if config.storage.backend == StorageBackend::Memory {
                warn!("In-memory storage keeps nothing between invocations; set storage.backend = \"sqlite\"");
            }
            let storage = open_storage(&config)?;
            let template = demo::sum_of_squares()?;
            let handle = ProcessRuntime::new(config.engine.clone())
                .with_storage(storage)
                .attach(&template, RunId(run_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&handle.get_state())?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

async fn run_demo(config: &AppConfig, values: Vec<i64>, run_id: Option<String>) -> anyhow::Result<()> {
    let resuming = run_id.is_some();
    if resuming && config.storage.backend == StorageBackend::Memory {
        warn!("Resuming with in-memory storage starts from an empty state");
    }
    let run_id = run_id.map(RunId).unwrap_or_default();

    let storage = open_storage(config)?;
    let event_bus = Arc::new(EventBus::default());
    let runtime = ProcessRuntime::new(config.engine.clone())
        .with_storage(storage)
        .with_event_bus(event_bus.clone());

    let cancel = CancellationToken::new();
    let logger = if config.log.enabled {
        let rx = event_bus.subscribe();
        let logger = RunLogger::new(config.log_dir(), config.log.level);
        Some(tokio::spawn(logger.run(rx, run_id.clone(), cancel.clone())))
    } else {
        None
    };

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling run");
            interrupt.cancel();
        }
    });

    let template = demo::sum_of_squares()?;
    let options = StartOptions {
        run_id: Some(run_id.clone()),
        cancel: Some(cancel.clone()),
    };
    let result = runtime
        .start_with(&template, ProcessEvent::new(demo::START_EVENT, json!(values)), options)
        .await;

    if let Some(task) = logger {
        task.await.ok();
    }

    let handle = result?;
    let total = handle.last_event(demo::DONE_EVENT).cloned().unwrap_or_default();
    let tally = handle.get_state().step_state("Sum").cloned().unwrap_or_default();

    println!("run:   {}", handle.run_id());
    for event in handle.external_events() {
        println!("event: {} {}", event.id, event.data);
    }
    println!("total: {}", total);
    println!("tally: {}", tally);
    Ok(())
}

fn open_storage(config: &AppConfig) -> anyhow::Result<Arc<dyn StorageConnector>> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(Arc::new(InMemoryStorage::new())),
        StorageBackend::Sqlite => {
            let path = config.storage_path();
            Ok(Arc::new(SqliteStorage::open(&path)?))
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    // Check for config in the home directory
    if let Some(home_config) = dirs_home().map(|h| h.join(".stepgraph").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }

    info!("No config file found, using defaults");
    Ok(AppConfig::default())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
