//! Takeoff Agents - Main Entry Point
//!
//! `serve` exposes the pipeline over HTTP and WebSocket; `run` executes a
//! single task in-process and prints its result.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use takeoff_agents::config::PipelineConfig;
use takeoff_agents::llm::create_provider;
use takeoff_agents::observability::{init_logging, HealthMonitor, LogSettings};
use takeoff_agents::pipeline::{parse_stages, Orchestrator, SubmitRequest};
use takeoff_agents::progress::ChannelBroadcaster;
use takeoff_agents::server::{self, ServerState};
use takeoff_agents::service::TaskService;
use takeoff_agents::state::InputFile;
use takeoff_agents::store::InMemoryTaskStore;
use tracing::{error, info, Level};

/// Construction takeoff and estimating pipeline
#[derive(Parser)]
#[command(name = "takeoff-agents")]
#[command(about = "Multi-agent construction takeoff and estimating pipeline")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP and WebSocket API
    Serve,
    /// Run one task and print its result as JSON
    Run {
        /// Natural language query
        #[arg(short, long)]
        query: Option<String>,
        /// Input document, may be repeated
        #[arg(short, long = "file", value_name = "PATH")]
        files: Vec<PathBuf>,
        /// Preset name or comma separated stage list
        #[arg(short, long)]
        stages: Option<String>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut log_settings = LogSettings::from_env();
    if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        log_settings.level = if cli.verbose > 1 {
            Level::TRACE
        } else {
            Level::DEBUG
        };
    }
    if let Err(e) = init_logging(&log_settings) {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!("Starting takeoff-agents v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Run {
            query,
            files,
            stages,
        } => run_task(config, query, files, stages).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(PipelineConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["takeoff.toml", "config/takeoff.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(PipelineConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create takeoff.toml".into())
        }
    }
}

fn build_orchestrator(
    config: &PipelineConfig,
    progress: Arc<ChannelBroadcaster>,
) -> Result<Orchestrator, Box<dyn std::error::Error>> {
    let llm = create_provider(config)?;
    info!(provider = llm.name(), model = %config.llm.model, "LLM provider ready");
    Ok(Orchestrator::new(
        config,
        llm,
        Arc::new(InMemoryTaskStore::new()),
        progress,
    )?)
}

async fn serve(config: PipelineConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Service starting with ID: {}", config.service.id);

    let progress = Arc::new(ChannelBroadcaster::from_config(&config.progress));
    let orchestrator = build_orchestrator(&config, progress.clone())?;

    let state = Arc::new(ServerState {
        service: Arc::new(TaskService::new(Arc::new(orchestrator))),
        progress,
        health: Arc::new(HealthMonitor::new(config.service.id.clone())),
        upload_root: config.server.upload_root.clone(),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    server::serve(state, addr).await?;
    Ok(())
}

async fn run_task(
    config: PipelineConfig,
    query: Option<String>,
    files: Vec<PathBuf>,
    stages: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut progress_config = config.progress.clone();
    progress_config.enabled = false;
    let progress = Arc::new(ChannelBroadcaster::from_config(&progress_config));
    let orchestrator = build_orchestrator(&config, progress)?;

    let request = SubmitRequest {
        query,
        files: files.into_iter().map(InputFile::from_path).collect(),
        stages: stages.as_deref().map(parse_stages).transpose()?,
        ..SubmitRequest::default()
    };

    let (task_id, state) = orchestrator.execute(request).await?;
    info!(%task_id, status = %state.status(), "Task finished");

    println!("{}", serde_json::to_string_pretty(&state.outcome())?);
    if let Some(error) = state.error() {
        return Err(error.to_string().into());
    }
    Ok(())
}

fn handle_config_command(
    config: PipelineConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
