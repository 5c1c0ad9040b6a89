pub mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::canvas::{parse_unchecked, validate_tree};
use crate::checkpoint::{CheckpointStore, JsonCheckpointStore};
use crate::engine::types::NodeStatus;
use crate::nodes::CapabilityRegistry;
use crate::service::{Caller, CreateWorkflow, ProcessInfo, WorkflowService};
use crate::storage::JsonRepository;

use config::CanvasflowConfig;

/// Space and user the CLI acts as.
const LOCAL_SPACE: &str = "local";
const LOCAL_USER: &str = "cli";

#[derive(Parser)]
#[command(name = "canvasflow", version, about = "Canvas workflow engine")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a YAML config file (default: canvasflow.yaml in cwd if present)
    #[arg(long, global = true, env = "CANVASFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding workflows, executions and checkpoints
    #[arg(long, global = true, env = "CANVASFLOW_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        /// Maximum request body size in bytes (default: 1048576 = 1 MB)
        #[arg(long, env = "MAX_BODY")]
        max_body: Option<usize>,
    },

    /// Validate a canvas JSON file without executing it
    Validate {
        /// Path to the canvas JSON file
        canvas: PathBuf,
    },

    /// Test-run a canvas locally and print the process
    Run {
        /// Path to the canvas JSON file
        canvas: PathBuf,

        /// Start node input as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Print node inputs and outputs
        #[arg(short, long)]
        verbose: bool,
    },

    /// Answer an interrupt and continue the execution
    Resume {
        execute_id: String,
        event_id: String,
        /// Resume data; parsed as JSON when possible, otherwise sent as a string
        data: String,

        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the process of an execution
    Process {
        execute_id: String,

        #[arg(short, long)]
        verbose: bool,
    },

    /// List registered capability providers
    Nodes,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());
    let config = CanvasflowConfig::load(cli.config.as_deref())?;
    let data_dir = config.data_dir(cli.data_dir);

    match cli.command {
        Commands::Serve {
            host,
            port,
            max_body,
        } => {
            let host = host
                .or_else(|| config.host.clone())
                .unwrap_or_else(|| config::DEFAULT_HOST.to_string());
            let port = port.or(config.port).unwrap_or(config::DEFAULT_PORT);
            let max_body = max_body
                .or(config.max_body)
                .unwrap_or(config::DEFAULT_MAX_BODY);
            let service = build_service(&config, &data_dir).await?;
            crate::api::serve(&host, port, service, max_body).await
        }
        Commands::Validate { canvas } => cmd_validate(&canvas),
        Commands::Run {
            canvas,
            input,
            verbose,
        } => {
            let service = build_service(&config, &data_dir).await?;
            cmd_run(&service, &canvas, input, verbose).await
        }
        Commands::Resume {
            execute_id,
            event_id,
            data,
            verbose,
        } => {
            let service = build_service(&config, &data_dir).await?;
            cmd_resume(&service, &execute_id, &event_id, &data, verbose).await
        }
        Commands::Process {
            execute_id,
            verbose,
        } => {
            let service = build_service(&config, &data_dir).await?;
            let process = service.get_process(&local_caller(), &execute_id).await?;
            print_process(&process, verbose)
        }
        Commands::Nodes => cmd_nodes(),
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

fn local_caller() -> Caller {
    Caller::new(LOCAL_SPACE, LOCAL_USER)
}

async fn checkpoint_store(config: &CanvasflowConfig, data_dir: &Path) -> Result<Arc<dyn CheckpointStore>> {
    #[cfg(feature = "redis")]
    if let Some(url) = &config.redis_url {
        let store = crate::checkpoint::RedisCheckpointStore::connect(url).await?;
        info!("Using Redis checkpoint store");
        return Ok(Arc::new(store));
    }
    #[cfg(not(feature = "redis"))]
    if config.redis_url.is_some() {
        warn!("redis_url is set but canvasflow was built without the `redis` feature; using files");
    }
    Ok(Arc::new(JsonCheckpointStore::new(data_dir.join("checkpoints"))))
}

/// Service over the JSON repository under `data_dir`.
pub async fn build_service(config: &CanvasflowConfig, data_dir: &Path) -> Result<Arc<WorkflowService>> {
    let registry = Arc::new(CapabilityRegistry::with_builtins());
    let repo = Arc::new(JsonRepository::new(data_dir.join("repo")));
    let checkpoints = checkpoint_store(config, data_dir).await?;
    let service = WorkflowService::new(registry, repo, checkpoints, config.engine_config())
        .with_stream_buffer(config.stream_buffer());
    Ok(Arc::new(service))
}

fn cmd_validate(path: &Path) -> Result<()> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read canvas: {}", path.display()))?;
    let canvas = parse_unchecked(&bytes)?;
    let issues = validate_tree(&canvas);

    println!("Canvas: {}", path.display());
    println!("Nodes: {}", canvas.all_nodes().len());

    if issues.is_empty() {
        println!("Validation: OK");
        return Ok(());
    }
    println!("Validation: FAILED");
    for issue in &issues {
        println!("  - {}", issue);
    }
    anyhow::bail!("{} validation issue(s) found", issues.len());
}

async fn cmd_run(service: &WorkflowService, path: &Path, input: Option<String>, verbose: bool) -> Result<()> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read canvas: {}", path.display()))?;
    let input: Map<String, Value> = match input {
        Some(json) => serde_json::from_str(&json).context("Failed to parse --input JSON")?,
        None => Map::new(),
    };

    let caller = local_caller();
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "workflow".to_string());
    let meta = service
        .create_workflow(
            &caller,
            CreateWorkflow {
                name,
                ..Default::default()
            },
        )
        .await?;
    service.save_workflow(&caller, &meta.id, &bytes).await?;

    let execute_id = service.test_run(&caller, &meta.id, input).await?;
    service.wait(&execute_id).await?;
    let process = service.get_process(&caller, &execute_id).await?;
    print_process(&process, verbose)
}

async fn cmd_resume(
    service: &WorkflowService,
    execute_id: &str,
    event_id: &str,
    data: &str,
    verbose: bool,
) -> Result<()> {
    let data = serde_json::from_str(data).unwrap_or_else(|_| Value::String(data.to_string()));
    let caller = local_caller();
    let root_id = service.resume(&caller, execute_id, event_id, data).await?;
    service.wait(&root_id).await?;
    let process = service.get_process(&caller, &root_id).await?;
    print_process(&process, verbose)
}

fn print_process(process: &ProcessInfo, verbose: bool) -> Result<()> {
    println!("Execute ID: {}", process.execute_id);
    println!("Workflow: {}", process.workflow_id);
    println!("Status: {}", process.status);
    if let Some(reason) = &process.reason {
        println!("Reason: {}", reason);
    }

    println!("\nNodes:");
    for result in &process.node_results {
        let status_icon = match result.status {
            NodeStatus::Success if result.error.is_some() => "!",
            NodeStatus::Success => "✓",
            NodeStatus::Failed => "✗",
            NodeStatus::Skipped => "⊘",
            NodeStatus::Running => "⟳",
            NodeStatus::Interrupted => "?",
        };
        let index = result.index.map(|i| format!("[{}]", i)).unwrap_or_default();
        println!(
            "  {} {}{} [{}] (attempt {})",
            status_icon, result.node_id, index, result.node_type, result.attempt
        );
        if verbose && let Some(finished) = result.finished_at {
            let duration = finished - result.started_at;
            println!("    Duration: {}ms", duration.num_milliseconds());
        }
        if let Some(err) = &result.error {
            println!("    Error: {}", err);
        }
        if let Some(sub) = &result.sub_execute_id {
            println!("    Sub-execution: {}", sub);
        }
        if verbose && let Some(output) = &result.output {
            println!("    Output: {}", output);
        }
    }

    if !process.node_events.is_empty() {
        println!("\nWaiting for input:");
        for event in &process.node_events {
            println!("  {} [{}]", event.id, event.event_type);
            println!("    {}", event.payload);
        }
    }

    if let Some(output) = &process.output {
        println!("\nOutput:");
        println!("{}", serde_json::to_string_pretty(output)?);
    }
    if !process.usage.is_zero() {
        println!(
            "\nTokens: {} in / {} out",
            process.usage.input_tokens, process.usage.output_tokens
        );
    }
    Ok(())
}

fn cmd_nodes() -> Result<()> {
    let registry = CapabilityRegistry::with_builtins();
    let nodes = registry.list();

    println!("{:<22} DESCRIPTION", "NODE TYPE");
    println!("{}", "-".repeat(60));

    for (kind, desc) in &nodes {
        println!("{:<22} {}", kind.as_str(), desc);
    }

    println!("\nTotal: {} node(s)", nodes.len());
    Ok(())
}
