use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use nightbench::collector::RunReport;
use nightbench::config::{RunnerConfig, SuiteConfig};
use nightbench::node::Node;
use nightbench::shutdown::install_shutdown_handler;
use nightbench::worker::server::{run_agent, AgentState};
use nightbench::worker::AgentRunner;

#[derive(Parser, Debug)]
#[command(name = "nightbench")]
#[command(version)]
#[command(about = "Continuous benchmarking orchestrator")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator: cadence timer, admin API and local workers
    Serve(ServeArgs),

    /// Execute the suite once and write the report
    RunOnce(RunOnceArgs),

    /// Run a remote agent that executes jobs posted by the orchestrator
    Agent(AgentArgs),

    /// Request a run from a serving orchestrator
    Trigger {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Show trigger loop, worker and latest report status
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Path to the suite config (YAML)
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Port for the admin API (disabled when absent)
    #[arg(long)]
    admin_port: Option<u16>,

    /// Start a run immediately instead of waiting for the first cadence tick
    #[arg(long)]
    trigger_now: bool,
}

#[derive(Parser, Debug)]
struct RunOnceArgs {
    /// Path to the suite config (YAML)
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Write the report here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Port to listen on
    #[arg(long, default_value = "7070")]
    port: u16,

    /// Shell used for shell invocations
    #[arg(long, default_value = "sh")]
    shell: String,

    /// Working directory for benchmark processes
    #[arg(long)]
    workdir: Option<PathBuf>,
}

// =============================================================================
// Client Arguments (shared by trigger and status)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Admin API address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = SuiteConfig::load(&args.config)?;
    let admin_addr: Option<SocketAddr> = match args.admin_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    tracing::info!(
        config = %args.config.display(),
        jobs = config.jobs.len(),
        cadence_secs = ?config.schedule.cadence_secs,
        admin_addr = ?admin_addr,
        "Starting nightbench"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::new(config, admin_addr)?;
    node.run(shutdown, args.trigger_now).await?;
    Ok(())
}

async fn run_once(args: RunOnceArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = SuiteConfig::load(&args.config)?;
    let shutdown = install_shutdown_handler();
    let report = Node::new(config, None)?.run_once(shutdown).await?;

    print_report_summary(&report);

    let body = serde_json::to_string_pretty(&report)?;
    match args.output {
        Some(path) => {
            tokio::fs::write(&path, body).await?;
            tracing::info!(path = %path.display(), status = %report.status, "Report written");
        }
        None => println!("{}", body),
    }
    Ok(())
}

async fn run_agent_server(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let runner = AgentRunner::new(RunnerConfig {
        shell: args.shell,
        workdir: args.workdir,
        ..RunnerConfig::default()
    });
    let shutdown = install_shutdown_handler();
    run_agent(
        addr,
        AgentState {
            runner: Arc::new(runner),
            shutdown: shutdown.clone(),
        },
        shutdown,
    )
    .await;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_trigger(client: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let response = reqwest::Client::new()
        .post(format!("{}/api/runs", client.addr.trim_end_matches('/')))
        .send()
        .await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&body)?),
        OutputFormat::Table => match body["result"].as_str() {
            Some("started") => println!("Run started: {}", body["run_id"].as_str().unwrap_or("-")),
            Some("queued") => println!("Run queued at position {}", body["position"]),
            Some("coalesced") => println!(
                "Run {} is active, trigger coalesced",
                body["active_run"].as_str().unwrap_or("-")
            ),
            Some("halted") => println!(
                "Scheduling halted: {}",
                body["reason"].as_str().unwrap_or("unknown")
            ),
            _ => println!("Unexpected response ({}): {}", status, body),
        },
    }
    Ok(())
}

async fn handle_status(client: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let http = reqwest::Client::new();
    let base = client.addr.trim_end_matches('/');
    let status: serde_json::Value = http
        .get(format!("{}/api/status", base))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let workers: serde_json::Value = http
        .get(format!("{}/api/workers", base))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    match client.output {
        OutputFormat::Json => {
            let output = serde_json::json!({ "status": status, "workers": workers });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Trigger Loop");
            println!("{}", "=".repeat(40));
            println!("Phase:      {}", status["phase"].as_str().unwrap_or("idle"));
            println!(
                "Active run: {}",
                status["active_run"].as_str().unwrap_or("-")
            );
            println!("Pending:    {}", status["pending_runs"]);
            println!(
                "Runs:       {} started, {} completed",
                status["runs_started"], status["runs_completed"]
            );
            if let Some(reason) = status["halted"].as_str() {
                println!("HALTED:     {}", reason);
            }
            if let Some(report) = status["last_report"].as_object() {
                println!();
                println!(
                    "Last run {} ({}): {} succeeded, {} failed, {} cancelled",
                    report["run_id"].as_str().unwrap_or("-"),
                    report["status"].as_str().unwrap_or("-"),
                    report["succeeded"],
                    report["permanent_failures"],
                    report["cancelled"]
                );
            }
            println!();
            println!("Workers:");
            println!("{:<8} {:<10} {:<10} ENDPOINT", "ID", "STATUS", "LOAD");
            println!("{}", "-".repeat(50));
            for worker in workers.as_array().into_iter().flatten() {
                println!(
                    "{:<8} {:<10} {:<10} {}",
                    worker["id"].to_string(),
                    worker["status"].as_str().unwrap_or("-"),
                    format!("{}/{}", worker["current_load"], worker["capacity"]),
                    worker["endpoint"].as_str().unwrap_or("local")
                );
            }
        }
    }
    Ok(())
}

fn print_report_summary(report: &RunReport) {
    let summary = report.summary();
    eprintln!(
        "Run {} {}: {} succeeded, {} failed, {} cancelled",
        summary.run_id,
        summary.status,
        summary.succeeded,
        summary.permanent_failures,
        summary.cancelled
    );
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await?,
        Commands::RunOnce(run_args) => run_once(run_args).await?,
        Commands::Agent(agent_args) => run_agent_server(agent_args).await?,
        Commands::Trigger { client } => handle_trigger(&client).await?,
        Commands::Status { client } => handle_status(&client).await?,
    }

    Ok(())
}
