use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dispatch_lite::broker::Broker;
use dispatch_lite::client::Client;
use dispatch_lite::config::{
    parse_port_range, BrokerConfig, ClientConfig, SandboxConfig, SupervisorCommand, WorkerConfig,
};
use dispatch_lite::dashboard::{run_dashboard, DashboardState};
use dispatch_lite::protocol::Reply;
use dispatch_lite::shutdown::install_shutdown_handler;
use dispatch_lite::supervisor::{self, SuperviseArgs};
use dispatch_lite::transport::Endpoint;
use dispatch_lite::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "dispatch-lite")]
#[command(version)]
#[command(about = "Broker/worker job dispatch with supervised execution")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the broker
    Broker(BrokerArgs),

    /// Run a worker for one service
    Worker(WorkerArgs),

    /// Submit or cancel jobs
    Client {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClientCommands,
    },

    /// Execution supervisor, started by a worker for each job
    #[command(hide = true)]
    Supervise(SuperviseArgs),
}

// =============================================================================
// Broker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BrokerArgs {
    /// Endpoint to bind
    #[arg(long, default_value = "tcp://*:5555")]
    bind: Endpoint,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "1000")]
    heartbeat_interval_ms: u64,

    /// Missed heartbeats before a worker is presumed dead
    #[arg(long, default_value = "3")]
    liveness: u32,

    /// Pending requests kept per service
    #[arg(long, default_value = "1024")]
    max_backlog: usize,

    /// Port for the status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Broker endpoint
    #[arg(long, default_value = "tcp://127.0.0.1:5555")]
    broker: Endpoint,

    /// Service name to serve
    #[arg(long)]
    service: String,

    /// Worker name reported to the broker (defaults to worker-<pid>)
    #[arg(long)]
    name: Option<String>,

    /// Installation prefix holding algorithms/
    #[arg(long)]
    prefix: PathBuf,

    /// Job scratch area (defaults to <prefix>/cache)
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Host for the supervisor side channel
    #[arg(long, default_value = "127.0.0.1")]
    callback_host: String,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "1000")]
    heartbeat_interval_ms: u64,

    /// Silent broker intervals before reconnecting
    #[arg(long, default_value = "3")]
    liveness: u32,

    /// Execution supervisor program (defaults to this binary)
    #[arg(long)]
    supervisor: Option<PathBuf>,

    // === Sandbox Options ===
    /// Run computations in Docker containers
    #[arg(long)]
    sandbox: bool,

    /// Default Docker image
    #[arg(long, default_value = "alpine:latest")]
    image: String,

    /// Docker network for containers (none when absent)
    #[arg(long, requires = "sandbox")]
    network: Option<String>,

    /// Container memory limit
    #[arg(long, default_value = "256m")]
    memory: String,

    /// Container CPU limit
    #[arg(long, default_value = "0.5")]
    cpus: String,

    /// Side-channel port range, min:max
    #[arg(long)]
    port_range: Option<String>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Broker endpoint
    #[arg(long, short = 'b', default_value = "tcp://127.0.0.1:5555")]
    broker: Endpoint,

    /// How long one poll waits, in milliseconds
    #[arg(long, default_value = "2500")]
    poll_timeout_ms: u64,

    /// Polls before giving up on a terminal reply
    #[arg(long, default_value = "120")]
    max_polls: usize,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum ClientCommands {
    /// Execute a job and wait for its outcome
    Execute {
        service: String,
        job_id: String,
        /// JSON configuration, or @path to read it from a file
        config: String,
    },
    /// Cancel a job
    Cancel { service: String, job_id: String },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ReplyOutput {
    status: String,
    job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl From<&Reply> for ReplyOutput {
    fn from(reply: &Reply) -> Self {
        let result = match reply {
            Reply::Done { result, .. } => Some(
                serde_json::from_slice(result)
                    .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(result).into_owned())),
            ),
            _ => None,
        };
        let message = match reply {
            Reply::Error { message, .. } => Some(message.clone()),
            _ => None,
        };
        Self {
            status: reply.command().to_string(),
            job_id: reply
                .job_id()
                .map(|id| String::from_utf8_lossy(id).into_owned()),
            result,
            message,
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn read_config_arg(config: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    match config.strip_prefix('@') {
        Some(path) => Ok(tokio::fs::read(path).await?),
        None => Ok(config.as_bytes().to_vec()),
    }
}

fn print_replies(replies: &[Reply], output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            let output: Vec<ReplyOutput> = replies.iter().map(ReplyOutput::from).collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("{:<15} {:<20} DETAIL", "STATUS", "JOB ID");
            println!("{}", "-".repeat(60));
            for reply in replies {
                let output = ReplyOutput::from(reply);
                let detail = match (&output.result, &output.message) {
                    (Some(result), _) => result.to_string(),
                    (None, Some(message)) => message.clone(),
                    (None, None) => String::new(),
                };
                println!(
                    "{:<15} {:<20} {}",
                    output.status,
                    output.job_id.unwrap_or_else(|| "-".to_string()),
                    detail
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Broker / Worker
// =============================================================================

async fn run_broker(args: BrokerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = BrokerConfig {
        bind: args.bind,
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        liveness: args.liveness,
        max_backlog: args.max_backlog,
        ..BrokerConfig::default()
    };
    let shutdown = install_shutdown_handler("broker")?;
    let broker = Broker::bind(config).await?;

    if let Some(port) = args.dashboard_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let state = DashboardState {
            snapshot: broker.subscribe(),
        };
        tokio::spawn(run_dashboard(addr, state, shutdown.clone()));
    }

    broker.run(shutdown).await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let supervisor = match args.supervisor {
        Some(program) => SupervisorCommand {
            program,
            args: Vec::new(),
        },
        None => SupervisorCommand::current_exe()?,
    };
    let port_range = args.port_range.as_deref().map(parse_port_range).transpose()?;

    let mut config = WorkerConfig::new(args.broker, args.service, args.prefix).with_supervisor(supervisor);
    if let Some(name) = args.name {
        config = config.with_name(name);
    }
    if let Some(cache) = args.cache {
        config.cache = cache;
    }
    config.callback_host = args.callback_host;
    config.heartbeat_interval_ms = args.heartbeat_interval_ms;
    config.liveness = args.liveness;
    config.sandbox = SandboxConfig {
        enabled: args.sandbox,
        image: args.image,
        network: args.network,
        port_range,
        memory_limit: Some(args.memory),
        cpu_limit: Some(args.cpus),
    };

    let shutdown = install_shutdown_handler("worker")?;
    let worker = Worker::start(config).await?;
    worker.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_execute(
    client: &mut Client,
    args: &ClientArgs,
    service: String,
    job_id: String,
    config: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = read_config_arg(&config).await?;
    client.execute(&service, job_id.clone(), config).await?;

    let replies = client.wait_for_terminal(job_id.as_bytes(), args.max_polls).await?;
    print_replies(&replies, &args.output)?;

    match replies.last() {
        Some(Reply::Done { .. }) | Some(Reply::Cancelled { .. }) => Ok(()),
        Some(Reply::Error { message, .. }) => {
            eprintln!("Error: {}", message);
            std::process::exit(1);
        }
        _ => {
            eprintln!("Error: no terminal reply after {} polls", args.max_polls);
            std::process::exit(1);
        }
    }
}

async fn handle_cancel(
    client: &mut Client,
    args: &ClientArgs,
    service: String,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    client.cancel(&service, job_id.clone()).await?;

    let replies = client.wait_for_terminal(job_id.as_bytes(), args.max_polls).await?;
    print_replies(&replies, &args.output)?;

    match replies.last() {
        Some(Reply::Cancelled { .. }) => Ok(()),
        Some(Reply::Error { message, .. }) => {
            eprintln!("Error: {}", message);
            std::process::exit(1);
        }
        _ => {
            eprintln!("Error: cancel was not acknowledged");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Broker(broker_args) => {
            run_broker(broker_args).await?;
        }
        Commands::Worker(worker_args) => {
            run_worker(worker_args).await?;
        }
        Commands::Client { client, command } => {
            let mut config = ClientConfig::new(client.broker.clone());
            config.poll_timeout_ms = client.poll_timeout_ms;
            let mut handle = Client::connect(config).await?;

            match command {
                ClientCommands::Execute {
                    service,
                    job_id,
                    config,
                } => {
                    handle_execute(&mut handle, &client, service, job_id, config).await?;
                }
                ClientCommands::Cancel { service, job_id } => {
                    handle_cancel(&mut handle, &client, service, job_id).await?;
                }
            }
        }
        Commands::Supervise(supervise_args) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .with_writer(std::io::stderr)
                .init();
            supervisor::run(supervise_args).await?;
        }
    }

    Ok(())
}
