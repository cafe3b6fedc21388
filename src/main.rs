use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use zmws::broker::Broker;
use zmws::client::Client;
use zmws::config::{parse_backend_servers, BrokerConfig, HeartbeatConfig, LogLevel, WorkerConfig};
use zmws::protocol::{AdminQuery, ClientReply};
use zmws::shutdown::install_shutdown_handler;
use zmws::worker::{EchoHandler, Worker};

#[derive(Parser, Debug)]
#[command(name = "zmws")]
#[command(version)]
#[command(about = "A ZeroMQ job broker with heartbeating workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the broker
    Broker(BrokerArgs),

    /// Run a worker serving the built-in echo handler
    Worker(WorkerArgs),

    /// Submit jobs and inspect broker state
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Broker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BrokerArgs {
    /// Interface the sockets bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port of the client-facing socket
    #[arg(long, default_value = "5555")]
    client_port: u16,

    /// Port of the worker-facing socket
    #[arg(long, default_value = "5556")]
    worker_port: u16,

    /// Port of the job news publisher (0 disables it)
    #[arg(long, default_value = "5557")]
    news_port: u16,

    #[arg(long, default_value = "5000")]
    heartbeat_interval_ms: u64,

    /// Missed heartbeats before a worker is purged
    #[arg(long, default_value = "3")]
    heartbeat_tries: u32,

    #[arg(long, value_enum, default_value = "W")]
    log_level: LogLevel,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Broker worker port, used when --backend-servers is not given
    #[arg(long, default_value = "5556")]
    backend_port: u16,

    /// Broker client port, for jobs submitted by the worker itself
    #[arg(long, default_value = "5555")]
    frontend_port: u16,

    #[arg(long, default_value = "DEMO")]
    service_name: String,

    /// Comma-separated failover list, e.g. "10.0.0.1:5556,10.0.0.2:5556"
    #[arg(long)]
    backend_servers: Option<String>,

    /// Identity for the first connection (reconnects always use a new one)
    #[arg(long)]
    identity: Option<String>,

    #[arg(long, default_value = "3000")]
    heartbeat_interval_ms: u64,

    /// Silent heartbeat intervals before failing over
    #[arg(long, default_value = "5")]
    heartbeat_retries: u32,

    #[arg(long, value_enum, default_value = "W")]
    log_level: LogLevel,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Broker client endpoint
    #[arg(long, short = 'a', default_value = "tcp://127.0.0.1:5555")]
    addr: String,

    /// Seconds to wait for a reply
    #[arg(long, default_value = "10")]
    timeout: u64,

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
enum JobCommands {
    /// Submit a job to a service
    Submit {
        service: String,

        /// JSON param handed to the worker
        #[arg(long)]
        param: Option<String>,

        /// Wait for the worker's answer
        #[arg(long)]
        sync: bool,
    },
    /// Queued jobs
    List,
    /// Jobs currently running
    Active,
    /// Recently finished jobs
    History,
    /// Registered workers
    Workers,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter())),
        )
        .init();
}

fn field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("-")
}

fn print_reply(
    reply: &ClientReply,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if let OutputFormat::Json = output {
        let value = match reply {
            ClientReply::Accepted { job_id, service } => {
                serde_json::json!({"status": "ACCEPTED", "job_id": job_id, "service": service})
            }
            ClientReply::Rejected { job } => serde_json::json!({"status": "FAIL", "job": job}),
            ClientReply::Answer {
                status,
                service,
                job_id,
                payload,
            } => serde_json::json!({
                "status": status,
                "service": service,
                "job_id": job_id,
                "payload": payload,
            }),
            ClientReply::Data(value) => value.clone(),
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match reply {
        ClientReply::Accepted { job_id, service } => {
            println!("Job submitted successfully!");
            println!("Job ID: {} ({})", job_id, service);
        }
        ClientReply::Rejected { job } => println!("Job rejected: {}", job),
        ClientReply::Answer {
            status,
            job_id,
            payload,
            ..
        } => match payload {
            Some(payload) => println!("{} [{}] {}", status, job_id, payload),
            None => println!("{} [{}]", status, job_id),
        },
        ClientReply::Data(value) => println!("{}", value),
    }
    Ok(())
}

fn print_jobs(jobs: &Value, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    if let OutputFormat::Json = output {
        println!("{}", serde_json::to_string_pretty(jobs)?);
        return Ok(());
    }
    let jobs = jobs.as_array().map(Vec::as_slice).unwrap_or_default();
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    println!("{:<10} {:<16} {:<10} {:<34} PARAM", "JOB ID", "SERVICE", "STATE", "WORKER");
    println!("{}", "-".repeat(90));
    for job in jobs {
        println!(
            "{:<10} {:<16} {:<10} {:<34} {}",
            field(job, "id"),
            field(job, "service"),
            field(job, "state"),
            field(job, "assigned_worker"),
            field(job, "param"),
        );
    }
    Ok(())
}

fn print_workers(workers: &Value, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    if let OutputFormat::Json = output {
        println!("{}", serde_json::to_string_pretty(workers)?);
        return Ok(());
    }
    let workers = workers.as_array().map(Vec::as_slice).unwrap_or_default();
    if workers.is_empty() {
        println!("No workers registered.");
        return Ok(());
    }
    println!("{:<34} {:<16} STATUS", "WORKER", "SERVICE");
    println!("{}", "-".repeat(60));
    for worker in workers {
        let busy = worker.get("busy").and_then(Value::as_bool).unwrap_or(false);
        println!(
            "{:<34} {:<16} {}",
            field(worker, "identity"),
            field(worker, "service"),
            if busy { "busy" } else { "idle" },
        );
    }
    Ok(())
}

// =============================================================================
// Process Entry Points
// =============================================================================

async fn run_broker(args: BrokerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(args.log_level);

    let news_port = (args.news_port != 0).then_some(args.news_port);
    let config = BrokerConfig::new(args.client_port, args.worker_port)
        .with_bind_address(args.bind)
        .with_news_port(news_port)
        .with_heartbeat(HeartbeatConfig::new(
            Duration::from_millis(args.heartbeat_interval_ms),
            args.heartbeat_tries,
        ));

    tracing::info!(
        client_port = config.client_port,
        worker_port = config.worker_port,
        news_port = ?config.news_port,
        "Starting broker"
    );

    let shutdown = install_shutdown_handler();
    Broker::bind(config).await?.run(shutdown).await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(args.log_level);

    let servers = match args.backend_servers.as_deref() {
        Some(list) => parse_backend_servers(list),
        None => vec![format!("tcp://127.0.0.1:{}", args.backend_port)],
    };
    let mut config = WorkerConfig::new(args.service_name)
        .with_backend_servers(servers)
        .with_frontend_port(args.frontend_port)
        .with_heartbeat(HeartbeatConfig::new(
            Duration::from_millis(args.heartbeat_interval_ms),
            args.heartbeat_retries,
        ));
    if let Some(identity) = args.identity {
        config = config.with_identity(identity);
    }

    tracing::info!(
        service = %config.service_name,
        brokers = ?config.backend_servers,
        "Starting worker"
    );

    let shutdown = install_shutdown_handler();
    Worker::new(config, EchoHandler)?.run(shutdown).await;
    Ok(())
}

async fn run_job_command(
    client_args: ClientArgs,
    command: JobCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let timeout = Duration::from_secs(client_args.timeout);
    let mut client = Client::connect_with_timeout(&client_args.addr, timeout).await?;
    let output = &client_args.output;

    match command {
        JobCommands::Submit {
            service,
            param,
            sync,
        } => {
            let param: Option<Value> = param
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()?;
            if sync {
                for reply in client.call(&service, param.as_ref()).await? {
                    print_reply(&reply, output)?;
                }
            } else {
                let reply = client.submit(&service, param.as_ref()).await?;
                print_reply(&reply, output)?;
            }
        }
        JobCommands::List => print_jobs(&client.query(AdminQuery::Jobs).await?, output)?,
        JobCommands::Active => print_jobs(&client.query(AdminQuery::Active).await?, output)?,
        JobCommands::History => print_jobs(&client.query(AdminQuery::History).await?, output)?,
        JobCommands::Workers => print_workers(&client.query(AdminQuery::Workers).await?, output)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Broker(broker_args) => run_broker(broker_args).await?,
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Job { client, command } => run_job_command(client, command).await?,
    }

    Ok(())
}
