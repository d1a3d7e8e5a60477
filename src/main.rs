use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, ValueEnum};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use titan::config::{
    AgentConfig, SandboxConfig, SchedulerConfig, StoreConfig, DEFAULT_STORE_ADDR,
};
use titan::dashboard::{run_dashboard, DashboardState};
use titan::model::{Job, Resource};
use titan::scheduler::Scheduler;
use titan::shutdown::install_shutdown_handler;
use titan::store::{ClusterStore, MemoryStore, RemoteStore, Store, StoreServer};
use titan::worker::{Agent, JobExecutor};

/// Jobs written to the store at once by `job submit`.
const SUBMIT_CONCURRENCY: usize = 50;

#[derive(Parser, Debug)]
#[command(name = "titan")]
#[command(version)]
#[command(about = "A resource-aware job scheduler with per-node worker agents")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the coordination store
    Store(StoreArgs),

    /// Run the scheduler
    Master(MasterArgs),

    /// Run a worker agent for this machine
    Worker(WorkerArgs),

    /// Run store, scheduler and one worker agent in a single process
    Standalone(StandaloneArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Node management commands
    Node {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: NodeCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Address to serve the store on
    #[arg(long, default_value = DEFAULT_STORE_ADDR)]
    listen: SocketAddr,
}

#[derive(Parser, Debug)]
struct MasterArgs {
    /// Coordination store address
    #[arg(long, default_value = DEFAULT_STORE_ADDR)]
    store: String,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Nodes silent for longer than this are marked offline
    #[arg(long, default_value = "10000")]
    node_timeout_ms: u64,

    /// Interval of the pending-job sweep
    #[arg(long, default_value = "5000")]
    reconcile_interval_ms: u64,
}

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Node ID (defaults to the hostname)
    #[arg(long)]
    node_id: Option<String>,

    /// Address reported for this node
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// CPU capacity in milli-cores
    #[arg(long, default_value = "4000", value_parser = clap::value_parser!(i64).range(0..))]
    cpu: i64,

    /// Memory capacity in bytes
    #[arg(long, default_value_t = 8 * 1024 * 1024 * 1024, value_parser = clap::value_parser!(i64).range(0..))]
    memory: i64,

    /// Jobs executed at once
    #[arg(long, default_value = "16")]
    max_jobs: usize,

    /// Docker image for DOCKER jobs that do not name one
    #[arg(long, default_value = "alpine:latest")]
    image: String,
}

impl AgentArgs {
    fn into_config(self) -> AgentConfig {
        let mut config = AgentConfig::new(
            self.node_id
                .unwrap_or_else(titan::config::default_node_id),
            Resource::new(self.cpu, self.memory),
        );
        config.address = self.address;
        config.max_concurrent_jobs = self.max_jobs;
        config.sandbox = SandboxConfig {
            image: self.image,
            ..SandboxConfig::default()
        };
        config
    }
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Coordination store address
    #[arg(long, default_value = DEFAULT_STORE_ADDR)]
    store: String,

    #[command(flatten)]
    agent: AgentArgs,
}

#[derive(Parser, Debug)]
struct StandaloneArgs {
    /// Address to serve the embedded store on, for the job/node commands
    #[arg(long, default_value = DEFAULT_STORE_ADDR)]
    listen: SocketAddr,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    #[command(flatten)]
    agent: AgentArgs,
}

// =============================================================================
// Client Arguments (shared by job and node commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Coordination store address
    #[arg(long, short = 's', default_value = DEFAULT_STORE_ADDR)]
    store: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit simulated shell jobs
    Submit {
        /// Number of jobs to submit
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Seconds each job sleeps
        #[arg(short = 't', long, default_value = "1")]
        sleep: u64,

        /// CPU request in milli-cores
        #[arg(long, default_value = "100", value_parser = clap::value_parser!(i64).range(0..))]
        cpu: i64,

        /// Memory request in bytes
        #[arg(long, default_value = "10240", value_parser = clap::value_parser!(i64).range(0..))]
        memory: i64,

        /// Extra executions allowed after a failure
        #[arg(long, default_value = "0")]
        retries: u32,

        /// Job that must succeed first (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },
    /// Print the captured output of a job
    Logs {
        job_id: String,
    },
    /// Get status of a specific job
    Status {
        job_id: String,
    },
    /// List all jobs
    List,
    /// Cancel a pending job
    Cancel {
        job_id: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum NodeCommands {
    /// List registered nodes and their allocation
    List,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    submitted: Vec<String>,
    failed: usize,
}

#[derive(Serialize)]
struct LogOutput {
    job_id: String,
    content: String,
}

// =============================================================================
// Server Implementation
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_store(args: StoreArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cancel = install_shutdown_handler()?;
    let config = StoreConfig {
        listen_addr: args.listen,
    };

    tracing::info!(listen_addr = %config.listen_addr, "Starting titan store");
    StoreServer::new(config.listen_addr, Arc::new(MemoryStore::new()))
        .run(cancel)
        .await?;
    Ok(())
}

async fn run_master(args: MasterArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cancel = install_shutdown_handler()?;
    let config = SchedulerConfig {
        node_timeout_ms: args.node_timeout_ms,
        reconcile_interval_ms: args.reconcile_interval_ms,
        ..SchedulerConfig::default()
    };

    let remote = RemoteStore::connect(args.store.as_str()).await?;
    tracing::info!(store = %remote.addr(), "Connected to store");
    let store = ClusterStore::new(Arc::new(remote), config.store_timeout());
    let scheduler = Arc::new(Scheduler::new(store.clone(), config));

    let dashboard = spawn_dashboard(args.dashboard_port, &store, Some(scheduler.clone()), &cancel)?;
    scheduler.run(cancel).await?;
    if let Some(handle) = dashboard {
        let _ = handle.await;
    }
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cancel = install_shutdown_handler()?;
    let config = args.agent.into_config();

    let remote = RemoteStore::connect(args.store.as_str()).await?;
    tracing::info!(
        store = %remote.addr(),
        node_id = %config.node_id,
        capacity = %config.capacity,
        "Starting titan worker"
    );
    let store = ClusterStore::new(Arc::new(remote), config.store_timeout());
    let executor = Arc::new(JobExecutor::new(config.sandbox.clone()));

    Arc::new(Agent::new(store, config, executor))
        .run(cancel)
        .await?;
    Ok(())
}

async fn run_standalone(args: StandaloneArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cancel = install_shutdown_handler()?;
    let scheduler_config = SchedulerConfig::default();
    let agent_config = args.agent.into_config();

    let engine: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!(listen_addr = %args.listen, node_id = %agent_config.node_id, "Starting titan standalone");
    let server = tokio::spawn(titan::store::server::serve(
        listener,
        engine.clone(),
        cancel.clone(),
    ));

    let store = ClusterStore::new(engine, scheduler_config.store_timeout());
    let scheduler = Arc::new(Scheduler::new(store.clone(), scheduler_config));
    let executor = Arc::new(JobExecutor::new(agent_config.sandbox.clone()));
    let agent = Arc::new(Agent::new(store.clone(), agent_config, executor));

    let dashboard = spawn_dashboard(args.dashboard_port, &store, Some(scheduler.clone()), &cancel)?;
    // Either one failing takes the whole process down
    let (scheduled, agent_result) = tokio::join!(
        async {
            let result = scheduler.run(cancel.clone()).await;
            cancel.cancel();
            result
        },
        async {
            let result = agent.run(cancel.clone()).await;
            cancel.cancel();
            result
        },
    );
    scheduled?;
    agent_result?;

    server.await??;
    if let Some(handle) = dashboard {
        let _ = handle.await;
    }
    Ok(())
}

fn spawn_dashboard(
    port: Option<u16>,
    store: &ClusterStore,
    scheduler: Option<Arc<Scheduler>>,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<Option<tokio::task::JoinHandle<()>>, Box<dyn std::error::Error>> {
    let Some(port) = port else {
        return Ok(None);
    };
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    let state = DashboardState {
        store: store.clone(),
        scheduler,
    };
    Ok(Some(tokio::spawn(run_dashboard(addr, state, cancel.clone()))))
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn client_store(args: &ClientArgs) -> Result<ClusterStore, Box<dyn std::error::Error>> {
    let remote = RemoteStore::connect(args.store.as_str()).await?;
    Ok(ClusterStore::new(
        Arc::new(remote),
        SchedulerConfig::default().store_timeout(),
    ))
}

fn simulated_job(index: usize, sleep: u64, res_req: Resource) -> Job {
    let id = format!("job-{}", uuid::Uuid::new_v4().simple());
    let script = format!(
        "echo 'Task {index} started on node'; sleep {sleep}; echo 'Task {index} finished'; \
         echo 'Here is some file list:'; ls -l /bin | head -n 3"
    );
    Job::shell(id, &script)
        .with_name(format!("Job-{}", index))
        .with_resources(res_req)
}

async fn handle_job_submit(
    store: &ClusterStore,
    count: usize,
    sleep: u64,
    res_req: Resource,
    retries: u32,
    depends_on: Vec<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let started = std::time::Instant::now();
    let jobs: Vec<Job> = (0..count)
        .map(|i| {
            simulated_job(i, sleep, res_req)
                .with_retry_count(retries)
                .with_dependencies(depends_on.clone())
        })
        .collect();

    let results: Vec<(String, titan::Result<u64>)> = stream::iter(jobs)
        .map(|job| async move {
            let result = store.create_job(&job).await;
            (job.id, result)
        })
        .buffer_unordered(SUBMIT_CONCURRENCY)
        .collect()
        .await;

    let mut submitted = Vec::new();
    let mut failed = 0;
    for (job_id, result) in results {
        match result {
            Ok(_) => submitted.push(job_id),
            Err(e) => {
                failed += 1;
                eprintln!("Error: failed to submit job {}: {}", job_id, e);
            }
        }
    }

    match output_format {
        OutputFormat::Json => {
            let output = JobSubmitOutput { submitted, failed };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if count == 1 {
                if let Some(job_id) = submitted.first() {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", job_id);
                    println!("View logs later with: titan job logs {}", job_id);
                }
            } else {
                let elapsed = started.elapsed();
                println!("Submitted: {} of {} jobs", submitted.len(), count);
                println!("Total time: {:?}", elapsed);
                println!(
                    "Rate: {:.1} jobs/s",
                    submitted.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
                );
            }
        }
    }

    if failed > 0 {
        return Err(format!("{} job(s) failed to submit", failed).into());
    }
    Ok(())
}

async fn handle_job_status(
    store: &ClusterStore,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(current) = store.get_job(&job_id).await? else {
        return Err(format!("job {} not found", job_id).into());
    };
    let job = current.value;

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        OutputFormat::Table => {
            println!("Job ID:       {}", job.id);
            println!("Name:         {}", job.name);
            println!("Type:         {}", job.job_type);
            println!("State:        {}", job.state());
            println!("Requests:     {}", job.res_req);
            if let Some(ref node_id) = job.status.node_id {
                println!("Node:         {}", node_id);
            }
            if job.state().is_terminal() {
                println!("Exit Code:    {}", job.status.exit_code);
            }
            if job.status.attempts > 0 {
                println!("Attempts:     {}", job.status.attempts);
            }
            if !job.dependencies.is_empty() {
                println!("Depends On:   {}", job.dependencies.join(", "));
            }
            if let Some(ref error) = job.status.error {
                println!("Error:");
                for line in error.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_logs(
    store: &ClusterStore,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(content) = store.get_log(&job_id).await? else {
        return Err(format!("no logs for job {}", job_id).into());
    };

    match output_format {
        OutputFormat::Json => {
            let output = LogOutput { job_id, content };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Logs for job {}:", job_id);
            println!("{}", "=".repeat(48));
            print!("{}", content);
            if !content.ends_with('\n') {
                println!();
            }
            println!("{}", "=".repeat(48));
        }
    }
    Ok(())
}

async fn handle_job_list(
    store: &ClusterStore,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs: Vec<Job> = store.list_jobs().await?.into_iter().map(|j| j.value).collect();

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<40} {:<10} {:<16} NAME", "JOB ID", "STATE", "NODE");
            println!("{}", "-".repeat(80));
            for job in &jobs {
                println!(
                    "{:<40} {:<10} {:<16} {}",
                    job.id,
                    job.state().to_string(),
                    job.status.node_id.as_deref().unwrap_or("-"),
                    job.name
                );
            }
            println!();
            println!("{} job(s)", jobs.len());
        }
    }
    Ok(())
}

async fn handle_job_cancel(
    store: &ClusterStore,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job = store.cancel_job(&job_id).await?;
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => println!("Job {} cancelled", job.id),
    }
    Ok(())
}

async fn handle_node_list(
    store: &ClusterStore,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let nodes: Vec<_> = store.list_nodes().await?.into_iter().map(|n| n.value).collect();

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&nodes)?);
        }
        OutputFormat::Table => {
            if nodes.is_empty() {
                println!("No nodes registered.");
                return Ok(());
            }
            let now = Utc::now().timestamp();
            println!(
                "{:<20} {:<16} {:<8} {:>14} {:>22} {:>6} {:>8}",
                "NODE ID", "ADDRESS", "STATUS", "CPU (m)", "MEMORY (bytes)", "JOBS", "SEEN"
            );
            println!("{}", "-".repeat(102));
            for node in &nodes {
                let status_icon = if node.is_ready() { "[+]" } else { "[-]" };
                println!(
                    "{:<20} {:<16} {:<8} {:>14} {:>22} {:>6} {:>7}s",
                    node.id,
                    node.ip,
                    status_icon,
                    format!("{}/{}", node.allocated.milli_cpu, node.total_cap.milli_cpu),
                    format!("{}/{}", node.allocated.memory, node.total_cap.memory),
                    node.assignments.len(),
                    now - node.last_heartbeat
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Store(store_args) => run_store(store_args).await?,
        Commands::Master(master_args) => run_master(master_args).await?,
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Standalone(standalone_args) => run_standalone(standalone_args).await?,
        Commands::Job { client, command } => {
            let store = client_store(&client).await?;

            match command {
                JobCommands::Submit {
                    count,
                    sleep,
                    cpu,
                    memory,
                    retries,
                    depends_on,
                } => {
                    handle_job_submit(
                        &store,
                        count,
                        sleep,
                        Resource::new(cpu, memory),
                        retries,
                        depends_on,
                        &client.output,
                    )
                    .await?;
                }
                JobCommands::Logs { job_id } => {
                    handle_job_logs(&store, job_id, &client.output).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&store, job_id, &client.output).await?;
                }
                JobCommands::List => {
                    handle_job_list(&store, &client.output).await?;
                }
                JobCommands::Cancel { job_id } => {
                    handle_job_cancel(&store, job_id, &client.output).await?;
                }
            }
        }
        Commands::Node { client, command } => {
            let store = client_store(&client).await?;

            match command {
                NodeCommands::List => {
                    handle_node_list(&store, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
