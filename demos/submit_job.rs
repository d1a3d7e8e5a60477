use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use titan::config::DEFAULT_STORE_ADDR;
use titan::model::{Job, Resource};
use titan::store::{ClusterStore, RemoteStore};

#[derive(Parser, Debug)]
#[command(name = "submit-job")]
#[command(about = "Submit one shell job to titan and wait for its output")]
struct Args {
    /// Store address
    #[arg(long, default_value = DEFAULT_STORE_ADDR)]
    store: String,

    /// Shell script to run
    #[arg(short, long)]
    cmd: String,

    /// CPU request in milli-cores
    #[arg(long, default_value = "100")]
    cpu: i64,

    /// Memory request in bytes
    #[arg(long, default_value = "10240")]
    memory: i64,

    /// Give up waiting after this many seconds
    #[arg(long, default_value = "60")]
    wait: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let remote = RemoteStore::connect(args.store.as_str()).await?;
    let store = ClusterStore::new(Arc::new(remote), Duration::from_secs(5));

    let job_id = format!("job-{}", uuid::Uuid::new_v4().simple());
    let job = Job::shell(job_id.as_str(), &args.cmd)
        .with_resources(Resource::new(args.cpu, args.memory));
    store.create_job(&job).await?;
    println!("Submitted {}", job_id);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.wait);
    let job = loop {
        if let Some(current) = store.get_job(&job_id).await? {
            if current.value.state().is_terminal() {
                break current.value;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("job {} did not finish in {}s", job_id, args.wait).into());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    println!(
        "State: {} (exit code {}) on {}",
        job.state(),
        job.status.exit_code,
        job.status.node_id.as_deref().unwrap_or("-")
    );
    if let Some(error) = job.status.error {
        println!("Error: {}", error);
    }
    if let Some(output) = store.get_log(&job_id).await? {
        println!("Output:\n{}", output);
    }
    Ok(())
}
