//! Worker agent: runs the jobs bound to one node.
//!
//! - **Heartbeat**: keeps the node record READY and current
//! - **Job watch**: spots jobs the scheduler bound to this node
//! - **Execution**: claims each job, runs it through an [`Executor`], and
//!   writes the outcome and its output back to the store
//!
//! # Execution Flow
//!
//! 1. A job appears as Scheduled with `node_id` set to this node
//! 2. The agent moves it to Running with a conditional write
//! 3. The executor runs it, retrying failures up to `spec.retry_count`
//! 4. Output is saved to the log namespace, then Success or Failed is written
//!
//! # Security Note
//!
//! `SHELL` jobs run unsandboxed as the agent's user. `DOCKER` jobs get the
//! limits in [`SandboxConfig`](crate::config::SandboxConfig).

pub mod agent;
pub mod executor;
pub mod heartbeat;

pub use agent::Agent;
pub use executor::{
    DockerExecutor, ExecutionResult, Executor, JobExecutor, ShellExecutor, NO_EXIT_CODE,
};
pub use heartbeat::HeartbeatSender;
