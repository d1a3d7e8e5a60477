use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;
use crate::model::{Job, JobType};

/// Exit code recorded when the process never reported one (spawn failure,
/// killed by a signal, cancelled).
pub const NO_EXIT_CODE: i32 = -1;

/// Result of job execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// stdout followed by stderr
    pub output: String,
    pub exit_code: i32,
    /// `None` means the job succeeded
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: 0,
            error: None,
        }
    }

    pub fn failure(exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            exit_code,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    fn cancelled() -> Self {
        Self::failure(NO_EXIT_CODE, "execution cancelled")
    }
}

/// Runs one job to completion.
///
/// Implementations must stop the job and release whatever it holds when
/// `cancel` fires, then return a failed result.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> ExecutionResult;
}

/// Runs `spec.command` directly as a child process.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> ExecutionResult {
        let Some((program, args)) = job.spec.command.split_first() else {
            return ExecutionResult::failure(NO_EXIT_CODE, "job has an empty command");
        };
        tracing::info!(job_id = %job.id, program = %program, "Executing job");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(parse_envs(&job.spec.envs))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to spawn job process");
                return ExecutionResult::failure(NO_EXIT_CODE, e.to_string());
            }
        };

        // Dropping the wait future drops the child, which kills it.
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::warn!(job_id = %job.id, "Execution cancelled, process killed");
                ExecutionResult::cancelled()
            }
            output = child.wait_with_output() => process_output(&job.id, output),
        }
    }
}

/// Executes jobs in Docker containers with security isolation.
///
/// All jobs run in sandboxed Docker containers with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits
#[derive(Debug, Clone)]
pub struct DockerExecutor {
    config: SandboxConfig,
}

impl DockerExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn container_name(job_id: &str) -> String {
        format!("titan-{}", job_id)
    }

    /// Arguments for `docker`, starting at `run`.
    pub fn run_args(&self, job: &Job) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            format!("--name={}", Self::container_name(&job.id)),
        ];

        // Network isolation
        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }

        // Memory limit
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }

        // CPU limit
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        // Security: drop all capabilities, no new privileges
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());

        // Read-only root filesystem
        args.push("--read-only".to_string());

        for env in &job.spec.envs {
            args.push("-e".to_string());
            args.push(env.clone());
        }

        args.push(
            job.spec
                .image
                .clone()
                .unwrap_or_else(|| self.config.image.clone()),
        );
        args.extend(job.spec.command.iter().cloned());
        args
    }

    async fn remove_container(job_id: &str) {
        let name = Self::container_name(job_id);
        let result = Command::new("docker")
            .args(["rm", "-f", &name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            tracing::warn!(job_id, container = %name, error = %e, "Failed to remove container");
        }
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> ExecutionResult {
        let args = self.run_args(job);
        let image = job.spec.image.as_deref().unwrap_or(&self.config.image);
        tracing::info!(job_id = %job.id, image, "Executing job in container");

        let child = match Command::new("docker")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to start docker");
                return ExecutionResult::failure(NO_EXIT_CODE, e.to_string());
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                // Killing the client does not stop the container
                Self::remove_container(&job.id).await;
                tracing::warn!(job_id = %job.id, "Execution cancelled, container removed");
                ExecutionResult::cancelled()
            }
            output = child.wait_with_output() => process_output(&job.id, output),
        }
    }
}

/// Picks the executor by job type.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    shell: ShellExecutor,
    docker: DockerExecutor,
}

impl JobExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            shell: ShellExecutor,
            docker: DockerExecutor::new(config),
        }
    }
}

#[async_trait]
impl Executor for JobExecutor {
    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> ExecutionResult {
        match job.job_type {
            JobType::Shell => self.shell.execute(job, cancel).await,
            JobType::Docker => self.docker.execute(job, cancel).await,
        }
    }
}

/// Split `KEY=VALUE` pairs; entries without `=` are skipped.
fn parse_envs(envs: &[String]) -> Vec<(&str, &str)> {
    envs.iter()
        .filter_map(|kv| {
            let pair = kv.split_once('=');
            if pair.is_none() {
                tracing::warn!(env = %kv, "Ignoring malformed environment entry");
            }
            pair
        })
        .collect()
}

fn process_output(
    job_id: &str,
    result: Result<std::process::Output, std::io::Error>,
) -> ExecutionResult {
    match result {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(NO_EXIT_CODE);

            let error = if output.status.success() {
                None
            } else if stderr.trim().is_empty() {
                Some(format!("exit code {}", exit_code))
            } else {
                Some(stderr.trim().to_string())
            };

            tracing::info!(
                job_id,
                exit_code,
                success = error.is_none(),
                "Job process exited"
            );

            ExecutionResult {
                output: format!("{}{}", stdout, stderr),
                exit_code,
                error,
            }
        }
        Err(e) => {
            tracing::error!(job_id, error = %e, "Job execution failed");
            ExecutionResult::failure(NO_EXIT_CODE, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_envs_skips_malformed_entries() {
        let envs = vec![
            "A=1".to_string(),
            "broken".to_string(),
            "B=x=y".to_string(),
        ];
        assert_eq!(parse_envs(&envs), vec![("A", "1"), ("B", "x=y")]);
    }

    #[test]
    fn docker_args_apply_sandbox_and_job() {
        let executor = DockerExecutor::new(SandboxConfig::default());
        let job = Job::new(
            "job-1",
            JobType::Docker,
            vec!["echo".to_string(), "hi".to_string()],
        )
        .with_envs(vec!["GREETING=hi".to_string()]);

        let args = executor.run_args(&job);
        assert_eq!(&args[..3], &["run", "--rm", "--name=titan-job-1"]);
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--memory=256m".to_string()));
        assert!(args.contains(&"--cpus=0.5".to_string()));
        assert!(args.contains(&"--cap-drop=ALL".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.windows(2).any(|w| w == ["-e", "GREETING=hi"]));
        assert_eq!(&args[args.len() - 3..], &["alpine:latest", "echo", "hi"]);
    }

    #[test]
    fn docker_args_prefer_job_image() {
        let config = SandboxConfig {
            network_disabled: false,
            memory_limit: None,
            cpu_limit: None,
            ..SandboxConfig::default()
        };
        let executor = DockerExecutor::new(config);
        let job = Job::new("j", JobType::Docker, vec!["true".to_string()]).with_image("busybox");

        let args = executor.run_args(&job);
        assert!(!args.iter().any(|a| a.starts_with("--network")));
        assert!(!args.iter().any(|a| a.starts_with("--memory")));
        assert_eq!(&args[args.len() - 2..], &["busybox", "true"]);
    }
}
