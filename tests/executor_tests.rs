use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use titan::config::SandboxConfig;
use titan::model::{Job, JobType};
use titan::worker::{Executor, JobExecutor, ShellExecutor, NO_EXIT_CODE};

/// Create a test executor with default sandbox config
fn test_executor() -> JobExecutor {
    JobExecutor::new(SandboxConfig::default())
}

#[tokio::test]
async fn test_execute_simple_command() {
    let executor = test_executor();
    let job = Job::shell("job-1", "echo hello");

    let result = executor.execute(&job, &CancellationToken::new()).await;

    assert!(result.is_success());
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.output, "hello\n");
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_execute_empty_output() {
    let executor = test_executor();
    let job = Job::shell("job-1", "true");

    let result = executor.execute(&job, &CancellationToken::new()).await;

    assert!(result.is_success());
    assert!(result.output.is_empty());
}

#[tokio::test]
async fn test_execute_failing_command() {
    let executor = test_executor();
    let job = Job::shell("job-1", "exit 3");

    let result = executor.execute(&job, &CancellationToken::new()).await;

    assert!(!result.is_success());
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.error.as_deref(), Some("exit code 3"));
}

#[tokio::test]
async fn test_stderr_becomes_error_and_follows_stdout() {
    let executor = test_executor();
    let job = Job::shell("job-1", "echo out; echo broken >&2; exit 1");

    let result = executor.execute(&job, &CancellationToken::new()).await;

    assert_eq!(result.exit_code, 1);
    assert_eq!(result.output, "out\nbroken\n");
    assert_eq!(result.error.as_deref(), Some("broken"));
}

#[tokio::test]
async fn test_envs_are_applied() {
    let executor = ShellExecutor;
    let job = Job::shell("job-1", "echo \"$GREETING $TARGET\"")
        .with_envs(vec!["GREETING=hello".to_string(), "TARGET=titan".to_string()]);

    let result = executor.execute(&job, &CancellationToken::new()).await;

    assert!(result.is_success());
    assert_eq!(result.output, "hello titan\n");
}

#[tokio::test]
async fn test_command_runs_without_shell_wrapper() {
    let executor = ShellExecutor;
    let job = Job::new(
        "job-1",
        JobType::Shell,
        vec!["echo".to_string(), "$HOME".to_string()],
    );

    let result = executor.execute(&job, &CancellationToken::new()).await;

    // argv is passed through untouched, no expansion
    assert_eq!(result.output, "$HOME\n");
}

#[tokio::test]
async fn test_missing_program_fails() {
    let executor = ShellExecutor;
    let job = Job::new(
        "job-1",
        JobType::Shell,
        vec!["/definitely/not/a/program".to_string()],
    );

    let result = executor.execute(&job, &CancellationToken::new()).await;

    assert!(!result.is_success());
    assert_eq!(result.exit_code, NO_EXIT_CODE);
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_empty_command_fails() {
    let executor = ShellExecutor;
    let job = Job::new("job-1", JobType::Shell, Vec::new());

    let result = executor.execute(&job, &CancellationToken::new()).await;

    assert!(!result.is_success());
    assert_eq!(result.error.as_deref(), Some("job has an empty command"));
}

#[tokio::test]
async fn test_cancel_kills_running_job() {
    let executor = test_executor();
    let job = Job::shell("job-1", "sleep 30");
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = executor.execute(&job, &cancel).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!result.is_success());
    assert_eq!(result.exit_code, NO_EXIT_CODE);
    assert_eq!(result.error.as_deref(), Some("execution cancelled"));
}

#[tokio::test]
async fn test_execute_large_output() {
    let executor = test_executor();
    let job = Job::shell("job-1", "seq 1 10000");

    let result = executor.execute(&job, &CancellationToken::new()).await;

    assert!(result.is_success());
    assert_eq!(result.output.lines().count(), 10000);
    assert!(result.output.ends_with("10000\n"));
}
