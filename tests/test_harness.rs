//! Test harness for running a scheduler and worker agents against one
//! in-process store.
//!
//! Provides fast configs, a scripted executor and polling helpers.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use titan::config::{AgentConfig, SchedulerConfig};
use titan::model::{Job, JobState, Node, Resource};
use titan::scheduler::Scheduler;
use titan::error::TitanError;
use titan::store::{ClusterStore, KeyValue, MemoryStore, Store, Watch};
use titan::worker::{Agent, ExecutionResult, Executor};

/// Scheduler config with short intervals for faster tests
pub fn test_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_binds: 64,
        bind_attempts: 5,
        reconcile_interval_ms: 200,
        reap_interval_ms: 100,
        node_timeout_ms: 10_000,
        store_timeout_ms: 1000,
    }
}

/// Agent config with short intervals for faster tests
pub fn test_agent_config(node_id: &str, capacity: Resource) -> AgentConfig {
    AgentConfig {
        heartbeat_interval_ms: 100,
        retry_backoff_ms: 10,
        retry_backoff_max_ms: 50,
        store_timeout_ms: 1000,
        ..AgentConfig::new(node_id, capacity)
    }
}

/// Executor that replays queued results per job id instead of running
/// anything. Jobs with nothing queued succeed with `"ok\n"`.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<ExecutionResult>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every execution takes `delay` (or until cancelled).
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn script(&self, job_id: &str, results: Vec<ExecutionResult>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(job_id.to_string(), results.into());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> ExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return ExecutionResult::failure(-1, "execution cancelled");
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&job.id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| ExecutionResult::success("ok\n"))
    }
}

/// Store wrapper that fails chosen conditional writes with a timeout.
///
/// A fault matches any `put_if_version` whose value contains its needle.
/// With `apply` set the write still reaches the engine before the error is
/// returned, the way a reply lost on the wire looks to the caller.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    faults: Mutex<Vec<WriteFault>>,
    injected: AtomicUsize,
}

struct WriteFault {
    needle: String,
    remaining: usize,
    apply: bool,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Vec::new()),
            injected: AtomicUsize::new(0),
        }
    }

    /// Fail the next `times` conditional writes containing `needle`.
    pub fn fail_writes(&self, needle: &str, times: usize, apply: bool) {
        self.faults.lock().unwrap().push(WriteFault {
            needle: needle.to_string(),
            remaining: times,
            apply,
        });
    }

    /// How many faults have fired so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn take_fault(&self, value: &str) -> Option<bool> {
        let mut faults = self.faults.lock().unwrap();
        let fault = faults
            .iter_mut()
            .find(|f| f.remaining > 0 && value.contains(&f.needle))?;
        fault.remaining -= 1;
        self.injected.fetch_add(1, Ordering::SeqCst);
        Some(fault.apply)
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn get(&self, key: &str) -> titan::Result<Option<KeyValue>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: String) -> titan::Result<u64> {
        self.inner.put(key, value).await
    }

    async fn put_if_version(&self, key: &str, value: String, expected: u64) -> titan::Result<u64> {
        match self.take_fault(&value) {
            Some(apply) => {
                if apply {
                    self.inner.put_if_version(key, value, expected).await?;
                }
                Err(TitanError::Timeout(format!("put_if_version {}", key)))
            }
            None => self.inner.put_if_version(key, value, expected).await,
        }
    }

    async fn delete(&self, key: &str) -> titan::Result<bool> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> titan::Result<Vec<KeyValue>> {
        self.inner.list(prefix).await
    }

    async fn watch(&self, prefix: &str, cancel: CancellationToken) -> titan::Result<Watch> {
        self.inner.watch(prefix, cancel).await
    }
}

/// A store plus whatever scheduler and agents a test started on it.
pub struct TestCluster {
    pub engine: Arc<MemoryStore>,
    pub store: ClusterStore,
    pub cancel: CancellationToken,
    pub scheduler: Option<Arc<Scheduler>>,
    tasks: Vec<JoinHandle<titan::Result<()>>>,
}

impl TestCluster {
    pub fn new() -> Self {
        let engine = Arc::new(MemoryStore::new());
        let store = ClusterStore::new(engine.clone(), Duration::from_secs(1));
        Self {
            engine,
            store,
            cancel: CancellationToken::new(),
            scheduler: None,
            tasks: Vec::new(),
        }
    }

    pub fn start_scheduler(&mut self, config: SchedulerConfig) -> Arc<Scheduler> {
        let scheduler = Arc::new(Scheduler::new(self.store.clone(), config));
        self.tasks
            .push(tokio::spawn(scheduler.clone().run(self.cancel.clone())));
        self.scheduler = Some(scheduler.clone());
        scheduler
    }

    pub fn start_agent(&mut self, config: AgentConfig, executor: Arc<dyn Executor>) -> Arc<Agent> {
        let store = self.store.clone();
        self.start_agent_on(store, config, executor)
    }

    /// Start an agent that reaches the engine through its own `store`.
    pub fn start_agent_on(
        &mut self,
        store: ClusterStore,
        config: AgentConfig,
        executor: Arc<dyn Executor>,
    ) -> Arc<Agent> {
        let agent = Arc::new(Agent::new(store, config, executor));
        self.tasks
            .push(tokio::spawn(agent.clone().run(self.cancel.clone())));
        agent
    }

    pub async fn submit(&self, job: Job) {
        self.store.create_job(&job).await.expect("submit job");
    }

    pub async fn job(&self, job_id: &str) -> Job {
        self.store
            .get_job(job_id)
            .await
            .expect("read job")
            .expect("job exists")
            .value
    }

    pub async fn node(&self, node_id: &str) -> Node {
        self.store
            .get_node(node_id)
            .await
            .expect("read node")
            .expect("node exists")
            .value
    }

    pub async fn wait_for_state(&self, job_id: &str, state: JobState, timeout: Duration) -> bool {
        wait_for(
            || async move {
                matches!(self.store.get_job(job_id).await, Ok(Some(j)) if j.value.state() == state)
            },
            timeout,
            Duration::from_millis(20),
        )
        .await
    }

    pub async fn wait_for_node(&self, node_id: &str, timeout: Duration) -> bool {
        wait_for(
            || async move { matches!(self.store.get_node(node_id).await, Ok(Some(_))) },
            timeout,
            Duration::from_millis(20),
        )
        .await
    }

    /// Wait until the node holds no reservations.
    pub async fn wait_for_idle(&self, node_id: &str, timeout: Duration) -> bool {
        wait_for(
            || async move {
                matches!(
                    self.store.get_node(node_id).await,
                    Ok(Some(n)) if n.value.assignments.is_empty() && n.value.allocated.is_zero()
                )
            },
            timeout,
            Duration::from_millis(20),
        )
        .await
    }

    /// Cancel everything and wait for it to drain. Returns each task's result.
    pub async fn shutdown(self) -> Vec<titan::Result<()>> {
        self.cancel.cancel();
        let mut results = Vec::new();
        for task in self.tasks {
            results.push(task.await.expect("task panicked"));
        }
        results
    }
}

/// Wait for a condition to become true
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}
