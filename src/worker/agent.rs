use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::AgentConfig;
use crate::error::{Result, TitanError};
use crate::model::{Job, JobEventKind, JobState};
use crate::store::{job_key, ClusterStore, JobWatch};
use crate::worker::executor::{ExecutionResult, Executor};
use crate::worker::heartbeat::HeartbeatSender;

/// Delay before re-subscribing after the job stream closed under us.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Rounds of re-read and rewrite when a status write fails.
const WRITE_ATTEMPTS: usize = 5;

/// First pause after a status write hits a store fault.
const WRITE_BACKOFF: Duration = Duration::from_millis(100);

/// The per-node agent: keeps the node alive and runs the jobs bound to it.
pub struct Agent {
    config: AgentConfig,
    store: ClusterStore,
    executor: Arc<dyn Executor>,
    permits: Arc<Semaphore>,
    /// Jobs this agent is currently claiming or running
    claimed: Mutex<HashSet<String>>,
    tracker: TaskTracker,
}

impl Agent {
    pub fn new(store: ClusterStore, config: AgentConfig, executor: Arc<dyn Executor>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            config,
            store,
            executor,
            claimed: Mutex::new(HashSet::new()),
            tracker: TaskTracker::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Register the node, then heartbeat and execute bound jobs until
    /// `cancel` fires. Running executions are killed on cancellation and
    /// waited for before returning.
    ///
    /// Fails if the first heartbeat or the first subscription fails.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let heartbeat = HeartbeatSender::new(self.store.clone(), &self.config);
        heartbeat.beat().await?;
        self.tracker.spawn(heartbeat.run(cancel.clone()));

        let mut watch = self.store.watch_jobs(cancel.child_token()).await?;
        tracing::info!(node_id = %self.config.node_id, "Agent started, watching for jobs");
        // Binds made before we subscribed
        self.catch_up(&cancel).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = watch.next() => match event {
                    Some(event) => {
                        if event.kind != JobEventKind::Delete {
                            self.offer(event.job, event.version, &cancel).await;
                        }
                    }
                    None => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        tracing::warn!(node_id = %self.config.node_id, "Job watch closed, resubscribing");
                        match self.resubscribe(&cancel).await {
                            Some(next) => watch = next,
                            None => break,
                        }
                        self.catch_up(&cancel).await;
                    }
                },
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(node_id = %self.config.node_id, "Agent stopped");
        Ok(())
    }

    async fn resubscribe(&self, cancel: &CancellationToken) -> Option<JobWatch> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
            match self.store.watch_jobs(cancel.child_token()).await {
                Ok(watch) => return Some(watch),
                Err(e) => tracing::warn!(error = %e, "Failed to resubscribe to jobs"),
            }
        }
    }

    /// Pick up every job already Scheduled for this node.
    async fn catch_up(self: &Arc<Self>, cancel: &CancellationToken) {
        match self.store.list_jobs().await {
            Ok(jobs) => {
                for job in jobs {
                    self.offer(job.value, job.version, cancel).await;
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to list jobs for catch-up"),
        }
    }

    /// Start executing `job` if it is Scheduled here and not already ours.
    async fn offer(self: &Arc<Self>, job: Job, version: u64, cancel: &CancellationToken) {
        if job.state() != JobState::Scheduled || !job.is_assigned_to(&self.config.node_id) {
            return;
        }
        if !self.claimed.lock().await.insert(job.id.clone()) {
            return;
        }
        tracing::debug!(job_id = %job.id, "Detected job bound to this node");

        let this = self.clone();
        let cancel = cancel.clone();
        self.tracker.spawn(async move {
            let job_id = job.id.clone();
            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = this.permits.clone().acquire_owned() => permit.ok(),
            };
            if let Some(_permit) = permit {
                match this.execute(job, version, &cancel).await {
                    Ok(Some(state)) => tracing::debug!(job_id = %job_id, state = %state, "Job finished"),
                    Ok(None) => {}
                    Err(e) => tracing::error!(job_id = %job_id, error = %e, "Job execution aborted"),
                }
            }
            this.claimed.lock().await.remove(&job_id);
        });
    }

    /// Claim, run and finalize one job. Returns the terminal state written,
    /// or `None` if the job was not ours to run after all.
    pub async fn execute(
        &self,
        job: Job,
        version: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<JobState>> {
        let Some((mut job, mut version)) = self.claim(job, version).await? else {
            return Ok(None);
        };
        tracing::info!(job_id = %job.id, node_id = %self.config.node_id, "Job claimed");

        let mut output = String::new();
        let result = loop {
            let result = self.executor.execute(&job, cancel).await;
            output.push_str(&result.output);

            if result.is_success()
                || cancel.is_cancelled()
                || job.status.attempts > job.spec.retry_count
            {
                break result;
            }

            let delay = self.config.retry_delay(job.status.attempts);
            tracing::warn!(
                job_id = %job.id,
                attempt = job.status.attempts,
                retries_left = job.spec.retry_count + 1 - job.status.attempts,
                delay_ms = delay.as_millis() as u64,
                error = result.error.as_deref().unwrap_or_default(),
                "Job failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => break result,
                _ = tokio::time::sleep(delay) => {}
            }

            job.transition(JobState::Running)?;
            job.status.attempts += 1;
            version = self.write(&job, version).await?;
        };

        // Logs first so a terminal job always has its output readable
        if !output.is_empty() {
            if let Err(e) = self.store.save_log(&job.id, &output).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to save job log");
            }
        }

        let state = self.finish(&mut job, result);
        self.write(&job, version).await?;
        tracing::info!(
            job_id = %job.id,
            state = %state,
            exit_code = job.status.exit_code,
            attempts = job.status.attempts,
            "Job completed"
        );
        Ok(Some(state))
    }

    fn finish(&self, job: &mut Job, result: ExecutionResult) -> JobState {
        let state = if result.is_success() {
            JobState::Success
        } else {
            JobState::Failed
        };
        job.status.state = state;
        job.status.exit_code = result.exit_code;
        job.status.error = result.error;
        job.status.end_time = Some(Utc::now());
        state
    }

    /// Scheduled -> Running, conditional on `version`. A lost race re-reads
    /// the job and tries again only while it is still Scheduled here. A
    /// transient failure is retried after a short backoff, and a claim that
    /// landed despite the error is recognised on the re-read.
    async fn claim(&self, job: Job, version: u64) -> Result<Option<(Job, u64)>> {
        let mut running = job;
        running.transition(JobState::Running)?;
        running.status.attempts = 1;
        let mut version = version;
        let mut last_err = None;

        for attempt in 1..=WRITE_ATTEMPTS {
            match self.store.update_job_if(&running, version).await {
                Ok(next) => return Ok(Some((running, next))),
                Err(e) if e.is_transient() => {
                    back_off(&running.id, attempt, &e).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }

            let current = match self.store.get_job(&running.id).await {
                Ok(Some(current)) => current,
                Ok(None) => return Ok(None),
                Err(e) if e.is_transient() => {
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if current.value == running {
                return Ok(Some((running, current.version)));
            }
            if current.value.state() != JobState::Scheduled
                || !current.value.is_assigned_to(&self.config.node_id)
            {
                tracing::debug!(job_id = %running.id, state = %current.value.state(), "Job no longer ours to claim");
                return Ok(None);
            }
            running = current.value;
            running.transition(JobState::Running)?;
            running.status.attempts = 1;
            version = current.version;
        }
        Err(last_err.unwrap_or_else(|| TitanError::Conflict(job_key(&running.id))))
    }

    /// Persist the status of a job this agent is running. A lost race or a
    /// transient failure re-reads the record: if the write landed anyway it
    /// is done, otherwise it is repeated on the fresh version as long as the
    /// stored job is still Running here.
    async fn write(&self, job: &Job, mut version: u64) -> Result<u64> {
        let mut last_err = None;

        for attempt in 1..=WRITE_ATTEMPTS {
            match self.store.update_job_if(job, version).await {
                Ok(next) => return Ok(next),
                Err(e) if e.is_transient() => {
                    back_off(&job.id, attempt, &e).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }

            let current = match self.store.get_job(&job.id).await {
                Ok(Some(current)) => current,
                Ok(None) => return Err(TitanError::NotFound(job.id.clone())),
                Err(e) if e.is_transient() => {
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if current.value == *job {
                return Ok(current.version);
            }
            let stored = current.value;
            if stored.state() != JobState::Running || !stored.is_assigned_to(&self.config.node_id) {
                return Err(TitanError::InvalidTransition {
                    from: stored.state(),
                    to: job.state(),
                });
            }
            version = current.version;
        }
        Err(last_err.unwrap_or_else(|| TitanError::Conflict(job_key(&job.id))))
    }
}

/// Pause before re-reading after a failed status write. Lost races
/// retry at once; store faults wait `WRITE_BACKOFF` doubled per attempt.
async fn back_off(job_id: &str, attempt: usize, error: &TitanError) {
    if matches!(error, TitanError::Conflict(_)) {
        return;
    }
    let delay = WRITE_BACKOFF.saturating_mul(1 << (attempt - 1).min(6));
    tracing::warn!(
        job_id,
        attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "Job status write failed, retrying"
    );
    tokio::time::sleep(delay).await;
}
