//! The scheduler: turns Pending jobs into Scheduled jobs bound to a node.
//!
//! # Loops
//!
//! - **Watch loop**: one task reading the job change stream. Pending jobs get
//!   a scheduling attempt, terminal jobs get their node reservation released.
//! - **Reconciler**: periodic sweep that re-drives Pending jobs (nothing else
//!   would retry a job that found no node) and clears reservations whose job
//!   finished or disappeared.
//! - **Reaper**: marks nodes OFFLINE once their heartbeats stop.
//!
//! # Pipeline
//!
//! refresh → dependency gate → node snapshot → [`filter`] → [`score`] →
//! reserve → bind. Reserve and bind are both conditional writes; losing
//! either race restarts the round from a fresh read.
//!
//! The scheduler is the only writer of `Node.allocated`.

pub mod bind;
pub mod filter;
pub mod score;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;
use crate::error::{Result, TitanError};
use crate::model::{Job, JobEvent, JobEventKind, JobState, NodeStatus};
use crate::store::{ClusterStore, JobWatch};

pub use filter::{check_node, filter_nodes, FilterReason};
pub use score::{score_node, select_best};

/// Delay before re-subscribing after the job stream closed under us.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Whether `node_id` holds a reservation for `job` that nothing will use.
/// A Pending job's reservation is only live while an attempt for it runs;
/// callers check that separately.
fn is_orphaned(job: &Job, node_id: &str) -> bool {
    match job.state() {
        JobState::Pending => true,
        state if state.is_terminal() => true,
        _ => !job.is_assigned_to(node_id),
    }
}

/// Result of one scheduling attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Bound { node_id: String },
    /// The job left Pending before we got to it
    NotPending(JobState),
    /// A dependency has not reached Success
    Blocked { dependency: String },
    /// No node passed the filter
    Unschedulable,
    /// Another attempt for the same job is running
    InFlight,
    Missing,
    /// Every round lost a race
    Exhausted,
}

/// Counters for what the scheduler has done since start.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    bound: AtomicU64,
    unschedulable: AtomicU64,
    blocked: AtomicU64,
    conflicts: AtomicU64,
    released: AtomicU64,
    nodes_reaped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub bound: u64,
    pub unschedulable: u64,
    pub blocked: u64,
    pub conflicts: u64,
    pub released: u64,
    pub nodes_reaped: u64,
}

impl SchedulerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bound: self.bound.load(Ordering::Relaxed),
            unschedulable: self.unschedulable.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            nodes_reaped: self.nodes_reaped.load(Ordering::Relaxed),
        }
    }
}

pub struct Scheduler {
    store: ClusterStore,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<String>>,
    /// (job, dependency) pairs already reported as unable to succeed
    dead_dependencies: Mutex<HashSet<(String, String)>>,
    reconcile: Notify,
    tracker: TaskTracker,
    stats: SchedulerStats,
}

impl Scheduler {
    pub fn new(store: ClusterStore, config: SchedulerConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_binds.max(1))),
            store,
            config,
            in_flight: Mutex::new(HashSet::new()),
            dead_dependencies: Mutex::new(HashSet::new()),
            reconcile: Notify::new(),
            tracker: TaskTracker::new(),
            stats: SchedulerStats::default(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run until `cancel` fires, then wait for spawned attempts to finish.
    ///
    /// Fails only if the first subscription to the job stream cannot be
    /// made.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut watch = self.store.watch_jobs(cancel.child_token()).await?;
        tracing::info!("Scheduler started, watching for jobs");

        self.tracker.spawn(self.clone().reconcile_loop(cancel.clone()));
        self.tracker.spawn(self.clone().reap_loop(cancel.clone()));
        // Jobs written before we subscribed
        self.reconcile.notify_one();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = watch.next() => match event {
                    Some(event) => self.handle_event(event, &cancel),
                    None => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        tracing::warn!("Job watch closed, resubscribing");
                        match self.resubscribe(&cancel).await {
                            Some(next) => watch = next,
                            None => break,
                        }
                        // Anything written while we were away
                        self.reconcile.notify_one();
                    }
                },
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Scheduler stopped");
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

    fn handle_event(self: &Arc<Self>, event: JobEvent, cancel: &CancellationToken) {
        let job = event.job;

        if event.kind == JobEventKind::Delete {
            if let Some(node_id) = job.status.node_id.clone() {
                self.spawn_release(job.id, node_id);
            }
            return;
        }

        match job.state() {
            JobState::Pending => {
                tracing::debug!(job_id = %job.id, "Detected pending job");
                self.spawn_schedule(job.id, cancel.clone());
            }
            state if state.is_terminal() => {
                if let Some(node_id) = job.status.node_id.clone() {
                    self.spawn_release(job.id, node_id);
                }
                if state == JobState::Success {
                    // Dependents may be unblocked now
                    self.reconcile.notify_one();
                }
            }
            _ => {}
        }
    }

    fn spawn_schedule(self: &Arc<Self>, job_id: String, cancel: CancellationToken) {
        let this = self.clone();
        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = this.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            match this.schedule_job(&job_id).await {
                Ok(outcome) => tracing::trace!(job_id = %job_id, outcome = ?outcome, "Scheduling attempt finished"),
                Err(e) => tracing::error!(job_id = %job_id, error = %e, "Scheduling attempt failed"),
            }
        });
    }

    fn spawn_release(self: &Arc<Self>, job_id: String, node_id: String) {
        let this = self.clone();
        self.tracker.spawn(async move {
            this.release(&job_id, &node_id).await;
        });
    }

    async fn release(&self, job_id: &str, node_id: &str) {
        match bind::release(&self.store, node_id, job_id, self.config.bind_attempts).await {
            Ok(Some(freed)) => {
                SchedulerStats::bump(&self.stats.released);
                tracing::info!(job_id, node_id, freed = %freed, "Released job resources");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(job_id, node_id, error = %e, "Failed to release job resources");
            }
        }
    }

    /// Run the scheduling pipeline for one job.
    ///
    /// At most one attempt per job runs at a time; a concurrent call returns
    /// [`ScheduleOutcome::InFlight`] straight away.
    pub async fn schedule_job(&self, job_id: &str) -> Result<ScheduleOutcome> {
        if !self.in_flight.lock().await.insert(job_id.to_string()) {
            return Ok(ScheduleOutcome::InFlight);
        }
        let result = self.schedule_rounds(job_id).await;
        if !matches!(result, Ok(ScheduleOutcome::Blocked { .. })) {
            self.dead_dependencies
                .lock()
                .await
                .retain(|(job, _)| job != job_id);
        }
        self.in_flight.lock().await.remove(job_id);
        result
    }

    async fn schedule_rounds(&self, job_id: &str) -> Result<ScheduleOutcome> {
        for round in 1..=self.config.bind_attempts.max(1) {
            // Refresh: the triggering event may be stale by now.
            let Some(current) = self.store.get_job(job_id).await? else {
                return Ok(ScheduleOutcome::Missing);
            };
            let job = current.value;
            if job.state() != JobState::Pending {
                return Ok(ScheduleOutcome::NotPending(job.state()));
            }

            if let Some(dependency) = self.unmet_dependency(&job).await? {
                SchedulerStats::bump(&self.stats.blocked);
                return Ok(ScheduleOutcome::Blocked { dependency });
            }

            let nodes = match self.store.list_nodes().await {
                Ok(nodes) => nodes,
                Err(e) => {
                    tracing::error!(job_id, error = %e, "Failed to list nodes");
                    return Err(e);
                }
            };

            let candidates = filter_nodes(&job, &nodes);
            let Some(best) = select_best(&job.res_req, candidates.iter().copied()) else {
                SchedulerStats::bump(&self.stats.unschedulable);
                tracing::warn!(
                    job_id,
                    nodes = nodes.len(),
                    required = %job.res_req,
                    "Job pending: no suitable nodes found"
                );
                return Ok(ScheduleOutcome::Unschedulable);
            };
            let node_id = best.value.id.clone();

            match bind::reserve(&self.store, best, &job).await {
                Ok(_) => {}
                Err(TitanError::Conflict(_)) => {
                    SchedulerStats::bump(&self.stats.conflicts);
                    tracing::debug!(job_id, node_id = %node_id, round, "Lost reservation race, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }

            let mut bound = job;
            bound.transition(JobState::Scheduled)?;
            bound.status.node_id = Some(node_id.clone());
            bound.status.start_time = Some(Utc::now());

            match self.store.update_job_if(&bound, current.version).await {
                Ok(_) => {
                    SchedulerStats::bump(&self.stats.bound);
                    tracing::info!(job_id, node_id = %node_id, "Scheduled job");
                    return Ok(ScheduleOutcome::Bound { node_id });
                }
                Err(e) => {
                    tracing::warn!(job_id, node_id = %node_id, error = %e, "Failed to bind job");
                    if self.bind_landed(job_id, &node_id).await {
                        SchedulerStats::bump(&self.stats.bound);
                        return Ok(ScheduleOutcome::Bound { node_id });
                    }
                    self.release(job_id, &node_id).await;
                    if !e.is_transient() {
                        return Err(e);
                    }
                    SchedulerStats::bump(&self.stats.conflicts);
                }
            }
        }

        tracing::warn!(job_id, "Giving up on job after repeated conflicts");
        Ok(ScheduleOutcome::Exhausted)
    }

    /// After a failed bind write, check whether it was applied anyway (a
    /// timeout can hide a successful write).
    async fn bind_landed(&self, job_id: &str, node_id: &str) -> bool {
        match self.store.get_job(job_id).await {
            Ok(Some(current)) => {
                current.value.state() != JobState::Pending && current.value.is_assigned_to(node_id)
            }
            _ => false,
        }
    }

    /// First dependency that has not reached Success.
    async fn unmet_dependency(&self, job: &Job) -> Result<Option<String>> {
        for dep_id in &job.dependencies {
            let state = self.store.get_job(dep_id).await?.map(|d| d.value.state());
            match state {
                Some(JobState::Success) => continue,
                Some(state) if state.is_terminal() => {
                    if self.first_dead_dependency(&job.id, dep_id).await {
                        tracing::warn!(
                            job_id = %job.id,
                            dependency = %dep_id,
                            dependency_state = %state,
                            "Dependency can no longer succeed, job stays pending"
                        );
                    } else {
                        tracing::debug!(job_id = %job.id, dependency = %dep_id, dependency_state = %state, "Still blocked on dead dependency");
                    }
                }
                Some(state) => {
                    tracing::debug!(job_id = %job.id, dependency = %dep_id, dependency_state = %state, "Waiting on dependency");
                }
                None => {
                    if self.first_dead_dependency(&job.id, dep_id).await {
                        tracing::warn!(job_id = %job.id, dependency = %dep_id, "Dependency does not exist");
                    } else {
                        tracing::debug!(job_id = %job.id, dependency = %dep_id, "Still blocked on missing dependency");
                    }
                }
            }
            return Ok(Some(dep_id.clone()));
        }
        Ok(None)
    }

    /// True the first time `job_id` is seen blocked on `dep_id` in a state it
    /// cannot leave; the sweep re-drives such jobs every interval.
    async fn first_dead_dependency(&self, job_id: &str, dep_id: &str) -> bool {
        self.dead_dependencies
            .lock()
            .await
            .insert((job_id.to_string(), dep_id.to_string()))
    }

    async fn reconcile_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.reconcile_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.reconcile.notified() => {}
            }
            if let Err(e) = self.reconcile_once(&cancel).await {
                tracing::warn!(error = %e, "Reconciliation sweep failed");
            }
        }
    }

    /// One sweep: re-drive every Pending job and return reservations held
    /// for jobs that are finished, gone, or bound elsewhere.
    pub async fn reconcile_once(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let jobs = self.store.list_jobs().await?;
        let nodes = self.store.list_nodes().await?;
        let by_id: HashMap<&str, &Job> = jobs
            .iter()
            .map(|j| (j.value.id.as_str(), &j.value))
            .collect();

        let mut stale = Vec::new();
        for node in nodes.iter().map(|n| &n.value) {
            for job_id in node.assignments.keys() {
                let orphaned = by_id
                    .get(job_id.as_str())
                    .map_or(true, |job| is_orphaned(job, &node.id));
                if orphaned {
                    stale.push((job_id.clone(), node.id.clone()));
                }
            }
        }
        for (job_id, node_id) in &stale {
            self.release_orphan(job_id, node_id).await;
        }

        let mut pending = 0usize;
        for job in jobs.iter().map(|j| &j.value) {
            if job.state() == JobState::Pending {
                pending += 1;
                self.spawn_schedule(job.id.clone(), cancel.clone());
            }
        }

        if pending > 0 || !stale.is_empty() {
            tracing::debug!(pending, stale = stale.len(), "Reconciliation sweep");
        }
        Ok(())
    }

    /// Release a reservation the sweep flagged, after re-checking the job.
    ///
    /// The job is held in `in_flight` meanwhile so no scheduling attempt can
    /// pick the reservation up while it is being returned.
    async fn release_orphan(&self, job_id: &str, node_id: &str) {
        if !self.in_flight.lock().await.insert(job_id.to_string()) {
            return;
        }
        let orphaned = match self.store.get_job(job_id).await {
            Ok(None) => true,
            Ok(Some(current)) => is_orphaned(&current.value, node_id),
            Err(e) => {
                tracing::warn!(job_id, node_id, error = %e, "Failed to re-check reservation");
                false
            }
        };
        if orphaned {
            self.release(job_id, node_id).await;
        }
        self.in_flight.lock().await.remove(job_id);
    }

    async fn reap_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.reap_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.reap_once().await {
                tracing::warn!(error = %e, "Node reaper sweep failed");
            }
        }
    }

    /// Mark READY nodes whose heartbeat is older than the timeout OFFLINE.
    /// Returns how many were flipped.
    pub async fn reap_once(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let timeout_secs = (self.config.node_timeout_ms / 1000) as i64;
        let mut reaped = 0;

        for current in self.store.list_nodes().await? {
            let mut node = current.value;
            if node.status != NodeStatus::Ready || !node.is_stale(now, timeout_secs) {
                continue;
            }
            node.status = NodeStatus::Offline;
            match self.store.put_node_if(&node, current.version).await {
                Ok(_) => {
                    reaped += 1;
                    SchedulerStats::bump(&self.stats.nodes_reaped);
                    tracing::warn!(
                        node_id = %node.id,
                        last_heartbeat = node.last_heartbeat,
                        jobs = node.assignments.len(),
                        "Node missed heartbeats, marked offline"
                    );
                }
                // A heartbeat landed in between
                Err(TitanError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }
}
