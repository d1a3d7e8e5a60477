use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TitanError};
use crate::model::{Job, JobEvent, JobEventKind, JobState, Node};
use crate::store::{
    job_key, log_key, node_key, Store, Watch, WatchEventKind, JOB_PREFIX, NODE_PREFIX,
};

/// A decoded record together with the version to use for a conditional
/// update of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

impl AsRef<Node> for Versioned<Node> {
    fn as_ref(&self) -> &Node {
        &self.value
    }
}

/// Stored output of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub job_id: String,
    pub content: String,
}

/// How many times `cancel_job` re-reads after losing a race.
const CANCEL_ATTEMPTS: usize = 5;

/// Typed view of the job, node and log namespaces.
///
/// Every call is bounded by the configured timeout so a slow store cannot
/// wedge a loop; a timeout surfaces as `TitanError::Timeout`.
#[derive(Clone)]
pub struct ClusterStore {
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl ClusterStore {
    pub fn new(store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn raw(&self) -> &Arc<dyn Store> {
        &self.store
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TitanError::Timeout(op.to_string())),
        }
    }

    // ---------------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------------

    /// Write a new job. Fails with `AlreadyExists` if the id is taken and
    /// with `InvalidRequest` if it asks for a negative amount of anything.
    pub async fn create_job(&self, job: &Job) -> Result<u64> {
        if !job.res_req.is_non_negative() {
            return Err(TitanError::InvalidRequest(format!(
                "job {} requests negative resources ({})",
                job.id, job.res_req
            )));
        }
        let key = job_key(&job.id);
        let value = serde_json::to_string(job)?;
        match self
            .bounded("create_job", self.store.put_if_version(&key, value, 0))
            .await
        {
            Err(TitanError::Conflict(key)) => Err(TitanError::AlreadyExists(key)),
            other => other,
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Versioned<Job>>> {
        let kv = self
            .bounded("get_job", self.store.get(&job_key(job_id)))
            .await?;
        match kv {
            Some(kv) => Ok(Some(Versioned {
                value: serde_json::from_str(&kv.value)?,
                version: kv.version,
            })),
            None => Ok(None),
        }
    }

    pub async fn update_job(&self, job: &Job) -> Result<u64> {
        let value = serde_json::to_string(job)?;
        self.bounded("update_job", self.store.put(&job_key(&job.id), value))
            .await
    }

    /// Write `job` only if its record is still at `expected`.
    pub async fn update_job_if(&self, job: &Job, expected: u64) -> Result<u64> {
        let value = serde_json::to_string(job)?;
        self.bounded(
            "update_job_if",
            self.store
                .put_if_version(&job_key(&job.id), value, expected),
        )
        .await
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<bool> {
        self.bounded("delete_job", self.store.delete(&job_key(job_id)))
            .await
    }

    /// Every decodable job, ordered by id. Malformed records are skipped.
    pub async fn list_jobs(&self) -> Result<Vec<Versioned<Job>>> {
        let items = self
            .bounded("list_jobs", self.store.list(JOB_PREFIX))
            .await?;
        Ok(items
            .into_iter()
            .filter_map(|kv| match serde_json::from_str::<Job>(&kv.value) {
                Ok(job) => Some(Versioned {
                    value: job,
                    version: kv.version,
                }),
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "Skipping malformed job record");
                    None
                }
            })
            .collect())
    }

    /// Operator cancel: `Pending -> Cancelled`. Any other state is refused.
    pub async fn cancel_job(&self, job_id: &str) -> Result<Job> {
        for _ in 0..CANCEL_ATTEMPTS {
            let Some(current) = self.get_job(job_id).await? else {
                return Err(TitanError::NotFound(job_id.to_string()));
            };
            let mut job = current.value;
            job.transition(JobState::Cancelled)?;
            job.status.end_time = Some(Utc::now());

            match self.update_job_if(&job, current.version).await {
                Ok(_) => {
                    tracing::info!(job_id, "Job cancelled");
                    return Ok(job);
                }
                Err(TitanError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(TitanError::Conflict(job_key(job_id)))
    }

    pub async fn watch_jobs(&self, cancel: CancellationToken) -> Result<JobWatch> {
        let inner = self
            .bounded("watch_jobs", self.store.watch(JOB_PREFIX, cancel))
            .await?;
        Ok(JobWatch { inner })
    }

    // ---------------------------------------------------------------------
    // Nodes
    // ---------------------------------------------------------------------

    pub async fn get_node(&self, node_id: &str) -> Result<Option<Versioned<Node>>> {
        let kv = self
            .bounded("get_node", self.store.get(&node_key(node_id)))
            .await?;
        match kv {
            Some(kv) => Ok(Some(Versioned {
                value: serde_json::from_str(&kv.value)?,
                version: kv.version,
            })),
            None => Ok(None),
        }
    }

    /// Every decodable node, ordered by id. Malformed records are skipped.
    pub async fn list_nodes(&self) -> Result<Vec<Versioned<Node>>> {
        let items = self
            .bounded("list_nodes", self.store.list(NODE_PREFIX))
            .await?;
        Ok(items
            .into_iter()
            .filter_map(|kv| match serde_json::from_str::<Node>(&kv.value) {
                Ok(node) => Some(Versioned {
                    value: node,
                    version: kv.version,
                }),
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "Skipping malformed node record");
                    None
                }
            })
            .collect())
    }

    /// Write `node` only if its record is still at `expected` (`0`: absent).
    pub async fn put_node_if(&self, node: &Node, expected: u64) -> Result<u64> {
        let value = serde_json::to_string(node)?;
        self.bounded(
            "put_node_if",
            self.store
                .put_if_version(&node_key(&node.id), value, expected),
        )
        .await
    }

    // ---------------------------------------------------------------------
    // Logs
    // ---------------------------------------------------------------------

    pub async fn save_log(&self, job_id: &str, content: &str) -> Result<u64> {
        let record = LogRecord {
            job_id: job_id.to_string(),
            content: content.to_string(),
        };
        let value = serde_json::to_string(&record)?;
        self.bounded("save_log", self.store.put(&log_key(job_id), value))
            .await
    }

    pub async fn get_log(&self, job_id: &str) -> Result<Option<String>> {
        let kv = self
            .bounded("get_log", self.store.get(&log_key(job_id)))
            .await?;
        match kv {
            Some(kv) => Ok(Some(serde_json::from_str::<LogRecord>(&kv.value)?.content)),
            None => Ok(None),
        }
    }
}

/// Job-typed watch stream. Records that fail to decode are logged and
/// skipped.
pub struct JobWatch {
    inner: Watch,
}

impl JobWatch {
    pub async fn next(&mut self) -> Option<JobEvent> {
        loop {
            let event = self.inner.next().await?;
            let job = match serde_json::from_str::<Job>(&event.value) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(key = %event.key, error = %e, "Skipping malformed job event");
                    continue;
                }
            };
            let kind = match (event.kind, event.created) {
                (WatchEventKind::Delete, _) => JobEventKind::Delete,
                (WatchEventKind::Put, true) => JobEventKind::Create,
                (WatchEventKind::Put, false) => JobEventKind::Update,
            };
            return Some(JobEvent {
                kind,
                job,
                version: event.revision,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Resource, JobType};
    use crate::store::MemoryStore;

    fn cluster() -> ClusterStore {
        ClusterStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn create_job_refuses_duplicates() {
        let cs = cluster();
        let job = Job::shell("job-1", "true");
        cs.create_job(&job).await.unwrap();
        let err = cs.create_job(&job).await.unwrap_err();
        assert!(matches!(err, TitanError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_job_rejects_negative_requests() {
        let cs = cluster();
        for req in [Resource::new(-1000, 10), Resource::new(10, -1)] {
            let job = Job::shell("neg", "true").with_resources(req);
            let err = cs.create_job(&job).await.unwrap_err();
            assert!(matches!(err, TitanError::InvalidRequest(_)));
        }
        assert!(cs.get_job("neg").await.unwrap().is_none());

        let free = Job::shell("free", "true").with_resources(Resource::zero());
        cs.create_job(&free).await.unwrap();
    }

    #[tokio::test]
    async fn list_skips_malformed_records() {
        let cs = cluster();
        cs.create_job(&Job::shell("job-1", "true")).await.unwrap();
        cs.raw()
            .put(&job_key("broken"), "{not json".to_string())
            .await
            .unwrap();

        let jobs = cs.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].value.id, "job-1");
    }

    #[tokio::test]
    async fn cancel_only_from_pending() {
        let cs = cluster();
        cs.create_job(&Job::shell("job-1", "true")).await.unwrap();
        let cancelled = cs.cancel_job("job-1").await.unwrap();
        assert_eq!(cancelled.state(), JobState::Cancelled);
        assert!(cancelled.status.end_time.is_some());

        let err = cs.cancel_job("job-1").await.unwrap_err();
        assert!(matches!(err, TitanError::InvalidTransition { .. }));
        assert!(matches!(
            cs.cancel_job("missing").await,
            Err(TitanError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn job_watch_classifies_events() {
        let cs = cluster();
        let cancel = CancellationToken::new();
        let mut watch = cs.watch_jobs(cancel.clone()).await.unwrap();

        let mut job = Job::new("job-1", JobType::Shell, vec!["true".to_string()])
            .with_resources(Resource::new(1, 1));
        cs.create_job(&job).await.unwrap();
        job.status.state = JobState::Scheduled;
        cs.update_job(&job).await.unwrap();
        cs.raw().put(&job_key("junk"), "junk".to_string()).await.unwrap();
        cs.delete_job("job-1").await.unwrap();

        let kinds: Vec<JobEventKind> = vec![
            watch.next().await.unwrap().kind,
            watch.next().await.unwrap().kind,
            watch.next().await.unwrap().kind,
        ];
        assert_eq!(
            kinds,
            vec![JobEventKind::Create, JobEventKind::Update, JobEventKind::Delete]
        );

        cancel.cancel();
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn event_version_allows_conditional_update() {
        let cs = cluster();
        let mut watch = cs.watch_jobs(CancellationToken::new()).await.unwrap();
        cs.create_job(&Job::shell("job-1", "true")).await.unwrap();

        let event = watch.next().await.unwrap();
        let mut job = event.job;
        job.transition(JobState::Scheduled).unwrap();
        cs.update_job_if(&job, event.version).await.unwrap();
        assert!(cs.update_job_if(&job, event.version).await.is_err());
    }

    #[tokio::test]
    async fn logs_round_trip_through_log_namespace() {
        let cs = cluster();
        assert!(cs.get_log("job-1").await.unwrap().is_none());
        cs.save_log("job-1", "hello\n").await.unwrap();
        assert_eq!(cs.get_log("job-1").await.unwrap().as_deref(), Some("hello\n"));
        assert!(cs.list_jobs().await.unwrap().is_empty());
    }
}
