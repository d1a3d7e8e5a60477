use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::model::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    #[serde(rename = "READY")]
    Ready,
    /// Heartbeats stopped arriving
    #[serde(rename = "OFFLINE")]
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Ready => write!(f, "READY"),
            NodeStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// A machine able to run jobs, as registered by its agent.
///
/// `allocated` is always the sum of `assignments`. Only the scheduler changes
/// either of them; agent heartbeats carry them over untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub ip: String,
    pub version: String,
    pub total_cap: Resource,
    #[serde(default)]
    pub allocated: Resource,
    pub status: NodeStatus,
    /// Unix seconds
    pub last_heartbeat: i64,
    /// Reservation per bound job id
    #[serde(default)]
    pub assignments: BTreeMap<String, Resource>,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        ip: impl Into<String>,
        version: impl Into<String>,
        total_cap: Resource,
    ) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
            version: version.into(),
            total_cap,
            allocated: Resource::zero(),
            status: NodeStatus::Ready,
            last_heartbeat: Utc::now().timestamp(),
            assignments: BTreeMap::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == NodeStatus::Ready
    }

    /// Capacity not yet reserved. May be negative only if the record was
    /// written by something other than the scheduler.
    pub fn free(&self) -> Resource {
        Resource::new(
            self.total_cap.milli_cpu - self.allocated.milli_cpu,
            self.total_cap.memory - self.allocated.memory,
        )
    }

    /// Reserve `req` for `job_id`. Returns false, leaving the node untouched,
    /// if the job already holds a reservation, the request is negative or it
    /// does not fit.
    pub fn reserve(&mut self, job_id: &str, req: Resource) -> bool {
        if !req.is_non_negative() || self.assignments.contains_key(job_id) {
            return false;
        }
        let Some(next) = self.allocated.checked_add(&req) else {
            return false;
        };
        if !next.fits_within(&self.total_cap) {
            return false;
        }
        self.allocated = next;
        self.assignments.insert(job_id.to_string(), req);
        true
    }

    /// Drop the reservation held by `job_id`, returning what was freed.
    /// Releasing twice is a no-op the second time.
    pub fn release(&mut self, job_id: &str) -> Option<Resource> {
        let freed = self.assignments.remove(job_id)?;
        self.allocated = self.allocated.saturating_sub(&freed);
        Some(freed)
    }

    pub fn is_stale(&self, now_secs: i64, timeout_secs: i64) -> bool {
        now_secs - self.last_heartbeat > timeout_secs
    }
}

impl AsRef<Node> for Node {
    fn as_ref(&self) -> &Node {
        self
    }
}
