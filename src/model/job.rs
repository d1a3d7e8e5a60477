use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TitanError};
use crate::model::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    #[serde(rename = "SHELL")]
    Shell,
    #[serde(rename = "DOCKER")]
    Docker,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Shell => write!(f, "SHELL"),
            JobType::Docker => write!(f, "DOCKER"),
        }
    }
}

/// Lifecycle state of a job. Stored as its integer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum JobState {
    Pending,
    Scheduled,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failed | JobState::Cancelled
        )
    }

    /// Legal edges of the job state machine.
    ///
    /// `Running -> Running` is allowed so the worker can persist attempt
    /// counters between retries. Nothing ever leaves a terminal state.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Scheduled)
                | (Pending, Cancelled)
                | (Scheduled, Running)
                | (Running, Running)
                | (Running, Success)
                | (Running, Failed)
        )
    }
}

impl From<JobState> for u8 {
    fn from(state: JobState) -> u8 {
        match state {
            JobState::Pending => 0,
            JobState::Scheduled => 1,
            JobState::Running => 2,
            JobState::Success => 3,
            JobState::Failed => 4,
            JobState::Cancelled => 5,
        }
    }
}

impl TryFrom<u8> for JobState {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(JobState::Pending),
            1 => Ok(JobState::Scheduled),
            2 => Ok(JobState::Running),
            3 => Ok(JobState::Success),
            4 => Ok(JobState::Failed),
            5 => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state {}", other)),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Scheduled => write!(f, "scheduled"),
            JobState::Running => write!(f, "running"),
            JobState::Success => write!(f, "success"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What to run. Fixed once the job is submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    /// `KEY=VALUE` pairs
    #[serde(default)]
    pub envs: Vec<String>,
    /// Extra executions allowed after the first failure
    #[serde(default)]
    pub retry_count: u32,
}

/// Mutable part of a job, written by the scheduler and then by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            state: JobState::Pending,
            node_id: None,
            exit_code: 0,
            error: None,
            start_time: None,
            end_time: None,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub spec: JobSpec,
    pub res_req: Resource,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Job {
    pub fn new(id: impl Into<String>, job_type: JobType, command: Vec<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            job_type,
            spec: JobSpec {
                command,
                ..JobSpec::default()
            },
            res_req: Resource::zero(),
            status: JobStatus::default(),
            dependencies: Vec::new(),
        }
    }

    /// A shell job running `sh -c <script>`.
    pub fn shell(id: impl Into<String>, script: &str) -> Self {
        Self::new(
            id,
            JobType::Shell,
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        )
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_resources(mut self, res_req: Resource) -> Self {
        self.res_req = res_req;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.spec.image = Some(image.into());
        self
    }

    pub fn with_envs(mut self, envs: Vec<String>) -> Self {
        self.spec.envs = envs;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.spec.retry_count = retry_count;
        self
    }

    pub fn state(&self) -> JobState {
        self.status.state
    }

    pub fn is_assigned_to(&self, node_id: &str) -> bool {
        self.status.node_id.as_deref() == Some(node_id)
    }

    /// Move to `next`, refusing edges the state machine does not allow.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        let from = self.status.state;
        if !from.can_transition_to(next) {
            return Err(TitanError::InvalidTransition { from, to: next });
        }
        self.status.state = next;
        Ok(())
    }
}
