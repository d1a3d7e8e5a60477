use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::TitanError;
use crate::model::{Job, JobState, Node, NodeStatus, Resource};
use crate::scheduler::{Scheduler, StatsSnapshot};
use crate::store::ClusterStore;

#[derive(Clone)]
pub struct DashboardState {
    pub store: ClusterStore,
    /// Present when the dashboard runs inside the scheduler process
    pub scheduler: Option<Arc<Scheduler>>,
}

#[derive(Serialize)]
struct JobResponse {
    id: String,
    name: String,
    #[serde(rename = "type")]
    job_type: String,
    command: Vec<String>,
    state: String,
    node_id: Option<String>,
    exit_code: i32,
    error: Option<String>,
    attempts: u32,
    res_req: Resource,
    dependencies: Vec<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            state: job.state().to_string(),
            job_type: job.job_type.to_string(),
            id: job.id,
            name: job.name,
            command: job.spec.command,
            node_id: job.status.node_id,
            exit_code: job.status.exit_code,
            error: job.status.error,
            attempts: job.status.attempts,
            res_req: job.res_req,
            dependencies: job.dependencies,
        }
    }
}

#[derive(Serialize)]
struct NodeResponse {
    id: String,
    ip: String,
    version: String,
    status: String,
    total_cap: Resource,
    allocated: Resource,
    last_heartbeat: i64,
    jobs: Vec<String>,
}

impl From<Node> for NodeResponse {
    fn from(node: Node) -> Self {
        Self {
            status: node.status.to_string(),
            jobs: node.assignments.into_keys().collect(),
            id: node.id,
            ip: node.ip,
            version: node.version,
            total_cap: node.total_cap,
            allocated: node.allocated,
            last_heartbeat: node.last_heartbeat,
        }
    }
}

#[derive(Serialize)]
struct LogResponse {
    job_id: String,
    content: String,
}

#[derive(Serialize)]
struct ClusterStatusResponse {
    /// Job count per state label
    jobs: BTreeMap<String, usize>,
    nodes_ready: usize,
    nodes_offline: usize,
    total_cap: Resource,
    allocated: Resource,
    scheduler: Option<StatsSnapshot>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

struct ApiError(StatusCode, String);

impl From<TitanError> for ApiError {
    fn from(e: TitanError) -> Self {
        let status = match e {
            TitanError::NotFound(_) => StatusCode::NOT_FOUND,
            TitanError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            TitanError::Timeout(_) | TitanError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/cluster", get(cluster_status_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/:id", get(get_job_handler))
        .route("/api/jobs/:id/logs", get(job_logs_handler))
        .route("/api/nodes", get(list_nodes_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the dashboard until `cancel` fires.
pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, cancel: CancellationToken) {
    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn cluster_status_handler(
    State(state): State<DashboardState>,
) -> ApiResult<ClusterStatusResponse> {
    let jobs = state.store.list_jobs().await?;
    let nodes = state.store.list_nodes().await?;

    let mut counts: BTreeMap<String, usize> = [
        JobState::Pending,
        JobState::Scheduled,
        JobState::Running,
        JobState::Success,
        JobState::Failed,
        JobState::Cancelled,
    ]
    .iter()
    .map(|s| (s.to_string(), 0))
    .collect();
    for job in &jobs {
        *counts.entry(job.value.state().to_string()).or_default() += 1;
    }

    let mut total_cap = Resource::zero();
    let mut allocated = Resource::zero();
    let mut nodes_ready = 0;
    for node in nodes.iter().map(|n| &n.value) {
        if node.status == NodeStatus::Ready {
            nodes_ready += 1;
            total_cap = total_cap.checked_add(&node.total_cap).unwrap_or(total_cap);
        }
        allocated = allocated.checked_add(&node.allocated).unwrap_or(allocated);
    }

    Ok(Json(ClusterStatusResponse {
        jobs: counts,
        nodes_ready,
        nodes_offline: nodes.len() - nodes_ready,
        total_cap,
        allocated,
        scheduler: state.scheduler.as_ref().map(|s| s.stats()),
    }))
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> ApiResult<Vec<JobResponse>> {
    let jobs = state.store.list_jobs().await?;
    Ok(Json(jobs.into_iter().map(|j| j.value.into()).collect()))
}

async fn get_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> ApiResult<JobResponse> {
    match state.store.get_job(&id).await? {
        Some(job) => Ok(Json(job.value.into())),
        None => Err(TitanError::NotFound(id).into()),
    }
}

async fn job_logs_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> ApiResult<LogResponse> {
    match state.store.get_log(&id).await? {
        Some(content) => Ok(Json(LogResponse { job_id: id, content })),
        None => Err(TitanError::NotFound(id).into()),
    }
}

async fn list_nodes_handler(State(state): State<DashboardState>) -> ApiResult<Vec<NodeResponse>> {
    let nodes = state.store.list_nodes().await?;
    Ok(Json(nodes.into_iter().map(|n| n.value.into()).collect()))
}
