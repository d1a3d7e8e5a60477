use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use titan::config::SchedulerConfig;
use titan::dashboard::{router, DashboardState};
use titan::model::{Job, JobState, Node, NodeStatus, Resource};
use titan::scheduler::Scheduler;
use titan::store::{ClusterStore, MemoryStore};

fn create_test_app(store: &ClusterStore, with_scheduler: bool) -> Router {
    let scheduler = with_scheduler
        .then(|| Arc::new(Scheduler::new(store.clone(), SchedulerConfig::default())));
    router(DashboardState {
        store: store.clone(),
        scheduler,
    })
}

async fn seeded_store() -> ClusterStore {
    let store = ClusterStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(1));

    let mut node = Node::new("node-1", "10.0.0.1", "v1", Resource::new(4000, 8192));
    assert!(node.reserve("job-2", Resource::new(500, 1024)));
    store.put_node_if(&node, 0).await.unwrap();

    let mut offline = Node::new("node-2", "10.0.0.2", "v1", Resource::new(2000, 4096));
    offline.status = NodeStatus::Offline;
    store.put_node_if(&offline, 0).await.unwrap();

    store
        .create_job(&Job::shell("job-1", "echo one"))
        .await
        .unwrap();
    let mut running = Job::shell("job-2", "sleep 5").with_resources(Resource::new(500, 1024));
    running.status.state = JobState::Running;
    running.status.node_id = Some("node-1".to_string());
    running.status.attempts = 1;
    store.create_job(&running).await.unwrap();

    store.save_log("job-2", "partial output\n").await.unwrap();
    store
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_list_jobs() {
    let store = seeded_store().await;
    let (status, json) = get_json(create_test_app(&store, false), "/api/jobs").await;

    assert_eq!(status, StatusCode::OK);
    let jobs = json.as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["id"], "job-1");
    assert_eq!(jobs[0]["state"], "pending");
    assert_eq!(jobs[0]["type"], "SHELL");
    assert_eq!(jobs[1]["state"], "running");
    assert_eq!(jobs[1]["node_id"], "node-1");
}

#[tokio::test]
async fn test_list_jobs_empty() {
    let store = ClusterStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(1));
    let (status, json) = get_json(create_test_app(&store, false), "/api/jobs").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, Value::Array(vec![]));
}

#[tokio::test]
async fn test_get_job() {
    let store = seeded_store().await;
    let (status, json) = get_json(create_test_app(&store, false), "/api/jobs/job-2").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], "job-2");
    assert_eq!(json["attempts"], 1);
    assert_eq!(json["res_req"]["milli_cpu"], 500);
    assert_eq!(json["command"][2], "sleep 5");
}

#[tokio::test]
async fn test_get_missing_job_is_404() {
    let store = seeded_store().await;
    let (status, json) = get_json(create_test_app(&store, false), "/api/jobs/nope").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn test_job_logs() {
    let store = seeded_store().await;
    let app = create_test_app(&store, false);

    let (status, json) = get_json(app.clone(), "/api/jobs/job-2/logs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["job_id"], "job-2");
    assert_eq!(json["content"], "partial output\n");

    let (status, _) = get_json(app, "/api/jobs/job-1/logs").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_nodes() {
    let store = seeded_store().await;
    let (status, json) = get_json(create_test_app(&store, false), "/api/nodes").await;

    assert_eq!(status, StatusCode::OK);
    let nodes = json.as_array().unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0]["id"], "node-1");
    assert_eq!(nodes[0]["status"], "READY");
    assert_eq!(nodes[0]["allocated"]["memory"], 1024);
    assert_eq!(nodes[0]["jobs"][0], "job-2");
    assert_eq!(nodes[1]["status"], "OFFLINE");
}

#[tokio::test]
async fn test_cluster_status() {
    let store = seeded_store().await;
    let (status, json) = get_json(create_test_app(&store, true), "/api/cluster").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["jobs"]["pending"], 1);
    assert_eq!(json["jobs"]["running"], 1);
    assert_eq!(json["jobs"]["success"], 0);
    assert_eq!(json["nodes_ready"], 1);
    assert_eq!(json["nodes_offline"], 1);
    assert_eq!(json["total_cap"]["milli_cpu"], 4000);
    assert_eq!(json["allocated"]["milli_cpu"], 500);
    assert_eq!(json["scheduler"]["bound"], 0);
}

#[tokio::test]
async fn test_cluster_status_without_scheduler() {
    let store = seeded_store().await;
    let (status, json) = get_json(create_test_app(&store, false), "/api/cluster").await;

    assert_eq!(status, StatusCode::OK);
    assert!(json["scheduler"].is_null());
}
