use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};

use cloudtasker_api::app::{build_app, services::AppServices};
use cloudtasker_events::{InMemoryMessageBus, MessageBus};
use cloudtasker_infra::jobs::{TaskWorker, TaskWorkerConfig, TaskWorkerHandle, default_handler};
use cloudtasker_infra::{InMemoryStore, Relay, RelayConfig, RelayHandle, Store, TaskService};

struct TestServer {
    base_url: String,
    store: InMemoryStore,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with_store(InMemoryStore::new()).await
    }

    async fn spawn_with_store(store: InMemoryStore) -> Self {
        // Same router as prod, bound to an ephemeral port.
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let services = Arc::new(AppServices::new(shared, Duration::from_secs(5)));
        let app = build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            store,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Relay plus one worker over an in-process bus, sharing the server's store.
fn spawn_pipeline(store: &InMemoryStore) -> (RelayHandle, TaskWorkerHandle) {
    let bus = Arc::new(InMemoryMessageBus::new());
    let subscription = bus.subscribe();

    let relay = Relay::new(
        store.clone(),
        bus,
        RelayConfig::default().with_poll_interval(Duration::from_millis(10)),
    )
    .spawn();

    let worker = TaskWorker::new(
        Arc::new(TaskService::new(store.clone())),
        TaskWorkerConfig::default().with_name("test-worker"),
        default_handler,
    )
    .spawn(subscription);

    (relay, worker)
}

async fn create_task(client: &reqwest::Client, server: &TestServer, payload: Value) -> i64 {
    let res = client
        .post(server.url("/task"))
        .json(&json!({ "payload": payload }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "PENDING");
    body["job_id"].as_i64().expect("job_id should be a number")
}

async fn get_task_eventually(
    client: &reqwest::Client,
    server: &TestServer,
    job_id: i64,
    status: &str,
) -> Value {
    // Dispatch is asynchronous; poll briefly until the worker catches up.
    for _ in 0..200 {
        let res = client
            .get(server.url(&format!("/task/{job_id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = res.json().await.unwrap();
        if body["status"] == status {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("task {job_id} did not reach {status} within timeout");
}

#[tokio::test]
async fn health_reports_healthy() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body, json!({ "status": "healthy" }));
}

#[tokio::test]
async fn create_then_get_returns_pending_task() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let job_id = create_task(&client, &server, json!({ "type": "process_data" })).await;

    let res = client
        .get(server.url(&format!("/task/{job_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["job_id"], job_id);
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["result"], Value::Null);
    assert!(body["created_at"].as_str().unwrap().ends_with('Z'));

    assert_eq!(server.store.job_count().await, 1);
    assert_eq!(server.store.outbox_len().await, 1);
}

#[tokio::test]
async fn missing_payload_is_rejected_without_writes() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for body in [json!({}), json!({ "payload": "" }), json!({ "payload": null })] {
        let res = client
            .post(server.url("/task"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let err: Value = res.json().await.unwrap();
        assert_eq!(err["message"], "No payload provided");
    }

    let res = client
        .post(server.url("/task"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    assert_eq!(server.store.job_count().await, 0);
    assert_eq!(server.store.outbox_len().await, 0);
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(server.url("/task/999")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.get(server.url("/task/abc")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(server.url("/task/999/status"))
        .json(&json!({ "status": "RUNNING" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_updates_follow_the_lifecycle() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let job_id = create_task(&client, &server, json!("work")).await;
    let status_url = server.url(&format!("/task/{job_id}/status"));

    // Skipping ahead is a conflict and leaves the job alone.
    let res = client
        .post(&status_url)
        .json(&json!({ "status": "SUCCEEDED", "result": "too early" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = client
        .post(&status_url)
        .json(&json!({ "status": "bogus" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    for status in ["DISPATCHED", "RUNNING"] {
        let res = client
            .post(&status_url)
            .json(&json!({ "status": status }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["status"], status);
    }

    let res = client
        .post(&status_url)
        .json(&json!({ "status": "FAILED", "result": { "error": "boom" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .get(server.url(&format!("/task/{job_id}")))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "FAILED");
    assert_eq!(body["result"], r#"{"error":"boom"}"#);

    // Terminal states are final.
    let res = client
        .post(&status_url)
        .json(&json!({ "status": "RUNNING" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn tasks_flow_through_relay_and_worker() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let (relay, worker) = spawn_pipeline(&server.store);

    let first = create_task(&client, &server, json!("alpha")).await;
    let second = create_task(&client, &server, json!({ "n": 2 })).await;

    for job_id in [first, second] {
        let body = get_task_eventually(&client, &server, job_id, "SUCCEEDED").await;
        let result: Value = serde_json::from_str(body["result"].as_str().unwrap()).unwrap();
        assert_eq!(result["status"], "success");
    }

    assert!(relay.stats().published >= 2);
    relay.shutdown().await;
    worker.shutdown().await;
}

#[tokio::test]
async fn store_outage_maps_to_service_unavailable() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    server.store.set_unavailable(true);
    let res = client
        .post(server.url("/task"))
        .json(&json!({ "payload": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    server.store.set_unavailable(false);
    assert_eq!(server.store.job_count().await, 0);
}

#[tokio::test]
async fn request_deadline_rolls_back_and_maps_to_gateway_timeout() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    server.store.set_commit_delay(Duration::from_millis(500));
    let res = client
        .post(server.url("/task"))
        .header("x-request-timeout-ms", "20")
        .json(&json!({ "payload": "slow" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);

    server.store.set_commit_delay(Duration::ZERO);
    assert_eq!(server.store.job_count().await, 0);
    assert_eq!(server.store.outbox_len().await, 0);
}
