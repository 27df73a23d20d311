//! Broker backend against an in-process mock broker on an ephemeral port.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use civicscan_common::{CivicScanError, Config, Depth, JobStatus, OverlapPolicy};
use civicscan_orchestrator::testing::{candidate, MockResearcher};
use civicscan_orchestrator::{
    connect_queue, BrokerClient, BrokerWorker, JobLifecycleManager, Orchestrator, QueueBackend,
    QueueGateway, SubmitRequest,
};
use civicscan_store::MemoryStore;

// ---------------------------------------------------------------------------
// Mock broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MockJob {
    id: String,
    name: String,
    data: Value,
    state: String,
    failed_reason: Option<String>,
    result: Option<Value>,
}

impl MockJob {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "data": self.data,
            "state": self.state,
            "failedReason": self.failed_reason,
        })
    }
}

#[derive(Default)]
struct MockBroker {
    jobs: Mutex<Vec<MockJob>>,
    refuse_jobs: AtomicBool,
}

impl MockBroker {
    fn job(&self, id: &str) -> Option<MockJob> {
        self.jobs.lock().unwrap().iter().find(|j| j.id == id).cloned()
    }

    fn set_state(&self, id: &str, state: &str) {
        if let Some(job) = self.jobs.lock().unwrap().iter_mut().find(|j| j.id == id) {
            job.state = state.to_string();
        }
    }
}

type Shared = Arc<MockBroker>;

#[derive(Deserialize)]
struct AddJob {
    name: String,
    data: Value,
    opts: AddOpts,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddOpts {
    job_id: String,
}

#[derive(Deserialize)]
struct StatesQuery {
    states: String,
}

#[derive(Deserialize)]
struct FailBody {
    reason: String,
}

#[derive(Deserialize)]
struct CompleteBody {
    result: Value,
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn add_job(
    State(broker): State<Shared>,
    Path(_queue): Path<String>,
    Json(body): Json<AddJob>,
) -> Response {
    if broker.refuse_jobs.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "queue paused for maintenance").into_response();
    }
    let job = MockJob {
        id: body.opts.job_id,
        name: body.name,
        data: body.data,
        state: "waiting".to_string(),
        failed_reason: None,
        result: None,
    };
    let out = job.to_json();
    broker.jobs.lock().unwrap().push(job);
    Json(out).into_response()
}

async fn list_jobs(
    State(broker): State<Shared>,
    Path(_queue): Path<String>,
    Query(query): Query<StatesQuery>,
) -> Json<Vec<Value>> {
    let states: Vec<&str> = query.states.split(',').collect();
    let jobs = broker.jobs.lock().unwrap();
    Json(
        jobs.iter()
            .filter(|j| states.contains(&j.state.as_str()))
            .map(MockJob::to_json)
            .collect(),
    )
}

async fn get_job(
    State(broker): State<Shared>,
    Path((_queue, id)): Path<(String, String)>,
) -> Response {
    match broker.job(&id) {
        Some(job) => Json(job.to_json()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn claim(State(broker): State<Shared>, Path(_queue): Path<String>) -> Response {
    let mut jobs = broker.jobs.lock().unwrap();
    match jobs.iter_mut().find(|j| j.state == "waiting") {
        Some(job) => {
            job.state = "active".to_string();
            Json(job.to_json()).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn complete(
    State(broker): State<Shared>,
    Path((_queue, id)): Path<(String, String)>,
    Json(body): Json<CompleteBody>,
) -> StatusCode {
    let mut jobs = broker.jobs.lock().unwrap();
    match jobs.iter_mut().find(|j| j.id == id) {
        Some(job) => {
            job.state = "completed".to_string();
            job.result = Some(body.result);
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn fail(
    State(broker): State<Shared>,
    Path((_queue, id)): Path<(String, String)>,
    Json(body): Json<FailBody>,
) -> StatusCode {
    let mut jobs = broker.jobs.lock().unwrap();
    match jobs.iter_mut().find(|j| j.id == id) {
        Some(job) => {
            job.state = "failed".to_string();
            job.failed_reason = Some(body.reason);
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn spawn_mock_broker() -> (Shared, SocketAddr) {
    let broker: Shared = Arc::new(MockBroker::default());
    let app = Router::new()
        .route("/health", get(health))
        .route("/queues/{queue}/jobs", post(add_job).get(list_jobs))
        .route("/queues/{queue}/jobs/{id}", get(get_job))
        .route("/queues/{queue}/claim", post(claim))
        .route("/queues/{queue}/jobs/{id}/complete", post(complete))
        .route("/queues/{queue}/jobs/{id}/fail", post(fail))
        .with_state(broker.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (broker, addr)
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct BrokerSetup {
    broker: Shared,
    store: Arc<MemoryStore>,
    researcher: Arc<MockResearcher>,
    lifecycle: Arc<JobLifecycleManager>,
    orchestrator: Orchestrator,
    client: BrokerClient,
}

async fn setup(researcher: MockResearcher) -> BrokerSetup {
    let (broker, addr) = spawn_mock_broker().await;
    let store = Arc::new(MemoryStore::new());
    let researcher = Arc::new(researcher);
    let lifecycle = Arc::new(JobLifecycleManager::new(
        store.clone(),
        researcher.clone(),
        Duration::from_secs(2),
    ));

    let config = Config {
        broker_url: Some(format!("http://{addr}")),
        broker_probe_timeout: Duration::from_secs(2),
        ..Config::default()
    };
    let queue = connect_queue(&config, store.clone(), lifecycle.clone()).await;
    assert_eq!(queue.backend(), QueueBackend::Broker);

    let client = BrokerClient::new(&format!("http://{addr}"), &config.broker_queue).unwrap();
    let orchestrator = Orchestrator::new(store.clone(), queue, OverlapPolicy::Exact, 60);

    BrokerSetup {
        broker,
        store,
        researcher,
        lifecycle,
        orchestrator,
        client,
    }
}

fn ca_request() -> SubmitRequest {
    SubmitRequest {
        jurisdictions: vec!["CA".to_string()],
        data_types: vec!["emissions".to_string()],
        depth: Depth::Summary,
    }
}

async fn wait_for_status(orchestrator: &Orchestrator, id: uuid::Uuid, want: JobStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = orchestrator.get_job(id).await.unwrap().unwrap();
        if job.status == want {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("job {id} stuck at {:?}, wanted {want:?}", job.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broker_job_runs_through_worker_and_is_acknowledged() {
    let s = setup(
        MockResearcher::new().on("CA", vec![candidate("CA", "emissions", "Cap-and-Trade Program")]),
    )
    .await;

    let ids = s.orchestrator.submit_job(&ca_request()).await.unwrap();
    let id = ids[0];

    let handle = s.orchestrator.queue().get_job(id).await.unwrap().unwrap();
    assert_eq!(handle.status, JobStatus::Queued);
    assert_eq!(s.broker.job(&id.to_string()).unwrap().state, "waiting");

    // Still waiting in the broker, so the same scope is rejected.
    assert!(matches!(
        s.orchestrator.submit_job(&ca_request()).await,
        Err(CivicScanError::Conflict { .. })
    ));

    let (stop, stopped) = watch::channel(false);
    let worker = BrokerWorker::new(
        s.client.clone(),
        s.lifecycle.clone(),
        2,
        Duration::from_millis(20),
    );
    let worker_task = tokio::spawn(async move { worker.run(stopped).await });

    wait_for_status(&s.orchestrator, id, JobStatus::Succeeded).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while s.broker.job(&id.to_string()).unwrap().state != "completed" {
        assert!(tokio::time::Instant::now() < deadline, "broker never saw completion");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let acked = s.broker.job(&id.to_string()).unwrap();
    assert_eq!(acked.result.unwrap()["resultCount"], 1);

    let handle = s.orchestrator.queue().get_job(id).await.unwrap().unwrap();
    assert_eq!(handle.status, JobStatus::Succeeded);

    stop.send(true).unwrap();
    worker_task.await.unwrap();
}

#[tokio::test]
async fn failed_research_is_reported_to_the_broker() {
    let s = setup(MockResearcher::new().fail_on("CA", "portal offline")).await;

    let id = s.orchestrator.submit_job(&ca_request()).await.unwrap()[0];

    let (stop, stopped) = watch::channel(false);
    let worker = BrokerWorker::new(s.client.clone(), s.lifecycle.clone(), 1, Duration::from_millis(20));
    let worker_task = tokio::spawn(async move { worker.run(stopped).await });

    wait_for_status(&s.orchestrator, id, JobStatus::Failed).await;
    stop.send(true).unwrap();
    worker_task.await.unwrap();

    let job = s.broker.job(&id.to_string()).unwrap();
    assert_eq!(job.state, "failed");
    assert!(job.failed_reason.unwrap().contains("portal offline"));
}

#[tokio::test]
async fn redelivered_job_is_not_rerun() {
    let s = setup(
        MockResearcher::new().on("CA", vec![candidate("CA", "emissions", "Cap-and-Trade Program")]),
    )
    .await;
    let id = s.orchestrator.submit_job(&ca_request()).await.unwrap()[0];

    let (stop, stopped) = watch::channel(false);
    let worker = BrokerWorker::new(s.client.clone(), s.lifecycle.clone(), 1, Duration::from_millis(20));
    let worker_task = tokio::spawn(async move { worker.run(stopped).await });

    wait_for_status(&s.orchestrator, id, JobStatus::Succeeded).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while s.broker.job(&id.to_string()).unwrap().state != "completed" {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Broker hands the same job out again.
    s.broker.set_state(&id.to_string(), "waiting");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while s.broker.job(&id.to_string()).unwrap().state != "completed" {
        assert!(tokio::time::Instant::now() < deadline, "redelivery never acknowledged");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    stop.send(true).unwrap();
    worker_task.await.unwrap();

    assert_eq!(s.researcher.calls(), 1);
    assert_eq!(s.store.all_jobs()[0].status, JobStatus::Succeeded);
}

#[tokio::test]
async fn broker_refusal_fails_the_accepted_job() {
    let s = setup(MockResearcher::new()).await;
    s.broker.refuse_jobs.store(true, Ordering::SeqCst);

    let id = s.orchestrator.submit_job(&ca_request()).await.unwrap()[0];

    let job = s.orchestrator.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.started_at.is_some());
    assert!(job
        .error_message
        .unwrap()
        .starts_with("broker dispatch failed"));

    // The failed job holds no scope; a retry is admitted once the broker recovers.
    s.broker.refuse_jobs.store(false, Ordering::SeqCst);
    assert!(s.orchestrator.submit_job(&ca_request()).await.is_ok());
}

#[tokio::test]
async fn finished_row_releases_scope_when_broker_ack_is_lost() {
    let s = setup(
        MockResearcher::new().on("CA", vec![candidate("CA", "emissions", "Cap-and-Trade Program")]),
    )
    .await;
    let id = s.orchestrator.submit_job(&ca_request()).await.unwrap()[0];

    // Claimed by a worker that finished the job but never acknowledged it.
    s.broker.set_state(&id.to_string(), "active");
    s.lifecycle.execute(id).await.unwrap();
    assert_eq!(s.broker.job(&id.to_string()).unwrap().state, "active");

    let handle = s.orchestrator.queue().get_job(id).await.unwrap().unwrap();
    assert_eq!(handle.status, JobStatus::Succeeded);

    let active = s
        .orchestrator
        .queue()
        .get_jobs_by_status(&JobStatus::ACTIVE)
        .await
        .unwrap();
    assert!(active.iter().all(|h| h.id != id));

    let retry = s.orchestrator.submit_job(&ca_request()).await.unwrap();
    assert_ne!(retry[0], id);
}

#[tokio::test]
async fn broker_state_still_wins_over_a_queued_row() {
    let s = setup(MockResearcher::new()).await;
    let id = s.orchestrator.submit_job(&ca_request()).await.unwrap()[0];

    s.broker.set_state(&id.to_string(), "active");

    let handle = s.orchestrator.queue().get_job(id).await.unwrap().unwrap();
    assert_eq!(handle.status, JobStatus::Running);

    let running = s
        .orchestrator
        .queue()
        .get_jobs_by_status(&[JobStatus::Running])
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, id);
}
