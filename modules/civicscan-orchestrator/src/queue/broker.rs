//! Typed client for the message broker's HTTP API, and the broker-backed gateway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use civicscan_common::{JobStatus, NewJob, Scope};
use civicscan_store::ResearchStore;

use super::status::{broker_states_for, canonical_status};
use super::{JobHandle, JobPayload, QueueBackend, QueueError, QueueGateway};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker error (HTTP {status}): {body}")]
    Http { status: u16, body: String },

    #[error("Broker unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
}

/// A job as stored by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerJob {
    pub id: String,
    pub name: String,
    pub data: JobPayload,
    pub state: String,
    #[serde(default)]
    pub failed_reason: Option<String>,
}

impl BrokerJob {
    pub fn status(&self) -> JobStatus {
        canonical_status(&self.state)
    }

    fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.data.job_id,
            name: self.name.clone(),
            scope: Scope::new(&self.data.jurisdictions, &self.data.data_types),
            status: self.status(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddJobRequest<'a> {
    name: &'a str,
    data: &'a JobPayload,
    opts: AddJobOptions,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddJobOptions {
    job_id: String,
}

/// Client for one named broker queue.
///
/// Reuses a single `reqwest::Client` for connection pooling.
#[derive(Clone)]
pub struct BrokerClient {
    http: Client,
    base_url: String,
    queue: String,
}

impl BrokerClient {
    pub fn new(base_url: &str, queue: &str) -> Result<Self, BrokerError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            queue: queue.to_string(),
        })
    }

    fn queue_url(&self, suffix: &str) -> String {
        format!("{}/queues/{}{suffix}", self.base_url, self.queue)
    }

    /// Connectivity probe bounded by `timeout`.
    pub async fn health(&self, timeout: Duration) -> Result<(), BrokerError> {
        let url = format!("{}/health", self.base_url);
        let resp = self.http.get(&url).timeout(timeout).send().await?;
        check(resp).await.map(|_| ())
    }

    pub async fn add(&self, name: &str, payload: &JobPayload) -> Result<BrokerJob, BrokerError> {
        let url = self.queue_url("/jobs");
        info!(url = url.as_str(), job_id = %payload.job_id, "Adding job to broker");

        let body = AddJobRequest {
            name,
            data: payload,
            opts: AddJobOptions {
                job_id: payload.job_id.to_string(),
            },
        };
        let resp = self.http.post(&url).json(&body).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<BrokerJob>, BrokerError> {
        let resp = self
            .http
            .get(self.queue_url(&format!("/jobs/{id}")))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(resp).await?.json().await?))
    }

    pub async fn list(&self, states: &[&str]) -> Result<Vec<BrokerJob>, BrokerError> {
        let resp = self
            .http
            .get(self.queue_url("/jobs"))
            .query(&[("states", states.join(","))])
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    /// Take the next waiting job, moving it to `active`. `None` when the queue is empty.
    pub async fn claim(&self) -> Result<Option<BrokerJob>, BrokerError> {
        let resp = self.http.post(self.queue_url("/claim")).send().await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(check(resp).await?.json().await?))
    }

    pub async fn complete(&self, id: &str, result: serde_json::Value) -> Result<(), BrokerError> {
        let resp = self
            .http
            .post(self.queue_url(&format!("/jobs/{id}/complete")))
            .json(&serde_json::json!({ "result": result }))
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }

    pub async fn fail(&self, id: &str, reason: &str) -> Result<(), BrokerError> {
        let resp = self
            .http
            .post(self.queue_url(&format!("/jobs/{id}/fail")))
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }
}

async fn check(resp: Response) -> Result<Response, BrokerError> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(BrokerError::Http { status, body })
    }
}

// ---------------------------------------------------------------------------
// BrokerQueue
// ---------------------------------------------------------------------------

/// Broker-backed gateway. Job rows are still written to the store so results
/// linking and job listings behave the same under either backend.
pub struct BrokerQueue {
    client: BrokerClient,
    store: Arc<dyn ResearchStore>,
    closed: AtomicBool,
}

impl BrokerQueue {
    pub fn new(client: BrokerClient, store: Arc<dyn ResearchStore>) -> Self {
        Self {
            client,
            store,
            closed: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &BrokerClient {
        &self.client
    }
}

#[async_trait]
impl QueueGateway for BrokerQueue {
    fn backend(&self) -> QueueBackend {
        QueueBackend::Broker
    }

    async fn add_job(&self, job: NewJob) -> Result<JobHandle, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        let signature = job.scope.signature();
        let Some(row) = self.store.insert_job(&job).await? else {
            return Err(QueueError::ScopeTaken(signature));
        };

        match self.client.add(&row.name, &JobPayload::from(&row)).await {
            Ok(broker_job) => Ok(broker_job.handle()),
            Err(e) => {
                // The row exists, so the job was accepted; surface the refusal through it.
                warn!(job_id = %row.id, error = %e, "Broker refused job");
                let now = Utc::now();
                self.store.mark_job_running(row.id, now).await?;
                self.store
                    .mark_job_failed(row.id, now, &format!("broker dispatch failed: {e}"))
                    .await?;
                Ok(JobHandle {
                    status: JobStatus::Failed,
                    ..JobHandle::from(&row)
                })
            }
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobHandle>, QueueError> {
        let job = self.store.get_job(id).await?;
        if let Some(job) = job.as_ref().filter(|j| j.status.is_terminal()) {
            return Ok(Some(JobHandle::from(job)));
        }
        match self.client.get(id).await {
            Ok(Some(broker_job)) => return Ok(Some(broker_job.handle())),
            Ok(None) => {}
            Err(e) => warn!(job_id = %id, error = %e, "Broker lookup failed, reading job row"),
        }
        Ok(job.as_ref().map(JobHandle::from))
    }

    /// Broker view merged over job rows. A terminal row always wins, since
    /// the worker records it before acknowledging the broker; otherwise the
    /// broker wins for jobs it knows and rows cover jobs it never received.
    async fn get_jobs_by_status(
        &self,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobHandle>, QueueError> {
        let mut handles: HashMap<Uuid, JobHandle> = self
            .store
            .jobs_by_status(statuses)
            .await?
            .iter()
            .map(|job| (job.id, JobHandle::from(job)))
            .collect();

        let broker_jobs = match self.client.list(&broker_states_for(statuses)).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Broker listing failed, using job rows only");
                return Ok(handles.into_values().collect());
            }
        };

        for broker_job in broker_jobs {
            let handle = broker_job.handle();
            let row_status = match handles.get(&handle.id) {
                Some(known) => Some(known.status),
                None => self.store.get_job(handle.id).await?.map(|j| j.status),
            };

            if row_status.is_some_and(|s| s.is_terminal()) {
                if row_status != Some(handle.status) {
                    debug!(
                        job_id = %handle.id,
                        broker_state = broker_job.state.as_str(),
                        "Broker lags a finished job row, keeping the row"
                    );
                }
                continue;
            }

            if statuses.contains(&handle.status) {
                handles.insert(handle.id, handle);
            } else {
                handles.remove(&handle.id);
            }
        }

        Ok(handles.into_values().collect())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        info!(queue = self.client.queue.as_str(), "Broker queue closed");
    }
}
