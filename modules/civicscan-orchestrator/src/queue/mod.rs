//! Queue gateway: one job-dispatch contract, two backends.
//!
//! `connect_queue` probes the broker once at startup. A reachable broker gets
//! a `BrokerQueue`; anything else gets a `StoreQueue` for the rest of the
//! process lifetime.

pub mod broker;
pub mod status;
pub mod store_backed;
pub mod worker;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use civicscan_common::{Config, Depth, Job, JobStatus, NewJob, Scope};
use civicscan_store::ResearchStore;

use crate::lifecycle::JobLifecycleManager;

pub use broker::{BrokerClient, BrokerError, BrokerJob, BrokerQueue};
pub use store_backed::StoreQueue;
pub use worker::BrokerWorker;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue is closed")]
    Closed,

    #[error("An active job already holds scope {0}")]
    ScopeTaken(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Broker,
    Store,
}

impl QueueBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueBackend::Broker => "broker",
            QueueBackend::Store => "store",
        }
    }
}

/// Job data carried through the queue. The broker job id equals `job_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub job_id: Uuid,
    pub jurisdictions: Vec<String>,
    pub data_types: Vec<String>,
    pub depth: Depth,
}

impl From<&Job> for JobPayload {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            jurisdictions: job.scope.jurisdictions.clone(),
            data_types: job.scope.data_types.clone(),
            depth: job.depth,
        }
    }
}

/// A job as seen through the gateway, in canonical vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub id: Uuid,
    pub name: String,
    pub scope: Scope,
    pub status: JobStatus,
}

impl From<&Job> for JobHandle {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            scope: job.scope.clone(),
            status: job.status,
        }
    }
}

#[async_trait]
pub trait QueueGateway: Send + Sync {
    fn backend(&self) -> QueueBackend;

    /// Persist the job row as queued and dispatch it. Never waits for execution.
    async fn add_job(&self, job: NewJob) -> Result<JobHandle, QueueError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<JobHandle>, QueueError>;

    async fn get_jobs_by_status(&self, statuses: &[JobStatus])
        -> Result<Vec<JobHandle>, QueueError>;

    /// Stop accepting jobs and release backend resources.
    async fn close(&self);
}

/// Probe the configured broker and pick a backend. Never fails: an absent or
/// unreachable broker selects the durable-store fallback.
pub async fn connect_queue(
    config: &Config,
    store: Arc<dyn ResearchStore>,
    lifecycle: Arc<JobLifecycleManager>,
) -> Arc<dyn QueueGateway> {
    let Some(broker_url) = config.broker_url.as_deref() else {
        info!(backend = "store", "No broker configured, using durable-store queue");
        return Arc::new(StoreQueue::new(store, lifecycle));
    };

    match probe_broker(broker_url, &config.broker_queue, config.broker_probe_timeout).await {
        Ok(client) => {
            info!(backend = "broker", queue = config.broker_queue.as_str(), "Broker reachable");
            Arc::new(BrokerQueue::new(client, store))
        }
        Err(e) => {
            warn!(backend = "store", error = %e, "Falling back to durable-store queue");
            Arc::new(StoreQueue::new(store, lifecycle))
        }
    }
}

async fn probe_broker(
    url: &str,
    queue: &str,
    timeout: std::time::Duration,
) -> Result<BrokerClient, QueueError> {
    let client = BrokerClient::new(url, queue)
        .map_err(|e| QueueError::Unavailable(e.to_string()))?;
    client
        .health(timeout)
        .await
        .map_err(|e| QueueError::Unavailable(e.to_string()))?;
    Ok(client)
}
