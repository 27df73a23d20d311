use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use civicscan_common::{JobStatus, NewJob};
use civicscan_store::ResearchStore;

use super::{JobHandle, QueueBackend, QueueError, QueueGateway};
use crate::lifecycle::JobLifecycleManager;

/// Durable-store fallback queue. The job row is the queue entry; execution
/// starts on the next scheduler tick inside this process.
pub struct StoreQueue {
    store: Arc<dyn ResearchStore>,
    lifecycle: Arc<JobLifecycleManager>,
    in_flight: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl StoreQueue {
    pub fn new(store: Arc<dyn ResearchStore>, lifecycle: Arc<JobLifecycleManager>) -> Self {
        Self {
            store,
            lifecycle,
            in_flight: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Executions spawned and not yet reaped.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

#[async_trait]
impl QueueGateway for StoreQueue {
    fn backend(&self) -> QueueBackend {
        QueueBackend::Store
    }

    async fn add_job(&self, job: NewJob) -> Result<JobHandle, QueueError> {
        // `closed` is only flipped under this lock, so a job either lands in
        // the set `close` drains or is refused before its row exists.
        let mut in_flight = self.in_flight.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        let signature = job.scope.signature();
        let Some(row) = self.store.insert_job(&job).await? else {
            return Err(QueueError::ScopeTaken(signature));
        };

        let lifecycle = self.lifecycle.clone();
        let job_id = row.id;
        // Reap finished executions so the set doesn't grow unbounded.
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            tokio::task::yield_now().await;
            if let Err(e) = lifecycle.execute(job_id).await {
                warn!(job_id = %job_id, error = %e, "Job execution aborted");
                if let Err(e) = lifecycle.abandon(job_id, &format!("{e:#}")).await {
                    error!(job_id = %job_id, error = %e, "Could not release aborted job");
                }
            }
        });

        debug!(job_id = %job_id, scope = %row.scope, "Job dispatched in-process");
        Ok(JobHandle::from(&row))
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobHandle>, QueueError> {
        let job = self.store.get_job(id).await?;
        Ok(job.as_ref().map(JobHandle::from))
    }

    async fn get_jobs_by_status(
        &self,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobHandle>, QueueError> {
        let jobs = self.store.jobs_by_status(statuses).await?;
        Ok(jobs.iter().map(JobHandle::from).collect())
    }

    async fn close(&self) {
        let mut in_flight = {
            let mut guard = self.in_flight.lock().await;
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *guard)
        };
        let pending = in_flight.len();
        if pending > 0 {
            info!(pending, "Waiting for in-flight jobs to finish");
        }
        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "In-flight job task ended abnormally");
            }
        }
    }
}
