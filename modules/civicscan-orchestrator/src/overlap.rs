use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use civicscan_common::{CivicScanError, CivicScanResult, JobStatus, OverlapPolicy, Scope};

use crate::queue::QueueGateway;

/// Rejects submissions whose scope conflicts with a queued or running job.
///
/// Admission holds an in-process lock until the caller drops the returned
/// guard, so check-then-enqueue is atomic within this process. The store's
/// active-scope index covers other processes.
pub struct OverlapGuard {
    queue: Arc<dyn QueueGateway>,
    policy: OverlapPolicy,
    gate: Mutex<()>,
}

impl OverlapGuard {
    pub fn new(queue: Arc<dyn QueueGateway>, policy: OverlapPolicy) -> Self {
        Self {
            queue,
            policy,
            gate: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    /// Check every requested scope against active jobs. All pass or none do.
    pub async fn admit(&self, requested: &[Scope]) -> CivicScanResult<MutexGuard<'_, ()>> {
        let gate = self.gate.lock().await;

        let active = self
            .queue
            .get_jobs_by_status(&JobStatus::ACTIVE)
            .await
            .map_err(|e| CivicScanError::Anyhow(e.into()))?;

        for scope in requested {
            if let Some(existing) = active
                .iter()
                .find(|job| scope.conflicts_with(&job.scope, self.policy))
            {
                info!(
                    requested = %scope,
                    existing = %existing.scope,
                    job_id = %existing.id,
                    "Submission rejected: overlapping active job"
                );
                return Err(CivicScanError::Conflict {
                    requested: scope.signature(),
                    existing: existing.scope.signature(),
                    job_id: existing.id,
                });
            }
        }

        Ok(gate)
    }
}
