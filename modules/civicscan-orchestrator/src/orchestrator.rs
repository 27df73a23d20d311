//! Caller-facing orchestration API: submission, job queries, results, deltas.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use civicscan_common::stable_key::{normalize_jurisdiction, normalize_type};
use civicscan_common::{
    ChangeRecord, CivicScanError, CivicScanResult, Depth, JobFilter, JobStatus, JobSummary,
    JobTrigger, NewJob, OverlapPolicy, Program, ResultFilter, Schedule, Scope,
};
use civicscan_store::ResearchStore;

use crate::overlap::OverlapGuard;
use crate::queue::{QueueError, QueueGateway};
use crate::scheduling::JobSubmitter;

/// A request to research one or more jurisdictions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(alias = "states", alias = "scopes")]
    pub jurisdictions: Vec<String>,
    pub data_types: Vec<String>,
    #[serde(default)]
    pub depth: Depth,
}

/// Validate raw jurisdiction and data-type lists and split them into one
/// scope per jurisdiction.
pub fn validate_scopes(
    jurisdictions: &[String],
    data_types: &[String],
    max_jurisdictions: usize,
) -> CivicScanResult<Vec<Scope>> {
    if jurisdictions.is_empty() {
        return Err(CivicScanError::validation("at least one jurisdiction is required"));
    }
    if data_types.is_empty() {
        return Err(CivicScanError::validation("at least one data type is required"));
    }
    if jurisdictions.iter().any(|j| j.trim().is_empty()) {
        return Err(CivicScanError::validation("jurisdiction codes must not be blank"));
    }
    if data_types.iter().any(|d| d.trim().is_empty()) {
        return Err(CivicScanError::validation("data types must not be blank"));
    }

    let all = Scope::new(jurisdictions, data_types);
    if all.jurisdictions.len() > max_jurisdictions {
        return Err(CivicScanError::validation(format!(
            "at most {max_jurisdictions} jurisdictions per submission, got {}",
            all.jurisdictions.len()
        )));
    }

    Ok(all
        .jurisdictions
        .iter()
        .map(|j| Scope::single(j, &all.data_types))
        .collect())
}

pub struct Orchestrator {
    store: Arc<dyn ResearchStore>,
    queue: Arc<dyn QueueGateway>,
    overlap: OverlapGuard,
    max_jurisdictions: usize,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ResearchStore>,
        queue: Arc<dyn QueueGateway>,
        policy: OverlapPolicy,
        max_jurisdictions: usize,
    ) -> Self {
        Self {
            store,
            overlap: OverlapGuard::new(queue.clone(), policy),
            queue,
            max_jurisdictions,
        }
    }

    pub fn queue(&self) -> &Arc<dyn QueueGateway> {
        &self.queue
    }

    pub fn max_jurisdictions(&self) -> usize {
        self.max_jurisdictions
    }

    /// One job per jurisdiction. Either every job is enqueued or the whole
    /// submission is rejected before anything is written.
    pub async fn submit_job(&self, request: &SubmitRequest) -> CivicScanResult<Vec<Uuid>> {
        self.submit(
            &request.jurisdictions,
            &request.data_types,
            request.depth,
            JobTrigger::Manual,
            None,
        )
        .await
    }

    async fn submit(
        &self,
        jurisdictions: &[String],
        data_types: &[String],
        depth: Depth,
        trigger: JobTrigger,
        schedule_id: Option<Uuid>,
    ) -> CivicScanResult<Vec<Uuid>> {
        let scopes = validate_scopes(jurisdictions, data_types, self.max_jurisdictions)?;
        let _admitted = self.overlap.admit(&scopes).await?;

        let mut ids = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let job = NewJob {
                name: format!("research:{}", scope.jurisdictions.join(",")),
                scope,
                depth,
                trigger,
                schedule_id,
            };
            match self.queue.add_job(job).await {
                Ok(handle) => ids.push(handle.id),
                Err(QueueError::ScopeTaken(signature)) => {
                    return Err(self.conflict_for(signature).await);
                }
                Err(e) => return Err(CivicScanError::Anyhow(e.into())),
            }
        }

        info!(
            job_count = ids.len(),
            trigger = trigger.as_str(),
            backend = self.queue.backend().as_str(),
            "Submission accepted"
        );
        Ok(ids)
    }

    /// Another process took the scope between admission and insert.
    async fn conflict_for(&self, signature: String) -> CivicScanError {
        let holder = match self.store.jobs_by_status(&JobStatus::ACTIVE).await {
            Ok(jobs) => jobs.into_iter().find(|j| j.scope.signature() == signature),
            Err(e) => return CivicScanError::Anyhow(e),
        };
        match holder {
            Some(job) => CivicScanError::Conflict {
                requested: signature.clone(),
                existing: signature,
                job_id: job.id,
            },
            None => CivicScanError::Anyhow(anyhow::anyhow!(
                "scope {signature} was taken but no active job holds it"
            )),
        }
    }

    pub async fn get_jobs(&self, filter: &JobFilter) -> CivicScanResult<Vec<JobSummary>> {
        let jobs = self.store.list_jobs(filter).await?;
        Ok(jobs.into_iter().map(JobSummary::from).collect())
    }

    pub async fn get_job(&self, id: Uuid) -> CivicScanResult<Option<JobSummary>> {
        let job = self.store.get_job(id).await?;
        Ok(job.map(JobSummary::from))
    }

    /// Programs matching every set filter field.
    pub async fn get_results(&self, filter: &ResultFilter) -> CivicScanResult<Vec<Program>> {
        let filter = ResultFilter {
            jurisdiction: filter.jurisdiction.as_deref().map(normalize_jurisdiction),
            program_type: filter.program_type.as_deref().map(normalize_type),
            job_id: filter.job_id,
            since: filter.since,
        };
        Ok(self.store.list_programs(&filter).await?)
    }

    pub async fn get_deltas(&self, since: DateTime<Utc>) -> CivicScanResult<Vec<ChangeRecord>> {
        Ok(self.store.changes_since(since).await?)
    }

    /// Stop accepting work and drain what the queue has in flight.
    pub async fn shutdown(&self) {
        self.queue.close().await;
    }
}

#[async_trait]
impl JobSubmitter for Orchestrator {
    async fn submit_scheduled(&self, schedule: &Schedule) -> CivicScanResult<Vec<Uuid>> {
        self.submit(
            &schedule.scope.jurisdictions,
            &schedule.scope.data_types,
            schedule.depth,
            JobTrigger::Schedule,
            Some(schedule.id),
        )
        .await
    }
}
