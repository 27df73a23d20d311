//! Drives one job through queued → running → succeeded | failed.
//!
//! The research call runs on its own task under a timeout, so an error, a
//! panic, or a hang inside the collaborator only ever fails its own job.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use civicscan_common::{
    ArtifactStatus, Candidate, ChangeType, Job, JobStatus, NewArtifact, NewChange,
};
use civicscan_store::ResearchStore;

use crate::changes;
use crate::registry::ProgramRegistry;
use crate::research::Researcher;

const STATUS_WRITE_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Research failed for {jurisdiction}: {cause:#}")]
    Research {
        jurisdiction: String,
        cause: anyhow::Error,
    },

    #[error("Research panicked for {jurisdiction}: {message}")]
    Panicked {
        jurisdiction: String,
        message: String,
    },

    #[error("Research for {jurisdiction} timed out after {timeout:?}")]
    TimedOut {
        jurisdiction: String,
        timeout: Duration,
    },

    #[error("Recording results failed: {0:#}")]
    Persistence(anyhow::Error),
}

/// How a call to `execute` ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded {
        result_count: u32,
        artifact_count: u32,
    },
    Failed {
        error: String,
    },
    /// The job was not queued when execution began; nothing ran.
    Skipped { status: JobStatus },
}

pub struct JobLifecycleManager {
    store: Arc<dyn ResearchStore>,
    researcher: Arc<dyn Researcher>,
    registry: ProgramRegistry,
    research_timeout: Duration,
}

impl JobLifecycleManager {
    pub fn new(
        store: Arc<dyn ResearchStore>,
        researcher: Arc<dyn Researcher>,
        research_timeout: Duration,
    ) -> Self {
        Self {
            registry: ProgramRegistry::new(store.clone()),
            store,
            researcher,
            research_timeout,
        }
    }

    /// Run a queued job to a terminal state. Errors returned here are store
    /// failures while recording the transition; research failures end up in
    /// the job row instead.
    pub async fn execute(&self, job_id: Uuid) -> Result<ExecutionOutcome> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;

        if job.status != JobStatus::Queued {
            debug!(job_id = %job_id, status = %job.status, "Job not queued, skipping");
            return Ok(ExecutionOutcome::Skipped { status: job.status });
        }

        let started_at = Utc::now();
        let claimed = self
            .write_status(job_id, "running", || {
                self.store.mark_job_running(job_id, started_at)
            })
            .await?;
        if !claimed {
            let status = self
                .store
                .get_job(job_id)
                .await?
                .map(|j| j.status)
                .unwrap_or(JobStatus::Queued);
            debug!(job_id = %job_id, status = %status, "Job claimed elsewhere, skipping");
            return Ok(ExecutionOutcome::Skipped { status });
        }
        info!(job_id = %job_id, scope = %job.scope, depth = %job.depth, "Job started");

        let outcome = self.run(&job).await;
        let finished_at = Utc::now();
        match outcome {
            Ok((result_count, artifact_count)) => {
                self.write_status(job_id, "succeeded", || {
                    self.store
                        .mark_job_succeeded(job_id, finished_at, result_count, artifact_count)
                })
                .await?;
                info!(job_id = %job_id, result_count, artifact_count, "Job succeeded");
                Ok(ExecutionOutcome::Succeeded {
                    result_count,
                    artifact_count,
                })
            }
            Err(e) => {
                let error = e.to_string();
                self.write_status(job_id, "failed", || {
                    self.store.mark_job_failed(job_id, finished_at, &error)
                })
                .await?;
                warn!(job_id = %job_id, error = error.as_str(), "Job failed");
                Ok(ExecutionOutcome::Failed { error })
            }
        }
    }

    /// Drive a job whose execution errored out to `failed` so its scope is
    /// released. Terminal rows are left as they are.
    pub async fn abandon(&self, job_id: Uuid, reason: &str) -> Result<()> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(());
        };
        if !job.status.is_active() {
            return Ok(());
        }

        let now = Utc::now();
        if job.status == JobStatus::Queued {
            self.write_status(job_id, "running", || self.store.mark_job_running(job_id, now))
                .await?;
        }
        let message = format!("job aborted: {reason}");
        self.write_status(job_id, "failed", || {
            self.store.mark_job_failed(job_id, now, &message)
        })
        .await?;
        warn!(job_id = %job_id, reason, "Job abandoned");
        Ok(())
    }

    /// Status writes get one retry. A lost terminal write keeps the scope held.
    async fn write_status<F, Fut>(&self, job_id: Uuid, status: &str, write: F) -> Result<bool>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        match write().await {
            Ok(applied) => Ok(applied),
            Err(e) => {
                warn!(job_id = %job_id, status, error = %e, "Job status write failed, retrying");
                tokio::time::sleep(STATUS_WRITE_RETRY_DELAY).await;
                write().await
            }
        }
    }

    async fn run(&self, job: &Job) -> Result<(u32, u32), ExecutionError> {
        let mut candidates = Vec::new();
        for jurisdiction in &job.scope.jurisdictions {
            let mut found = self.research(jurisdiction, job).await?;
            for candidate in &mut found {
                if candidate.jurisdiction.trim().is_empty() {
                    candidate.jurisdiction = jurisdiction.clone();
                }
            }
            candidates.extend(found);
        }
        self.record(job, &candidates)
            .await
            .map_err(ExecutionError::Persistence)
    }

    async fn research(&self, jurisdiction: &str, job: &Job) -> Result<Vec<Candidate>, ExecutionError> {
        let researcher = self.researcher.clone();
        let owned_jurisdiction = jurisdiction.to_string();
        let data_types = job.scope.data_types.clone();
        let depth = job.depth;

        let handle = tokio::spawn(async move {
            researcher
                .research(&owned_jurisdiction, &data_types, depth)
                .await
        });
        let abort = handle.abort_handle();

        match tokio::time::timeout(self.research_timeout, handle).await {
            Ok(Ok(Ok(candidates))) => Ok(candidates),
            Ok(Ok(Err(cause))) => Err(ExecutionError::Research {
                jurisdiction: jurisdiction.to_string(),
                cause,
            }),
            Ok(Err(join_error)) => Err(ExecutionError::Panicked {
                jurisdiction: jurisdiction.to_string(),
                message: panic_message(join_error),
            }),
            Err(_) => {
                abort.abort();
                Err(ExecutionError::TimedOut {
                    jurisdiction: jurisdiction.to_string(),
                    timeout: self.research_timeout,
                })
            }
        }
    }

    /// Upsert, link, diff and attach artifacts for each candidate, then record
    /// removals against the previous successful run of the same scope.
    async fn record(&self, job: &Job, candidates: &[Candidate]) -> Result<(u32, u32)> {
        let now = Utc::now();
        let mut surfaced = HashSet::new();
        let mut artifact_count = 0u32;

        for candidate in candidates {
            let outcome = self.registry.upsert(candidate, now).await?;
            let program_id = outcome.program.id;
            self.store.link_job_result(job.id, program_id).await?;
            surfaced.insert(program_id);

            if let Some(change) = changes::detect(outcome.previous.as_ref(), candidate) {
                self.store
                    .insert_change(&NewChange {
                        job_id: job.id,
                        program_id: Some(program_id),
                        change_type: change.change_type,
                        diff: change.diff,
                    })
                    .await?;
            }

            for artifact in &candidate.artifacts {
                self.store
                    .insert_artifact(&NewArtifact {
                        job_id: job.id,
                        program_id: Some(program_id),
                        artifact_type: artifact.artifact_type.clone(),
                        url: artifact.url.clone(),
                        status: if artifact.fetched {
                            ArtifactStatus::Fetched
                        } else {
                            ArtifactStatus::Failed
                        },
                    })
                    .await?;
                artifact_count += 1;
            }
        }

        let previous = self
            .store
            .latest_succeeded_job(&job.scope.signature(), job.created_at, job.id)
            .await?;
        if let Some(previous) = previous {
            let known = self.store.program_ids_for_job(previous.id).await?;
            for program_id in changes::removed(&known, &surfaced) {
                self.store
                    .insert_change(&NewChange {
                        job_id: job.id,
                        program_id: Some(program_id),
                        change_type: ChangeType::Removed,
                        diff: json!({ "removed": { "programId": program_id, "lastJobId": previous.id } }),
                    })
                    .await?;
            }
        }

        Ok((surfaced.len() as u32, artifact_count))
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{candidate, CandidateExt, MockResearcher};
    use civicscan_common::{Depth, JobTrigger, NewJob, Scope};
    use civicscan_store::MemoryStore;

    async fn queued_job(store: &MemoryStore, jurisdiction: &str) -> Job {
        store
            .insert_job(&NewJob {
                name: format!("research:{jurisdiction}"),
                scope: Scope::single(jurisdiction, ["emissions"]),
                depth: Depth::Summary,
                trigger: JobTrigger::Manual,
                schedule_id: None,
            })
            .await
            .unwrap()
            .unwrap()
    }

    fn manager(store: Arc<MemoryStore>, researcher: MockResearcher) -> JobLifecycleManager {
        JobLifecycleManager::new(store, Arc::new(researcher), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn success_records_counts() {
        let store = Arc::new(MemoryStore::new());
        let researcher = MockResearcher::new().on(
            "CA",
            vec![
                candidate("CA", "emissions", "Cap-and-Trade").with_artifact("source_page"),
                candidate("CA", "emissions", "Low Carbon Fuel Standard"),
            ],
        );
        let job = queued_job(&store, "CA").await;

        let outcome = manager(store.clone(), researcher).execute(job.id).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Succeeded {
                result_count: 2,
                artifact_count: 1
            }
        );

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert!(stored.started_at.is_some() && stored.finished_at.is_some());
        assert_eq!(store.changes_for_job(job.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn research_error_fails_only_that_job() {
        let store = Arc::new(MemoryStore::new());
        let researcher = MockResearcher::new().fail_on("CA", "upstream 503");
        let job = queued_job(&store, "CA").await;

        let outcome = manager(store.clone(), researcher).execute(job.id).await.unwrap();
        let ExecutionOutcome::Failed { error } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.contains("upstream 503"));

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some(error.as_str()));
    }

    #[tokio::test]
    async fn panic_is_captured_as_failure() {
        let store = Arc::new(MemoryStore::new());
        let researcher = MockResearcher::new().panic_on("CA");
        let job = queued_job(&store, "CA").await;

        let outcome = manager(store.clone(), researcher).execute(job.id).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
        assert_eq!(
            store.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn hang_times_out() {
        let store = Arc::new(MemoryStore::new());
        let researcher = MockResearcher::new()
            .on("CA", vec![candidate("CA", "emissions", "Cap-and-Trade")])
            .with_delay(Duration::from_secs(5));
        let job = queued_job(&store, "CA").await;

        let outcome = manager(store.clone(), researcher).execute(job.id).await.unwrap();
        let ExecutionOutcome::Failed { error } = outcome else {
            panic!("expected timeout failure");
        };
        assert!(error.contains("timed out"));
    }

    #[tokio::test]
    async fn non_queued_job_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let job = queued_job(&store, "CA").await;
        let manager = manager(
            store.clone(),
            MockResearcher::new().on("CA", vec![candidate("CA", "emissions", "Cap-and-Trade")]),
        );

        manager.execute(job.id).await.unwrap();
        let again = manager.execute(job.id).await.unwrap();
        assert_eq!(
            again,
            ExecutionOutcome::Skipped {
                status: JobStatus::Succeeded
            }
        );
    }

    #[tokio::test]
    async fn rerun_detects_updates_and_removals() {
        let store = Arc::new(MemoryStore::new());
        let researcher = Arc::new(MockResearcher::new().on(
            "CA",
            vec![
                candidate("CA", "emissions", "Cap-and-Trade"),
                candidate("CA", "emissions", "Low Carbon Fuel Standard"),
            ],
        ));
        let manager = JobLifecycleManager::new(
            store.clone(),
            researcher.clone(),
            Duration::from_millis(200),
        );

        let first = queued_job(&store, "CA").await;
        manager.execute(first.id).await.unwrap();

        researcher.set(
            "CA",
            vec![candidate("CA", "emissions", "Cap-and-Trade").with_summary("Now covers fuels")],
        );
        let second = queued_job(&store, "CA").await;
        manager.execute(second.id).await.unwrap();

        let changes = store.changes_for_job(second.id).await.unwrap();
        let kinds: Vec<ChangeType> = changes.iter().map(|c| c.change_type).collect();
        assert_eq!(kinds, vec![ChangeType::Updated, ChangeType::Removed]);
        assert!(changes[0].diff.get("summary").is_some());
    }

    #[tokio::test]
    async fn terminal_write_is_retried_once() {
        let store = Arc::new(MemoryStore::new());
        let researcher = MockResearcher::new()
            .on("CA", vec![candidate("CA", "emissions", "Cap-and-Trade")])
            .with_delay(Duration::from_millis(50));
        let manager = Arc::new(manager(store.clone(), researcher));
        let job = queued_job(&store, "CA").await;

        let run = tokio::spawn({
            let manager = manager.clone();
            async move { manager.execute(job.id).await }
        });
        while store.get_job(job.id).await.unwrap().unwrap().status != JobStatus::Running {
            tokio::task::yield_now().await;
        }
        store.fail_next_status_writes(1);

        let outcome = run.await.unwrap().unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Succeeded { .. }));
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn abandon_fails_active_rows_and_skips_finished_ones() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone(), MockResearcher::new());

        let stuck = queued_job(&store, "CA").await;
        manager.abandon(stuck.id, "store offline").await.unwrap();
        let stored = store.get_job(stuck.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("job aborted: store offline"));

        let done = queued_job(&store, "TX").await;
        manager.execute(done.id).await.unwrap();
        manager.abandon(done.id, "late").await.unwrap();
        let stored = store.get_job(done.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
    }
}
