//! In-memory ResearchStore for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use civicscan_common::{
    Artifact, ChangeRecord, Job, JobFilter, JobStatus, NewArtifact, NewChange, NewJob, NewProgram,
    NewSchedule, Program, ProgramUpdate, ResultFilter, Schedule,
};

use crate::traits::ResearchStore;

#[derive(Default)]
struct MemoryStoreInner {
    /// Insertion order doubles as creation order.
    jobs: Vec<Job>,
    programs: HashMap<Uuid, Program>,
    program_by_key: HashMap<String, Uuid>,
    job_results: Vec<(Uuid, Uuid)>,
    artifacts: Vec<Artifact>,
    changes: Vec<ChangeRecord>,
    schedules: Vec<Schedule>,
}

/// Stateful in-memory store. Thread-safe via interior Mutex.
/// Enforces the same active-scope and stable-key uniqueness as Postgres.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
    status_write_failures: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: every job row, oldest first.
    pub fn all_jobs(&self) -> Vec<Job> {
        self.inner.lock().unwrap().jobs.clone()
    }

    /// Test helper: every change record, oldest first.
    pub fn all_changes(&self) -> Vec<ChangeRecord> {
        self.inner.lock().unwrap().changes.clone()
    }

    /// Test helper: force a schedule's next fire time.
    pub fn set_next_run_at(&self, id: Uuid, next_run_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.schedules.iter_mut().find(|s| s.id == id) {
            s.next_run_at = next_run_at;
        }
    }

    /// Test helper: the next `n` job status writes return an error.
    pub fn fail_next_status_writes(&self, n: usize) {
        self.status_write_failures.store(n, Ordering::SeqCst);
    }

    fn transition(
        &self,
        id: Uuid,
        from: JobStatus,
        apply: impl FnOnce(&mut Job),
    ) -> Result<bool> {
        let injected = self
            .status_write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(anyhow!("store unavailable while updating job {id}"));
        }

        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.iter_mut().find(|j| j.id == id) {
            Some(job) if job.status == from => {
                apply(job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ResearchStore for MemoryStore {
    async fn insert_job(&self, new: &NewJob) -> Result<Option<Job>> {
        let mut inner = self.inner.lock().unwrap();
        let signature = new.scope.signature();
        if inner
            .jobs
            .iter()
            .any(|j| j.status.is_active() && j.scope.signature() == signature)
        {
            return Ok(None);
        }

        let job = Job {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            scope: new.scope.clone(),
            depth: new.depth,
            status: JobStatus::Queued,
            trigger: new.trigger,
            schedule_id: new.schedule_id,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result_count: 0,
            artifact_count: 0,
            error_message: None,
        };
        inner.jobs.push(job.clone());
        Ok(Some(job))
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        let jurisdiction = filter.jurisdiction.as_deref().map(str::to_uppercase);
        let limit = filter.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(inner
            .jobs
            .iter()
            .rev()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .filter(|j| {
                jurisdiction
                    .as_ref()
                    .map_or(true, |code| j.scope.jurisdictions.contains(code))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .iter()
            .filter(|j| statuses.contains(&j.status))
            .cloned()
            .collect())
    }

    async fn mark_job_running(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        self.transition(id, JobStatus::Queued, |job| {
            job.status = JobStatus::Running;
            job.started_at = Some(at);
        })
    }

    async fn mark_job_succeeded(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        result_count: u32,
        artifact_count: u32,
    ) -> Result<bool> {
        self.transition(id, JobStatus::Running, |job| {
            job.status = JobStatus::Succeeded;
            job.finished_at = Some(at);
            job.result_count = result_count;
            job.artifact_count = artifact_count;
        })
    }

    async fn mark_job_failed(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool> {
        self.transition(id, JobStatus::Running, |job| {
            job.status = JobStatus::Failed;
            job.finished_at = Some(at);
            job.error_message = Some(error_message.to_string());
        })
    }

    async fn latest_succeeded_job(
        &self,
        scope_signature: &str,
        before: DateTime<Utc>,
        exclude: Uuid,
    ) -> Result<Option<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .iter()
            .rev()
            .find(|j| {
                j.id != exclude
                    && j.status == JobStatus::Succeeded
                    && j.created_at <= before
                    && j.scope.signature() == scope_signature
            })
            .cloned())
    }

    async fn find_program_by_key(&self, stable_key: &str) -> Result<Option<Program>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .program_by_key
            .get(stable_key)
            .and_then(|id| inner.programs.get(id))
            .cloned())
    }

    async fn insert_program(&self, new: &NewProgram) -> Result<Option<Program>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.program_by_key.contains_key(&new.stable_key) {
            return Ok(None);
        }
        let program = Program {
            id: Uuid::new_v4(),
            stable_key: new.stable_key.clone(),
            jurisdiction: new.jurisdiction.clone(),
            program_type: new.program_type.clone(),
            title: new.title.clone(),
            summary: new.summary.clone(),
            source_url: new.source_url.clone(),
            last_updated: new.last_updated,
            first_seen_at: new.seen_at,
            last_seen_at: new.seen_at,
        };
        inner
            .program_by_key
            .insert(program.stable_key.clone(), program.id);
        inner.programs.insert(program.id, program.clone());
        Ok(Some(program))
    }

    async fn update_program(&self, id: Uuid, update: &ProgramUpdate) -> Result<Program> {
        let mut inner = self.inner.lock().unwrap();
        let program = inner
            .programs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("program {id} not found"))?;
        program.last_seen_at = program.last_seen_at.max(update.seen_at);
        if let Some(summary) = &update.summary {
            program.summary = Some(summary.clone());
        }
        if let Some(url) = &update.source_url {
            program.source_url = Some(url.clone());
        }
        if let Some(last_updated) = update.last_updated {
            program.last_updated = Some(last_updated);
        }
        Ok(program.clone())
    }

    async fn list_programs(&self, filter: &ResultFilter) -> Result<Vec<Program>> {
        let inner = self.inner.lock().unwrap();
        let linked: Option<HashSet<Uuid>> = filter.job_id.map(|job_id| {
            inner
                .job_results
                .iter()
                .filter(|(j, _)| *j == job_id)
                .map(|(_, p)| *p)
                .collect()
        });

        let mut programs: Vec<Program> = inner
            .programs
            .values()
            .filter(|p| {
                filter
                    .jurisdiction
                    .as_ref()
                    .map_or(true, |j| &p.jurisdiction == j)
            })
            .filter(|p| {
                filter
                    .program_type
                    .as_ref()
                    .map_or(true, |t| &p.program_type == t)
            })
            .filter(|p| linked.as_ref().map_or(true, |ids| ids.contains(&p.id)))
            .filter(|p| filter.since.map_or(true, |since| p.last_seen_at >= since))
            .cloned()
            .collect();
        programs.sort_by(|a, b| {
            (&a.jurisdiction, &a.program_type, &a.title).cmp(&(
                &b.jurisdiction,
                &b.program_type,
                &b.title,
            ))
        });
        Ok(programs)
    }

    async fn link_job_result(&self, job_id: Uuid, program_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.job_results.contains(&(job_id, program_id)) {
            return Ok(false);
        }
        inner.job_results.push((job_id, program_id));
        Ok(true)
    }

    async fn program_ids_for_job(&self, job_id: Uuid) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .job_results
            .iter()
            .filter(|(j, _)| *j == job_id)
            .map(|(_, p)| *p)
            .collect())
    }

    async fn insert_artifact(&self, new: &NewArtifact) -> Result<Artifact> {
        let artifact = Artifact {
            id: Uuid::new_v4(),
            job_id: new.job_id,
            program_id: new.program_id,
            artifact_type: new.artifact_type.clone(),
            url: new.url.clone(),
            status: new.status,
            created_at: Utc::now(),
        };
        self.inner.lock().unwrap().artifacts.push(artifact.clone());
        Ok(artifact)
    }

    async fn artifacts_for_job(&self, job_id: Uuid) -> Result<Vec<Artifact>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .artifacts
            .iter()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn insert_change(&self, new: &NewChange) -> Result<ChangeRecord> {
        let record = ChangeRecord {
            id: Uuid::new_v4(),
            job_id: new.job_id,
            program_id: new.program_id,
            change_type: new.change_type,
            diff: new.diff.clone(),
            created_at: Utc::now(),
        };
        self.inner.lock().unwrap().changes.push(record.clone());
        Ok(record)
    }

    async fn changes_since(&self, since: DateTime<Utc>) -> Result<Vec<ChangeRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .changes
            .iter()
            .filter(|c| c.created_at >= since)
            .cloned()
            .collect())
    }

    async fn changes_for_job(&self, job_id: Uuid) -> Result<Vec<ChangeRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .changes
            .iter()
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn insert_schedule(&self, new: &NewSchedule) -> Result<Schedule> {
        let now = Utc::now();
        let schedule = Schedule {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            cron_expression: new.cron_expression.clone(),
            scope: new.scope.clone(),
            depth: new.depth,
            is_active: new.is_active,
            last_run_at: None,
            next_run_at: new.next_run_at,
            created_at: now,
            updated_at: now,
        };
        self.inner.lock().unwrap().schedules.push(schedule.clone());
        Ok(schedule)
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.schedules.iter().find(|s| s.id == id).cloned())
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<Option<Schedule>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(existing) = inner.schedules.iter_mut().find(|s| s.id == schedule.id) else {
            return Ok(None);
        };
        existing.name = schedule.name.clone();
        existing.cron_expression = schedule.cron_expression.clone();
        existing.scope = schedule.scope.clone();
        existing.depth = schedule.depth;
        existing.is_active = schedule.is_active;
        existing.next_run_at = schedule.next_run_at;
        existing.updated_at = Utc::now();
        Ok(Some(existing.clone()))
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.schedules.len();
        inner.schedules.retain(|s| s.id != id);
        for job in inner.jobs.iter_mut().filter(|j| j.schedule_id == Some(id)) {
            job.schedule_id = None;
        }
        Ok(inner.schedules.len() < before)
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        self.upcoming_schedules(now).await
    }

    async fn upcoming_schedules(&self, until: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let inner = self.inner.lock().unwrap();
        let mut schedules: Vec<Schedule> = inner
            .schedules
            .iter()
            .filter(|s| s.is_active && s.next_run_at <= until)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.next_run_at);
        Ok(schedules)
    }

    async fn record_schedule_run(
        &self,
        id: Uuid,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.schedules.iter_mut().find(|s| s.id == id) {
            Some(schedule) => {
                schedule.last_run_at = Some(ran_at);
                schedule.next_run_at = next_run_at;
                schedule.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
