//! ResearchStore: every persistence call the orchestrator makes.
//!
//! PgResearchStore is the production implementation. MemoryStore (test-utils)
//! enforces the same uniqueness and transition rules without a database.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use civicscan_common::{
    Artifact, ChangeRecord, Job, JobFilter, JobStatus, NewArtifact, NewChange, NewJob, NewProgram,
    NewSchedule, Program, ProgramUpdate, ResultFilter, Schedule,
};

#[async_trait]
pub trait ResearchStore: Send + Sync {
    // --- Jobs ---

    /// Insert a queued job. Returns `None` when a queued/running job already
    /// holds the same scope signature.
    async fn insert_job(&self, job: &NewJob) -> Result<Option<Job>>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// Jobs matching the filter, newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Jobs in any of the given statuses, oldest first.
    async fn jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>>;

    /// queued → running. Returns false if the job was not queued.
    async fn mark_job_running(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// running → succeeded. Returns false if the job was not running.
    async fn mark_job_succeeded(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        result_count: u32,
        artifact_count: u32,
    ) -> Result<bool>;

    /// running → failed. Returns false if the job was not running.
    async fn mark_job_failed(&self, id: Uuid, at: DateTime<Utc>, error_message: &str)
        -> Result<bool>;

    /// Most recent succeeded job with this scope signature created before `before`,
    /// excluding `exclude`.
    async fn latest_succeeded_job(
        &self,
        scope_signature: &str,
        before: DateTime<Utc>,
        exclude: Uuid,
    ) -> Result<Option<Job>>;

    // --- Programs ---

    async fn find_program_by_key(&self, stable_key: &str) -> Result<Option<Program>>;

    /// Insert a program. Returns `None` if the stable key already exists.
    async fn insert_program(&self, program: &NewProgram) -> Result<Option<Program>>;

    /// Apply a re-encounter update. `last_seen_at` never moves backwards.
    async fn update_program(&self, id: Uuid, update: &ProgramUpdate) -> Result<Program>;

    /// Programs matching every set field of the filter.
    async fn list_programs(&self, filter: &ResultFilter) -> Result<Vec<Program>>;

    /// Link a program to the job that surfaced it. Returns false if already linked.
    async fn link_job_result(&self, job_id: Uuid, program_id: Uuid) -> Result<bool>;

    async fn program_ids_for_job(&self, job_id: Uuid) -> Result<Vec<Uuid>>;

    // --- Artifacts ---

    async fn insert_artifact(&self, artifact: &NewArtifact) -> Result<Artifact>;

    async fn artifacts_for_job(&self, job_id: Uuid) -> Result<Vec<Artifact>>;

    // --- Change records ---

    async fn insert_change(&self, change: &NewChange) -> Result<ChangeRecord>;

    /// Change records created at or after `since`, oldest first.
    async fn changes_since(&self, since: DateTime<Utc>) -> Result<Vec<ChangeRecord>>;

    async fn changes_for_job(&self, job_id: Uuid) -> Result<Vec<ChangeRecord>>;

    // --- Schedules ---

    async fn insert_schedule(&self, schedule: &NewSchedule) -> Result<Schedule>;

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>>;

    /// Overwrite the editable fields of a schedule (name, cron, scope, depth,
    /// active flag, next run). Returns `None` if the schedule does not exist.
    async fn update_schedule(&self, schedule: &Schedule) -> Result<Option<Schedule>>;

    async fn delete_schedule(&self, id: Uuid) -> Result<bool>;

    /// Active schedules whose next run is at or before `now`.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>>;

    /// Active schedules firing at or before `until`, soonest first.
    async fn upcoming_schedules(&self, until: DateTime<Utc>) -> Result<Vec<Schedule>>;

    /// Stamp a fired schedule with its run time and next fire time.
    async fn record_schedule_run(
        &self,
        id: Uuid,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool>;
}
