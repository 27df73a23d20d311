//! Postgres-backed ResearchStore.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use civicscan_common::{
    Artifact, ChangeRecord, Job, JobFilter, JobStatus, NewArtifact, NewChange, NewJob, NewProgram,
    NewSchedule, Program, ProgramUpdate, ResultFilter, Schedule, Scope,
};

use crate::traits::ResearchStore;

const JOB_COLUMNS: &str = "id, name, jurisdictions, data_types, depth, status, triggered_by, \
     schedule_id, created_at, started_at, finished_at, result_count, artifact_count, error_message";

const PROGRAM_COLUMNS: &str = "id, stable_key, jurisdiction, program_type, title, summary, \
     source_url, last_updated, first_seen_at, last_seen_at";

const SCHEDULE_COLUMNS: &str = "id, name, cron_expression, jurisdictions, data_types, depth, \
     is_active, last_run_at, next_run_at, created_at, updated_at";

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    name: String,
    jurisdictions: Vec<String>,
    data_types: Vec<String>,
    depth: String,
    status: String,
    triggered_by: String,
    schedule_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    result_count: i32,
    artifact_count: i32,
    error_message: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            name: row.name,
            scope: Scope::new(row.jurisdictions, row.data_types),
            depth: row.depth.parse().map_err(anyhow::Error::msg)?,
            status: row.status.parse().map_err(anyhow::Error::msg)?,
            trigger: row.triggered_by.parse().map_err(anyhow::Error::msg)?,
            schedule_id: row.schedule_id,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            result_count: row.result_count.max(0) as u32,
            artifact_count: row.artifact_count.max(0) as u32,
            error_message: row.error_message,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProgramRow {
    id: Uuid,
    stable_key: String,
    jurisdiction: String,
    program_type: String,
    title: String,
    summary: Option<String>,
    source_url: Option<String>,
    last_updated: Option<DateTime<Utc>>,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl From<ProgramRow> for Program {
    fn from(row: ProgramRow) -> Self {
        Program {
            id: row.id,
            stable_key: row.stable_key,
            jurisdiction: row.jurisdiction,
            program_type: row.program_type,
            title: row.title,
            summary: row.summary,
            source_url: row.source_url,
            last_updated: row.last_updated,
            first_seen_at: row.first_seen_at,
            last_seen_at: row.last_seen_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ArtifactRow {
    id: Uuid,
    job_id: Uuid,
    program_id: Option<Uuid>,
    artifact_type: String,
    url: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ArtifactRow> for Artifact {
    type Error = anyhow::Error;

    fn try_from(row: ArtifactRow) -> Result<Self> {
        Ok(Artifact {
            id: row.id,
            job_id: row.job_id,
            program_id: row.program_id,
            artifact_type: row.artifact_type,
            url: row.url,
            status: row.status.parse().map_err(anyhow::Error::msg)?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ChangeRow {
    id: Uuid,
    job_id: Uuid,
    program_id: Option<Uuid>,
    change_type: String,
    diff: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<ChangeRow> for ChangeRecord {
    type Error = anyhow::Error;

    fn try_from(row: ChangeRow) -> Result<Self> {
        Ok(ChangeRecord {
            id: row.id,
            job_id: row.job_id,
            program_id: row.program_id,
            change_type: row.change_type.parse().map_err(anyhow::Error::msg)?,
            diff: row.diff,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScheduleRow {
    id: Uuid,
    name: String,
    cron_expression: String,
    jurisdictions: Vec<String>,
    data_types: Vec<String>,
    depth: String,
    is_active: bool,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduleRow> for Schedule {
    type Error = anyhow::Error;

    fn try_from(row: ScheduleRow) -> Result<Self> {
        Ok(Schedule {
            id: row.id,
            name: row.name,
            cron_expression: row.cron_expression,
            scope: Scope::new(row.jurisdictions, row.data_types),
            depth: row.depth.parse().map_err(anyhow::Error::msg)?,
            is_active: row.is_active,
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = anyhow::Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ---------------------------------------------------------------------------
// PgResearchStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgResearchStore {
    pool: PgPool,
}

impl PgResearchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ResearchStore for PgResearchStore {
    async fn insert_job(&self, job: &NewJob) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO research_jobs
                (name, jurisdictions, data_types, scope_signature, depth, status, triggered_by, schedule_id)
            VALUES ($1, $2, $3, $4, $5, 'queued', $6, $7)
            ON CONFLICT (scope_signature) WHERE status IN ('queued', 'running') DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&job.name)
        .bind(&job.scope.jurisdictions)
        .bind(&job.scope.data_types)
        .bind(job.scope.signature())
        .bind(job.depth.as_str())
        .bind(job.trigger.as_str())
        .bind(job.schedule_id)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            debug!(scope = %job.scope, "Active job already holds scope");
        }
        row.map(Job::try_from).transpose()
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM research_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM research_jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR $2 = ANY(jurisdictions))
            ORDER BY created_at DESC
            LIMIT $3
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.jurisdiction.as_deref().map(str::to_uppercase))
        .bind(filter.limit.map(i64::from))
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        let statuses: Vec<&str> = statuses.iter().map(JobStatus::as_str).collect();
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM research_jobs WHERE status = ANY($1) ORDER BY created_at"
        ))
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn mark_job_running(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE research_jobs SET status = 'running', started_at = $2
             WHERE id = $1 AND status = 'queued'",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_job_succeeded(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        result_count: u32,
        artifact_count: u32,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE research_jobs
             SET status = 'succeeded', finished_at = $2, result_count = $3, artifact_count = $4
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(at)
        .bind(i32::try_from(result_count).unwrap_or(i32::MAX))
        .bind(i32::try_from(artifact_count).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_job_failed(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE research_jobs
             SET status = 'failed', finished_at = $2, error_message = $3
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(at)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn latest_succeeded_job(
        &self,
        scope_signature: &str,
        before: DateTime<Utc>,
        exclude: Uuid,
    ) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM research_jobs
            WHERE scope_signature = $1
              AND status = 'succeeded'
              AND created_at <= $2
              AND id <> $3
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(scope_signature)
        .bind(before)
        .bind(exclude)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn find_program_by_key(&self, stable_key: &str) -> Result<Option<Program>> {
        let row = sqlx::query_as::<_, ProgramRow>(&format!(
            "SELECT {PROGRAM_COLUMNS} FROM programs WHERE stable_key = $1"
        ))
        .bind(stable_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Program::from))
    }

    async fn insert_program(&self, program: &NewProgram) -> Result<Option<Program>> {
        let row = sqlx::query_as::<_, ProgramRow>(&format!(
            r#"
            INSERT INTO programs
                (stable_key, jurisdiction, program_type, title, summary, source_url,
                 last_updated, first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (stable_key) DO NOTHING
            RETURNING {PROGRAM_COLUMNS}
            "#
        ))
        .bind(&program.stable_key)
        .bind(&program.jurisdiction)
        .bind(&program.program_type)
        .bind(&program.title)
        .bind(&program.summary)
        .bind(&program.source_url)
        .bind(program.last_updated)
        .bind(program.seen_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Program::from))
    }

    async fn update_program(&self, id: Uuid, update: &ProgramUpdate) -> Result<Program> {
        let row = sqlx::query_as::<_, ProgramRow>(&format!(
            r#"
            UPDATE programs SET
                last_seen_at = GREATEST(last_seen_at, $2),
                summary      = COALESCE($3, summary),
                source_url   = COALESCE($4, source_url),
                last_updated = COALESCE($5, last_updated)
            WHERE id = $1
            RETURNING {PROGRAM_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(update.seen_at)
        .bind(&update.summary)
        .bind(&update.source_url)
        .bind(update.last_updated)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Program::from)
            .ok_or_else(|| anyhow!("program {id} not found"))
    }

    async fn list_programs(&self, filter: &ResultFilter) -> Result<Vec<Program>> {
        let rows = sqlx::query_as::<_, ProgramRow>(&format!(
            r#"
            SELECT {PROGRAM_COLUMNS} FROM programs
            WHERE ($1::text IS NULL OR jurisdiction = $1)
              AND ($2::text IS NULL OR program_type = $2)
              AND ($3::uuid IS NULL OR id IN (SELECT program_id FROM job_results WHERE job_id = $3))
              AND ($4::timestamptz IS NULL OR last_seen_at >= $4)
            ORDER BY jurisdiction, program_type, title
            "#
        ))
        .bind(&filter.jurisdiction)
        .bind(&filter.program_type)
        .bind(filter.job_id)
        .bind(filter.since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Program::from).collect())
    }

    async fn link_job_result(&self, job_id: Uuid, program_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO job_results (job_id, program_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(job_id)
        .bind(program_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn program_ids_for_job(&self, job_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT program_id FROM job_results WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn insert_artifact(&self, artifact: &NewArtifact) -> Result<Artifact> {
        let row = sqlx::query_as::<_, ArtifactRow>(
            r#"
            INSERT INTO artifacts (job_id, program_id, artifact_type, url, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, job_id, program_id, artifact_type, url, status, created_at
            "#,
        )
        .bind(artifact.job_id)
        .bind(artifact.program_id)
        .bind(&artifact.artifact_type)
        .bind(&artifact.url)
        .bind(artifact.status.as_str())
        .fetch_one(&self.pool)
        .await?;

        Artifact::try_from(row)
    }

    async fn artifacts_for_job(&self, job_id: Uuid) -> Result<Vec<Artifact>> {
        let rows = sqlx::query_as::<_, ArtifactRow>(
            "SELECT id, job_id, program_id, artifact_type, url, status, created_at
             FROM artifacts WHERE job_id = $1 ORDER BY created_at",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn insert_change(&self, change: &NewChange) -> Result<ChangeRecord> {
        let row = sqlx::query_as::<_, ChangeRow>(
            r#"
            INSERT INTO change_records (job_id, program_id, change_type, diff)
            VALUES ($1, $2, $3, $4)
            RETURNING id, job_id, program_id, change_type, diff, created_at
            "#,
        )
        .bind(change.job_id)
        .bind(change.program_id)
        .bind(change.change_type.as_str())
        .bind(&change.diff)
        .fetch_one(&self.pool)
        .await?;

        ChangeRecord::try_from(row)
    }

    async fn changes_since(&self, since: DateTime<Utc>) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query_as::<_, ChangeRow>(
            "SELECT id, job_id, program_id, change_type, diff, created_at
             FROM change_records WHERE created_at >= $1 ORDER BY created_at",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn changes_for_job(&self, job_id: Uuid) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query_as::<_, ChangeRow>(
            "SELECT id, job_id, program_id, change_type, diff, created_at
             FROM change_records WHERE job_id = $1 ORDER BY created_at",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn insert_schedule(&self, schedule: &NewSchedule) -> Result<Schedule> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            r#"
            INSERT INTO research_schedules
                (name, cron_expression, jurisdictions, data_types, depth, is_active, next_run_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(&schedule.name)
        .bind(&schedule.cron_expression)
        .bind(&schedule.scope.jurisdictions)
        .bind(&schedule.scope.data_types)
        .bind(schedule.depth.as_str())
        .bind(schedule.is_active)
        .bind(schedule.next_run_at)
        .fetch_one(&self.pool)
        .await?;

        Schedule::try_from(row)
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM research_schedules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Schedule::try_from).transpose()
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<Option<Schedule>> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            r#"
            UPDATE research_schedules SET
                name            = $2,
                cron_expression = $3,
                jurisdictions   = $4,
                data_types      = $5,
                depth           = $6,
                is_active       = $7,
                next_run_at     = $8,
                updated_at      = now()
            WHERE id = $1
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.cron_expression)
        .bind(&schedule.scope.jurisdictions)
        .bind(&schedule.scope.data_types)
        .bind(schedule.depth.as_str())
        .bind(schedule.is_active)
        .bind(schedule.next_run_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Schedule::try_from).transpose()
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM research_schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS} FROM research_schedules
            WHERE is_active AND next_run_at <= $1
            ORDER BY next_run_at
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn upcoming_schedules(&self, until: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS} FROM research_schedules
            WHERE is_active AND next_run_at <= $1
            ORDER BY next_run_at
            "#
        ))
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn record_schedule_run(
        &self,
        id: Uuid,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE research_schedules
             SET last_run_at = $2, next_run_at = $3, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(ran_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
