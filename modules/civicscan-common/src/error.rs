use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced synchronously to callers of the orchestration API.
///
/// Anything that happens after a job is accepted is reported through the job
/// row (`status`, `error_message`), never through this type.
#[derive(Error, Debug)]
pub enum CivicScanError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Scope {requested} conflicts with active job {job_id} ({existing})")]
    Conflict {
        requested: String,
        existing: String,
        job_id: Uuid,
    },

    #[error("Invalid cron expression {expression:?}: {reason}")]
    ScheduleParse { expression: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl CivicScanError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

pub type CivicScanResult<T> = std::result::Result<T, CivicScanError>;
