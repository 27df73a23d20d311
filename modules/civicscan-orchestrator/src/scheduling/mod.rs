pub mod engine;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croner::Cron;
use uuid::Uuid;

use civicscan_common::{CivicScanError, CivicScanResult, Schedule};

pub use engine::{PollReport, ScheduleEngine, ScheduleRequest, ScheduleUpdate};

/// The submission path a fired schedule goes through.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit_scheduled(&self, schedule: &Schedule) -> CivicScanResult<Vec<Uuid>>;
}

/// Parse a standard five-field cron expression.
pub fn parse_cron(expression: &str) -> CivicScanResult<Cron> {
    Cron::new(expression.trim())
        .parse()
        .map_err(|e| CivicScanError::ScheduleParse {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

/// First firing time strictly after `after`, evaluated in UTC.
pub fn next_fire(expression: &str, after: DateTime<Utc>) -> CivicScanResult<DateTime<Utc>> {
    parse_cron(expression)?
        .find_next_occurrence(&after, false)
        .map_err(|e| CivicScanError::ScheduleParse {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}
