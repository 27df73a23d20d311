//! Recurring research: cron-driven schedules and the poller that fires them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use civicscan_common::{CivicScanError, CivicScanResult, Depth, NewSchedule, Schedule, Scope};
use civicscan_store::ResearchStore;

use super::{next_fire, JobSubmitter};
use crate::orchestrator::validate_scopes;

/// Widest look-ahead accepted by `get_upcoming_schedules`: one leap year.
pub const MAX_UPCOMING_HOURS: u32 = 24 * 366;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub name: String,
    #[serde(alias = "cron")]
    pub cron_expression: String,
    #[serde(alias = "states", alias = "scopes")]
    pub jurisdictions: Vec<String>,
    pub data_types: Vec<String>,
    #[serde(default)]
    pub depth: Depth,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Partial update. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    #[serde(alias = "cron")]
    pub cron_expression: Option<String>,
    #[serde(alias = "states", alias = "scopes")]
    pub jurisdictions: Option<Vec<String>>,
    pub data_types: Option<Vec<String>>,
    pub depth: Option<Depth>,
    pub is_active: Option<bool>,
}

/// What one poll cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub fired: usize,
    pub submitted: usize,
    pub conflicts: usize,
    pub failed: usize,
}

pub struct ScheduleEngine {
    store: Arc<dyn ResearchStore>,
    submitter: Arc<dyn JobSubmitter>,
    poll_interval: Duration,
    max_jurisdictions: usize,
}

impl ScheduleEngine {
    pub fn new(
        store: Arc<dyn ResearchStore>,
        submitter: Arc<dyn JobSubmitter>,
        poll_interval: Duration,
        max_jurisdictions: usize,
    ) -> Self {
        Self {
            store,
            submitter,
            poll_interval,
            max_jurisdictions,
        }
    }

    /// Validate, compute the first fire time, then persist. Nothing is
    /// written when the scope or cron expression is invalid.
    pub async fn create_schedule(&self, request: &ScheduleRequest) -> CivicScanResult<Schedule> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(CivicScanError::validation("schedule name is required"));
        }
        let scope = self.validated_scope(&request.jurisdictions, &request.data_types)?;
        let next_run_at = next_fire(&request.cron_expression, Utc::now())?;

        let schedule = self
            .store
            .insert_schedule(&NewSchedule {
                name: name.to_string(),
                cron_expression: request.cron_expression.trim().to_string(),
                scope,
                depth: request.depth,
                is_active: request.is_active,
                next_run_at,
            })
            .await?;

        info!(
            schedule_id = %schedule.id,
            cron = schedule.cron_expression.as_str(),
            next_run_at = %schedule.next_run_at,
            "Schedule created"
        );
        Ok(schedule)
    }

    pub async fn update_schedule(
        &self,
        id: Uuid,
        update: &ScheduleUpdate,
    ) -> CivicScanResult<Schedule> {
        let Some(mut schedule) = self.store.get_schedule(id).await? else {
            return Err(CivicScanError::NotFound(format!("schedule {id}")));
        };
        let was_active = schedule.is_active;

        if let Some(name) = &update.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(CivicScanError::validation("schedule name is required"));
            }
            schedule.name = name.to_string();
        }
        if update.jurisdictions.is_some() || update.data_types.is_some() {
            let jurisdictions = update
                .jurisdictions
                .as_ref()
                .unwrap_or(&schedule.scope.jurisdictions);
            let data_types = update
                .data_types
                .as_ref()
                .unwrap_or(&schedule.scope.data_types);
            schedule.scope = self.validated_scope(jurisdictions, data_types)?;
        }
        if let Some(depth) = update.depth {
            schedule.depth = depth;
        }
        if let Some(active) = update.is_active {
            schedule.is_active = active;
        }

        let reactivated = schedule.is_active && !was_active;
        match &update.cron_expression {
            Some(expression) => {
                schedule.next_run_at = next_fire(expression, Utc::now())?;
                schedule.cron_expression = expression.trim().to_string();
            }
            None if reactivated => {
                schedule.next_run_at = next_fire(&schedule.cron_expression, Utc::now())?;
            }
            None => {}
        }

        let updated = self
            .store
            .update_schedule(&schedule)
            .await?
            .ok_or_else(|| CivicScanError::NotFound(format!("schedule {id}")))?;

        info!(
            schedule_id = %id,
            active = updated.is_active,
            next_run_at = %updated.next_run_at,
            "Schedule updated"
        );
        Ok(updated)
    }

    /// Past jobs keep their rows; only the schedule is removed.
    pub async fn delete_schedule(&self, id: Uuid) -> CivicScanResult<()> {
        if !self.store.delete_schedule(id).await? {
            return Err(CivicScanError::NotFound(format!("schedule {id}")));
        }
        info!(schedule_id = %id, "Schedule deleted");
        Ok(())
    }

    pub async fn get_schedule(&self, id: Uuid) -> CivicScanResult<Option<Schedule>> {
        Ok(self.store.get_schedule(id).await?)
    }

    /// Active schedules due within the next `hours`, soonest first.
    pub async fn get_upcoming_schedules(&self, hours: u32) -> CivicScanResult<Vec<Schedule>> {
        if hours > MAX_UPCOMING_HOURS {
            return Err(CivicScanError::validation(format!(
                "hours must be at most {MAX_UPCOMING_HOURS}, got {hours}"
            )));
        }
        let until = Utc::now()
            .checked_add_signed(chrono::Duration::hours(i64::from(hours)))
            .ok_or_else(|| CivicScanError::validation("hours window out of range"))?;
        Ok(self.store.upcoming_schedules(until).await?)
    }

    /// Fire every active schedule whose `next_run_at` has passed.
    ///
    /// Each schedule is stamped with a fresh `next_run_at` whether its
    /// submission went through, conflicted, or failed.
    pub async fn run_due(&self, now: DateTime<Utc>) -> CivicScanResult<PollReport> {
        let due = self.store.due_schedules(now).await?;
        let mut report = PollReport::default();

        for schedule in &due {
            report.fired += 1;

            match self.submitter.submit_scheduled(schedule).await {
                Ok(job_ids) => {
                    report.submitted += 1;
                    info!(
                        schedule_id = %schedule.id,
                        jobs = job_ids.len(),
                        "Schedule fired"
                    );
                }
                Err(CivicScanError::Conflict { job_id, .. }) => {
                    report.conflicts += 1;
                    info!(
                        schedule_id = %schedule.id,
                        conflicting_job = %job_id,
                        "Schedule skipped: scope already active"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    error!(schedule_id = %schedule.id, error = %e, "Scheduled submission failed");
                }
            }

            if let Err(e) = self.advance(schedule, now).await {
                error!(schedule_id = %schedule.id, error = %e, "Failed to advance schedule");
            }
        }

        Ok(report)
    }

    async fn advance(&self, schedule: &Schedule, now: DateTime<Utc>) -> CivicScanResult<()> {
        let next_run_at = next_fire(&schedule.cron_expression, now)?;
        if !self
            .store
            .record_schedule_run(schedule.id, now, next_run_at)
            .await?
        {
            warn!(schedule_id = %schedule.id, "Schedule vanished before its run was recorded");
        }
        Ok(())
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.poll_interval, "Schedule engine started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_due(Utc::now()).await {
                        Ok(report) if report.fired > 0 => info!(?report, "Schedule poll complete"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Schedule poll failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Schedule engine stopped");
    }

    fn validated_scope(&self, jurisdictions: &[String], data_types: &[String]) -> CivicScanResult<Scope> {
        validate_scopes(jurisdictions, data_types, self.max_jurisdictions)?;
        Ok(Scope::new(jurisdictions, data_types))
    }
}
