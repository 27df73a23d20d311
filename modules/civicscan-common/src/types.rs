use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

// --- Job lifecycle ---

/// Canonical job status vocabulary exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Statuses that hold a scope: at most one such job per scope signature.
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Queued, JobStatus::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// queued → running → {succeeded | failed}. Nothing skips, nothing reverses.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// How deep the research routine should dig.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    #[default]
    Summary,
    Full,
}

impl Depth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Depth::Summary => "summary",
            Depth::Full => "full",
        }
    }
}

impl std::fmt::Display for Depth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Depth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "summary" => Ok(Depth::Summary),
            "full" => Ok(Depth::Full),
            other => Err(format!("unknown depth: {other}")),
        }
    }
}

/// What put a job on the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    #[default]
    Manual,
    Schedule,
}

impl JobTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTrigger::Manual => "manual",
            JobTrigger::Schedule => "schedule",
        }
    }
}

impl FromStr for JobTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(JobTrigger::Manual),
            "schedule" => Ok(JobTrigger::Schedule),
            other => Err(format!("unknown job trigger: {other}")),
        }
    }
}

// --- Scope ---

/// Jurisdiction set + data-type set targeted by one job or schedule.
///
/// Construction normalizes: jurisdictions upper-cased, data types lower-cased,
/// both trimmed, sorted and deduplicated. Blank entries are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub jurisdictions: Vec<String>,
    pub data_types: Vec<String>,
}

impl Scope {
    pub fn new<J, D>(jurisdictions: J, data_types: D) -> Self
    where
        J: IntoIterator,
        J::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let jurisdictions: BTreeSet<String> = jurisdictions
            .into_iter()
            .map(|j| j.as_ref().trim().to_uppercase())
            .filter(|j| !j.is_empty())
            .collect();
        let data_types: BTreeSet<String> = data_types
            .into_iter()
            .map(|d| d.as_ref().trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self {
            jurisdictions: jurisdictions.into_iter().collect(),
            data_types: data_types.into_iter().collect(),
        }
    }

    /// Single-jurisdiction scope, the unit one job runs over.
    pub fn single<D>(jurisdiction: &str, data_types: D) -> Self
    where
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        Self::new([jurisdiction], data_types)
    }

    pub fn is_empty(&self) -> bool {
        self.jurisdictions.is_empty() || self.data_types.is_empty()
    }

    /// `CA,TX|emissions,permits`. Identical scopes always share a signature.
    pub fn signature(&self) -> String {
        format!(
            "{}|{}",
            self.jurisdictions.join(","),
            self.data_types.join(",")
        )
    }

    /// Whether both the jurisdiction sets and the data-type sets share a member.
    pub fn intersects(&self, other: &Scope) -> bool {
        let shares = |a: &[String], b: &[String]| a.iter().any(|x| b.contains(x));
        shares(&self.jurisdictions, &other.jurisdictions)
            && shares(&self.data_types, &other.data_types)
    }

    pub fn conflicts_with(&self, other: &Scope, policy: OverlapPolicy) -> bool {
        match policy {
            OverlapPolicy::Exact => self == other,
            OverlapPolicy::Intersect => self.intersects(other),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.signature())
    }
}

/// When two scopes count as overlapping for the active-job check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Only identical scope signatures conflict.
    #[default]
    Exact,
    /// Any shared jurisdiction combined with any shared data type conflicts.
    Intersect,
}

impl FromStr for OverlapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(OverlapPolicy::Exact),
            "intersect" | "intersection" => Ok(OverlapPolicy::Intersect),
            other => Err(format!("unknown overlap policy: {other}")),
        }
    }
}

// --- Jobs ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub scope: Scope,
    pub depth: Depth,
    pub status: JobStatus,
    pub trigger: JobTrigger,
    pub schedule_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_count: u32,
    pub artifact_count: u32,
    pub error_message: Option<String>,
}

/// Parameters for inserting a new job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub scope: Scope,
    pub depth: Depth,
    pub trigger: JobTrigger,
    pub schedule_id: Option<Uuid>,
}

/// Caller-facing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub jurisdictions: Vec<String>,
    pub data_types: Vec<String>,
    pub depth: Depth,
    pub status: JobStatus,
    pub trigger: JobTrigger,
    pub schedule_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result_count: u32,
    pub artifact_count: u32,
    pub error_message: Option<String>,
}

impl From<Job> for JobSummary {
    fn from(job: Job) -> Self {
        let duration_ms = match (job.started_at, job.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };
        Self {
            id: job.id,
            jurisdictions: job.scope.jurisdictions,
            data_types: job.scope.data_types,
            depth: job.depth,
            status: job.status,
            trigger: job.trigger,
            schedule_id: job.schedule_id,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            duration_ms,
            result_count: job.result_count,
            artifact_count: job.artifact_count,
            error_message: job.error_message,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub jurisdiction: Option<String>,
    pub limit: Option<u32>,
}

// --- Research output ---

/// A record surfaced by the research routine, before deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct Candidate {
    #[builder(setter(into))]
    pub jurisdiction: String,
    #[serde(rename = "type")]
    #[builder(setter(into))]
    pub program_type: String,
    #[builder(setter(into))]
    pub title: String,
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub summary: Option<String>,
    #[serde(default, alias = "sourceUrl")]
    #[builder(default, setter(strip_option, into))]
    pub source_url: Option<String>,
    #[serde(default, alias = "lastUpdated", deserialize_with = "deserialize_flexible_date")]
    #[builder(default, setter(strip_option))]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    #[builder(default)]
    pub artifacts: Vec<CandidateArtifact>,
}

/// Evidence document the research routine fetched (or tried to) for a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateArtifact {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub fetched: bool,
}

fn default_true() -> bool {
    true
}

/// Accepts RFC 3339 timestamps or bare `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_flexible_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn deserialize_flexible_date<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_flexible_date(s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("unrecognized date: {s}"))),
    }
}

// --- Programs ---

/// Canonical deduplicated record, one row per stable key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub id: Uuid,
    pub stable_key: String,
    pub jurisdiction: String,
    #[serde(rename = "type")]
    pub program_type: String,
    pub title: String,
    pub summary: Option<String>,
    pub source_url: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Parameters for inserting a new program row.
#[derive(Debug, Clone)]
pub struct NewProgram {
    pub stable_key: String,
    pub jurisdiction: String,
    pub program_type: String,
    pub title: String,
    pub summary: Option<String>,
    pub source_url: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub seen_at: DateTime<Utc>,
}

/// Field changes applied to an existing program on re-encounter.
/// `None` leaves the stored value untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramUpdate {
    pub seen_at: DateTime<Utc>,
    pub summary: Option<String>,
    pub source_url: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// AND-combined filter over the program registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultFilter {
    pub jurisdiction: Option<String>,
    pub program_type: Option<String>,
    pub job_id: Option<Uuid>,
    /// Programs seen at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

// --- Artifacts ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Fetched,
    Failed,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Fetched => "fetched",
            ArtifactStatus::Failed => "failed",
        }
    }
}

impl FromStr for ArtifactStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetched" => Ok(ArtifactStatus::Fetched),
            "failed" => Ok(ArtifactStatus::Failed),
            other => Err(format!("unknown artifact status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub job_id: Uuid,
    pub program_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub url: String,
    pub status: ArtifactStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub job_id: Uuid,
    pub program_id: Option<Uuid>,
    pub artifact_type: String,
    pub url: String,
    pub status: ArtifactStatus,
}

// --- Change records ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    New,
    Updated,
    Removed,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::New => "new",
            ChangeType::Updated => "updated",
            ChangeType::Removed => "removed",
        }
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ChangeType::New),
            "updated" => Ok(ChangeType::Updated),
            "removed" => Ok(ChangeType::Removed),
            other => Err(format!("unknown change type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub program_id: Option<Uuid>,
    pub change_type: ChangeType,
    pub diff: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
    pub job_id: Uuid,
    pub program_id: Option<Uuid>,
    pub change_type: ChangeType,
    pub diff: serde_json::Value,
}

// --- Schedules ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub scope: Scope,
    pub depth: Depth,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated schedule ready to be written. `next_run_at` is already computed.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub cron_expression: String,
    pub scope: Scope,
    pub depth: Depth,
    pub is_active: bool,
    pub next_run_at: DateTime<Utc>,
}
