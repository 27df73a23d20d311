//! Broker job states and their canonical translation.
//!
//! `BROKER_STATUS_TABLE` is the only place broker vocabulary becomes
//! `JobStatus`; both directions are read from it.

use civicscan_common::JobStatus;
use tracing::warn;

const BROKER_STATUS_TABLE: &[(&str, JobStatus)] = &[
    ("waiting", JobStatus::Queued),
    ("delayed", JobStatus::Queued),
    ("paused", JobStatus::Queued),
    ("active", JobStatus::Running),
    ("completed", JobStatus::Succeeded),
    ("failed", JobStatus::Failed),
];

/// Translate a broker state to the canonical vocabulary. Unknown states count as queued.
pub fn canonical_status(broker_state: &str) -> JobStatus {
    BROKER_STATUS_TABLE
        .iter()
        .find(|(state, _)| *state == broker_state)
        .map(|(_, status)| *status)
        .unwrap_or_else(|| {
            warn!(state = broker_state, "Unknown broker job state, treating as queued");
            JobStatus::Queued
        })
}

/// Broker states that translate to any of the given canonical statuses.
pub fn broker_states_for(statuses: &[JobStatus]) -> Vec<&'static str> {
    BROKER_STATUS_TABLE
        .iter()
        .filter(|(_, status)| statuses.contains(status))
        .map(|(state, _)| *state)
        .collect()
}
