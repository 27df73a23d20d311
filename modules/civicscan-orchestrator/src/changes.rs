//! Change detection between a stored program and a fresh candidate.
//!
//! Pure functions; the lifecycle manager persists what they return.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use civicscan_common::{Candidate, ChangeType, Program};

/// A change to record, before it is attached to a job.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedChange {
    pub change_type: ChangeType,
    pub diff: Value,
}

/// `new` for a first sighting, `updated` when any compared field differs,
/// nothing otherwise.
pub fn detect(previous: Option<&Program>, candidate: &Candidate) -> Option<DetectedChange> {
    let Some(old) = previous else {
        return Some(DetectedChange {
            change_type: ChangeType::New,
            diff: json!({ "new": candidate }),
        });
    };

    let diff = field_diff(old, candidate);
    if diff.is_empty() {
        return None;
    }
    Some(DetectedChange {
        change_type: ChangeType::Updated,
        diff: Value::Object(diff),
    })
}

/// `{field: {old, new}}` for each of title, summary, sourceUrl, lastUpdated
/// that differs. Strings compare trimmed; empty and absent are the same.
pub fn field_diff(old: &Program, candidate: &Candidate) -> Map<String, Value> {
    let mut diff = Map::new();

    let mut text = |field: &str, old: Option<&str>, new: Option<&str>| {
        if present(old) != present(new) {
            diff.insert(
                field.to_string(),
                json!({ "old": present(old), "new": present(new) }),
            );
        }
    };
    text("title", Some(old.title.as_str()), Some(candidate.title.as_str()));
    text("summary", old.summary.as_deref(), candidate.summary.as_deref());
    text(
        "sourceUrl",
        old.source_url.as_deref(),
        candidate.source_url.as_deref(),
    );

    if !same_instant(old.last_updated, candidate.last_updated) {
        diff.insert(
            "lastUpdated".to_string(),
            json!({ "old": old.last_updated, "new": candidate.last_updated }),
        );
    }

    diff
}

/// Previously known program ids missing from the current run.
pub fn removed(previous: &[Uuid], current: &HashSet<Uuid>) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    previous
        .iter()
        .filter(|id| !current.contains(*id) && seen.insert(**id))
        .copied()
        .collect()
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn same_instant(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    a.map(|d| d.timestamp_micros()) == b.map(|d| d.timestamp_micros())
}
