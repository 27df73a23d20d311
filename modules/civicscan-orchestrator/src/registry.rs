use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use civicscan_common::stable_key::{normalize_jurisdiction, normalize_type};
use civicscan_common::{stable_key, Candidate, NewProgram, Program, ProgramUpdate, ResultFilter};
use civicscan_store::ResearchStore;

/// Result of registering one candidate.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub program: Program,
    /// The stored record before this upsert; `None` when it was just created.
    pub previous: Option<Program>,
}

impl UpsertOutcome {
    pub fn is_new(&self) -> bool {
        self.previous.is_none()
    }
}

/// Deduplicated program registry keyed by stable key. Rows are never deleted.
#[derive(Clone)]
pub struct ProgramRegistry {
    store: Arc<dyn ResearchStore>,
}

impl ProgramRegistry {
    pub fn new(store: Arc<dyn ResearchStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, candidate: &Candidate, now: DateTime<Utc>) -> Result<UpsertOutcome> {
        let key = stable_key(candidate);

        if let Some(existing) = self.store.find_program_by_key(&key).await? {
            return self.refresh(existing, candidate, now).await;
        }

        match self.store.insert_program(&new_program(key.clone(), candidate, now)).await? {
            Some(program) => {
                debug!(program_id = %program.id, stable_key = key.as_str(), "Program registered");
                Ok(UpsertOutcome {
                    program,
                    previous: None,
                })
            }
            None => {
                // Lost an insert race on the unique key; the winner's row is the one to update.
                let existing = self
                    .store
                    .find_program_by_key(&key)
                    .await?
                    .ok_or_else(|| anyhow!("program {key} missing after conflicting insert"))?;
                self.refresh(existing, candidate, now).await
            }
        }
    }

    async fn refresh(
        &self,
        existing: Program,
        candidate: &Candidate,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let update = merge(&existing, candidate, now);
        let program = self.store.update_program(existing.id, &update).await?;
        Ok(UpsertOutcome {
            program,
            previous: Some(existing),
        })
    }

    pub async fn list(&self, filter: &ResultFilter) -> Result<Vec<Program>> {
        self.store.list_programs(filter).await
    }
}

/// Fields to overwrite on re-encounter: `last_updated` only when strictly
/// newer, summary and source URL only when non-empty and different.
pub fn merge(existing: &Program, candidate: &Candidate, now: DateTime<Utc>) -> ProgramUpdate {
    let last_updated = candidate
        .last_updated
        .filter(|incoming| existing.last_updated.map_or(true, |stored| incoming > &stored));

    ProgramUpdate {
        seen_at: now,
        summary: replacement(existing.summary.as_deref(), candidate.summary.as_deref()),
        source_url: replacement(existing.source_url.as_deref(), candidate.source_url.as_deref()),
        last_updated,
    }
}

fn replacement(stored: Option<&str>, incoming: Option<&str>) -> Option<String> {
    let incoming = incoming.map(str::trim).filter(|v| !v.is_empty())?;
    if stored.map(str::trim) == Some(incoming) {
        None
    } else {
        Some(incoming.to_string())
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn new_program(stable_key: String, candidate: &Candidate, now: DateTime<Utc>) -> NewProgram {
    NewProgram {
        stable_key,
        jurisdiction: normalize_jurisdiction(&candidate.jurisdiction),
        program_type: normalize_type(&candidate.program_type),
        title: candidate.title.trim().to_string(),
        summary: non_empty(candidate.summary.as_deref()),
        source_url: non_empty(candidate.source_url.as_deref()),
        last_updated: candidate.last_updated,
        seen_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use civicscan_store::MemoryStore;

    fn candidate() -> Candidate {
        Candidate::builder()
            .jurisdiction("ca")
            .program_type("Emissions")
            .title("Cap-and-Trade Program")
            .summary("Market-based program")
            .source_url("https://ww2.arb.ca.gov/ct")
            .last_updated(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap())
            .build()
    }

    fn registry() -> ProgramRegistry {
        ProgramRegistry::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn same_key_twice_yields_one_program() {
        let registry = registry();
        let now = Utc::now();

        let first = registry.upsert(&candidate(), now).await.unwrap();
        assert!(first.is_new());
        assert_eq!(first.program.jurisdiction, "CA");
        assert_eq!(first.program.program_type, "emissions");

        let second = registry
            .upsert(&candidate(), now + Duration::minutes(5))
            .await
            .unwrap();
        assert!(!second.is_new());
        assert_eq!(second.program.id, first.program.id);
        assert_eq!(second.program.first_seen_at, first.program.first_seen_at);
        assert_eq!(second.program.last_seen_at, now + Duration::minutes(5));

        let all = registry.list(&ResultFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn last_seen_never_decreases() {
        let registry = registry();
        let now = Utc::now();
        registry.upsert(&candidate(), now).await.unwrap();
        let stale = registry
            .upsert(&candidate(), now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(stale.program.last_seen_at, now);
    }

    #[test]
    fn merge_only_takes_strictly_newer_dates() {
        let now = Utc::now();
        let existing = Program {
            id: uuid::Uuid::new_v4(),
            stable_key: "k".into(),
            jurisdiction: "CA".into(),
            program_type: "emissions".into(),
            title: "Cap-and-Trade Program".into(),
            summary: Some("Market-based program".into()),
            source_url: Some("https://ww2.arb.ca.gov/ct".into()),
            last_updated: Some(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()),
            first_seen_at: now,
            last_seen_at: now,
        };

        let same = merge(&existing, &candidate(), now);
        assert_eq!(same.last_updated, None);
        assert_eq!(same.summary, None);
        assert_eq!(same.source_url, None);

        let mut older = candidate();
        older.last_updated = Some(Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap());
        assert_eq!(merge(&existing, &older, now).last_updated, None);

        let mut newer = candidate();
        newer.last_updated = Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        newer.summary = Some("  ".into());
        newer.source_url = Some("https://ww2.arb.ca.gov/cap-and-trade".into());
        let update = merge(&existing, &newer, now);
        assert_eq!(update.last_updated, newer.last_updated);
        assert_eq!(update.summary, None);
        assert_eq!(
            update.source_url.as_deref(),
            Some("https://ww2.arb.ca.gov/cap-and-trade")
        );
    }
}
