// Test mocks and fixtures for the orchestrator.
//
// - MockResearcher (Researcher): per-jurisdiction canned candidates, errors,
//   panics and delays
// - candidate()/CandidateExt: concise Candidate construction
// - TestHarness: MemoryStore + StoreQueue + Orchestrator wired together

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use uuid::Uuid;

use civicscan_common::{Candidate, CandidateArtifact, Depth, JobStatus, OverlapPolicy};
use civicscan_store::MemoryStore;

use crate::lifecycle::JobLifecycleManager;
use crate::orchestrator::Orchestrator;
use crate::queue::{QueueGateway, StoreQueue};
use crate::research::Researcher;

// ---------------------------------------------------------------------------
// MockResearcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Scripted {
    Candidates(Vec<Candidate>),
    Error(String),
    Panic,
}

/// Returns scripted results per jurisdiction. Unscripted jurisdictions yield
/// an empty candidate list.
pub struct MockResearcher {
    scripts: Mutex<HashMap<String, Scripted>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockResearcher {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn on(self, jurisdiction: &str, candidates: Vec<Candidate>) -> Self {
        self.set(jurisdiction, candidates);
        self
    }

    pub fn fail_on(self, jurisdiction: &str, message: &str) -> Self {
        self.script(jurisdiction, Scripted::Error(message.to_string()));
        self
    }

    pub fn panic_on(self, jurisdiction: &str) -> Self {
        self.script(jurisdiction, Scripted::Panic);
        self
    }

    /// Sleep this long before answering every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replace the candidates for a jurisdiction between runs.
    pub fn set(&self, jurisdiction: &str, candidates: Vec<Candidate>) {
        self.script(jurisdiction, Scripted::Candidates(candidates));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn script(&self, jurisdiction: &str, scripted: Scripted) {
        self.scripts
            .lock()
            .unwrap()
            .insert(jurisdiction.to_uppercase(), scripted);
    }
}

impl Default for MockResearcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Researcher for MockResearcher {
    async fn research(
        &self,
        jurisdiction: &str,
        _data_types: &[String],
        _depth: Depth,
    ) -> Result<Vec<Candidate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get(&jurisdiction.to_uppercase())
            .cloned();

        match scripted {
            None => Ok(Vec::new()),
            Some(Scripted::Candidates(candidates)) => Ok(candidates),
            Some(Scripted::Error(message)) => bail!("MockResearcher: {message}"),
            Some(Scripted::Panic) => panic!("MockResearcher: scripted panic for {jurisdiction}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Candidate fixtures
// ---------------------------------------------------------------------------

/// Candidate with a source URL derived from the title.
pub fn candidate(jurisdiction: &str, program_type: &str, title: &str) -> Candidate {
    let slug = title.to_lowercase().replace(' ', "-");
    Candidate::builder()
        .jurisdiction(jurisdiction)
        .program_type(program_type)
        .title(title)
        .source_url(format!(
            "https://{}.gov/programs/{slug}",
            jurisdiction.to_lowercase()
        ))
        .build()
}

pub trait CandidateExt {
    fn with_summary(self, summary: &str) -> Self;
    fn with_artifact(self, artifact_type: &str) -> Self;
}

impl CandidateExt for Candidate {
    fn with_summary(mut self, summary: &str) -> Self {
        self.summary = Some(summary.to_string());
        self
    }

    fn with_artifact(mut self, artifact_type: &str) -> Self {
        let url = self.source_url.clone().unwrap_or_default();
        self.artifacts.push(CandidateArtifact {
            artifact_type: artifact_type.to_string(),
            url,
            fetched: true,
        });
        self
    }
}

// ---------------------------------------------------------------------------
// TestHarness
// ---------------------------------------------------------------------------

/// In-memory orchestrator on the durable-store queue.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub researcher: Arc<MockResearcher>,
    pub queue: Arc<dyn QueueGateway>,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestHarness {
    pub fn new(researcher: MockResearcher) -> Self {
        Self::with_policy(researcher, OverlapPolicy::Exact)
    }

    pub fn with_policy(researcher: MockResearcher, policy: OverlapPolicy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let researcher = Arc::new(researcher);
        let lifecycle = Arc::new(JobLifecycleManager::new(
            store.clone(),
            researcher.clone(),
            Duration::from_secs(2),
        ));
        let queue: Arc<dyn QueueGateway> = Arc::new(StoreQueue::new(store.clone(), lifecycle));
        let orchestrator = Arc::new(Orchestrator::new(store.clone(), queue.clone(), policy, 60));
        Self {
            store,
            researcher,
            queue,
            orchestrator,
        }
    }

    /// Poll until every job is terminal. Panics after `timeout`.
    pub async fn wait_for_terminal(&self, ids: &[Uuid], timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut done = true;
            for id in ids {
                let job = self.orchestrator.get_job(*id).await.unwrap();
                if !job.map(|j| j.status.is_terminal()).unwrap_or(false) {
                    done = false;
                }
            }
            if done {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("jobs {ids:?} not terminal after {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Statuses observed for a job, in order, while polling until terminal.
    pub async fn observe_statuses(&self, id: Uuid, timeout: Duration) -> Vec<JobStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut seen: Vec<JobStatus> = Vec::new();
        loop {
            if let Some(job) = self.orchestrator.get_job(id).await.unwrap() {
                if seen.last() != Some(&job.status) {
                    seen.push(job.status);
                }
                if job.status.is_terminal() {
                    return seen;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("job {id} not terminal after {timeout:?}; saw {seen:?}");
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}
