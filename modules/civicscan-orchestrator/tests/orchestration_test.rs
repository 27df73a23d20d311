//! End-to-end orchestration on the durable-store queue with an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use civicscan_common::{
    ChangeType, CivicScanError, Config, Depth, JobFilter, JobStatus, OverlapPolicy, ResultFilter,
};
use civicscan_orchestrator::testing::{candidate, MockResearcher, TestHarness};
use civicscan_orchestrator::{
    connect_queue, JobLifecycleManager, Orchestrator, QueueBackend, QueueGateway, ScheduleEngine,
    ScheduleRequest, SubmitRequest,
};
use civicscan_store::MemoryStore;

const WAIT: Duration = Duration::from_secs(5);

fn request(jurisdictions: &[&str]) -> SubmitRequest {
    SubmitRequest {
        jurisdictions: jurisdictions.iter().map(|j| j.to_string()).collect(),
        data_types: vec!["emissions".to_string()],
        depth: Depth::Summary,
    }
}

fn two_state_researcher() -> MockResearcher {
    MockResearcher::new()
        .on(
            "CA",
            vec![
                candidate("CA", "emissions", "Cap-and-Trade Program"),
                // Same program again with noisy casing and a tracking parameter.
                candidate("ca", "Emissions", "  cap-and-trade   program ").tap_url(
                    "http://CA.gov/programs/cap-and-trade-program/?utm_source=newsletter",
                ),
            ],
        )
        .on(
            "TX",
            vec![candidate("TX", "emissions", "Texas Emissions Reduction Plan")],
        )
}

trait TapUrl {
    fn tap_url(self, url: &str) -> Self;
}

impl TapUrl for civicscan_common::Candidate {
    fn tap_url(mut self, url: &str) -> Self {
        self.source_url = Some(url.to_string());
        self
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_states_produce_two_successful_jobs_with_deduplicated_results() {
    let harness = TestHarness::new(two_state_researcher());

    let request: SubmitRequest = serde_json::from_value(serde_json::json!({
        "states": ["CA", "TX"],
        "dataTypes": ["emissions"],
        "depth": "summary"
    }))
    .unwrap();
    let ids = harness.orchestrator.submit_job(&request).await.unwrap();
    assert_eq!(ids.len(), 2);

    harness.wait_for_terminal(&ids, WAIT).await;
    for id in &ids {
        let job = harness.orchestrator.get_job(*id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded, "job {id}: {:?}", job.error_message);
        assert!(job.duration_ms.is_some());
    }

    let ca = harness
        .orchestrator
        .get_results(&ResultFilter {
            jurisdiction: Some("ca".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(ca.len(), 1, "both CA candidates share a stable key");

    let tx = harness
        .orchestrator
        .get_results(&ResultFilter {
            jurisdiction: Some("TX".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(tx.len(), 1);
}

#[tokio::test]
async fn resubmitting_while_active_is_a_conflict() {
    let harness = TestHarness::new(two_state_researcher().with_delay(Duration::from_millis(300)));

    let ids = harness
        .orchestrator
        .submit_job(&request(&["CA", "TX"]))
        .await
        .unwrap();

    let err = harness
        .orchestrator
        .submit_job(&request(&["TX"]))
        .await
        .unwrap_err();
    match err {
        CivicScanError::Conflict {
            requested, job_id, ..
        } => {
            assert_eq!(requested, "TX|emissions");
            assert!(ids.contains(&job_id));
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    // A partially overlapping submission is rejected as a whole.
    let before = harness.store.all_jobs().len();
    assert!(harness
        .orchestrator
        .submit_job(&request(&["NY", "CA"]))
        .await
        .is_err());
    assert_eq!(harness.store.all_jobs().len(), before);

    harness.wait_for_terminal(&ids, WAIT).await;
    let again = harness
        .orchestrator
        .submit_job(&request(&["CA", "TX"]))
        .await
        .unwrap();
    assert_eq!(again.len(), 2);
}

#[tokio::test]
async fn failed_job_releases_its_scope() {
    let harness = TestHarness::new(MockResearcher::new().fail_on("CA", "service down"));

    let ids = harness.orchestrator.submit_job(&request(&["CA"])).await.unwrap();
    harness.wait_for_terminal(&ids, WAIT).await;

    let job = harness.orchestrator.get_job(ids[0]).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("service down"));

    assert!(harness.orchestrator.submit_job(&request(&["CA"])).await.is_ok());
}

#[tokio::test]
async fn one_state_failing_does_not_affect_the_other() {
    let researcher = MockResearcher::new()
        .panic_on("CA")
        .on("TX", vec![candidate("TX", "emissions", "Texas Emissions Reduction Plan")]);
    let harness = TestHarness::new(researcher);

    let ids = harness
        .orchestrator
        .submit_job(&request(&["CA", "TX"]))
        .await
        .unwrap();
    harness.wait_for_terminal(&ids, WAIT).await;

    let failed = harness
        .orchestrator
        .get_jobs(&JobFilter {
            status: Some(JobStatus::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    let succeeded = harness
        .orchestrator
        .get_jobs(&JobFilter {
            status: Some(JobStatus::Succeeded),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].jurisdictions, vec!["CA"]);
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].jurisdictions, vec!["TX"]);
}

#[tokio::test]
async fn intersect_policy_rejects_shared_jurisdiction() {
    let harness = TestHarness::with_policy(
        MockResearcher::new().with_delay(Duration::from_millis(300)),
        OverlapPolicy::Intersect,
    );

    let ids = harness.orchestrator.submit_job(&request(&["CA"])).await.unwrap();

    let overlapping = SubmitRequest {
        jurisdictions: vec!["CA".to_string()],
        data_types: vec!["emissions".to_string(), "permits".to_string()],
        depth: Depth::Summary,
    };
    assert!(matches!(
        harness.orchestrator.submit_job(&overlapping).await,
        Err(CivicScanError::Conflict { .. })
    ));

    // Different data type shares no member, so it is accepted.
    let disjoint = SubmitRequest {
        jurisdictions: vec!["CA".to_string()],
        data_types: vec!["permits".to_string()],
        depth: Depth::Summary,
    };
    let other = harness.orchestrator.submit_job(&disjoint).await.unwrap();

    harness
        .wait_for_terminal(&[ids, other].concat(), WAIT)
        .await;
}

#[tokio::test]
async fn exact_policy_allows_a_different_scope_over_the_same_state() {
    let harness = TestHarness::new(MockResearcher::new().with_delay(Duration::from_millis(300)));

    let first = harness.orchestrator.submit_job(&request(&["CA"])).await.unwrap();
    let wider = SubmitRequest {
        jurisdictions: vec!["CA".to_string()],
        data_types: vec!["emissions".to_string(), "permits".to_string()],
        depth: Depth::Summary,
    };
    let second = harness.orchestrator.submit_job(&wider).await.unwrap();

    harness.wait_for_terminal(&[first, second].concat(), WAIT).await;
}

#[tokio::test]
async fn validation_errors_write_nothing() {
    let harness = TestHarness::new(MockResearcher::new());

    for bad in [request(&[]), request(&["  "])] {
        assert!(matches!(
            harness.orchestrator.submit_job(&bad).await,
            Err(CivicScanError::Validation(_))
        ));
    }
    let no_types = SubmitRequest {
        jurisdictions: vec!["CA".to_string()],
        data_types: vec![],
        depth: Depth::Summary,
    };
    assert!(matches!(
        harness.orchestrator.submit_job(&no_types).await,
        Err(CivicScanError::Validation(_))
    ));
    assert!(harness.store.all_jobs().is_empty());
}

// ---------------------------------------------------------------------------
// Deltas
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deltas_report_new_then_updated_then_removed() {
    let researcher = MockResearcher::new().on(
        "CA",
        vec![
            candidate("CA", "emissions", "Cap-and-Trade Program"),
            candidate("CA", "emissions", "Clean Cars Rebate"),
        ],
    );
    let harness = TestHarness::new(researcher);
    let start = Utc::now();

    let first = harness.orchestrator.submit_job(&request(&["CA"])).await.unwrap();
    harness.wait_for_terminal(&first, WAIT).await;

    let mut changed = candidate("CA", "emissions", "Cap-and-Trade Program");
    changed.summary = Some("Extended through 2045".to_string());
    harness.researcher.set("CA", vec![changed]);

    let second = harness.orchestrator.submit_job(&request(&["CA"])).await.unwrap();
    harness.wait_for_terminal(&second, WAIT).await;

    let deltas = harness.orchestrator.get_deltas(start).await.unwrap();
    let kinds: Vec<ChangeType> = deltas.iter().map(|c| c.change_type).collect();
    assert_eq!(
        kinds.iter().filter(|k| **k == ChangeType::New).count(),
        2,
        "{kinds:?}"
    );
    assert_eq!(kinds.iter().filter(|k| **k == ChangeType::Updated).count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == ChangeType::Removed).count(), 1);

    let updated = deltas
        .iter()
        .find(|c| c.change_type == ChangeType::Updated)
        .unwrap();
    let fields: Vec<&String> = updated.diff.as_object().unwrap().keys().collect();
    assert_eq!(fields, vec!["summary"]);

    // The removed program is still in the registry.
    let all = harness
        .orchestrator
        .get_results(&ResultFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    // Results for the second job only include what it surfaced.
    let linked = harness
        .orchestrator
        .get_results(&ResultFilter {
            job_id: Some(second[0]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(linked.len(), 1);
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreachable_broker_falls_back_to_store_queue() {
    let store = Arc::new(MemoryStore::new());
    let researcher = Arc::new(
        MockResearcher::new()
            .on("CA", vec![candidate("CA", "emissions", "Cap-and-Trade Program")])
            .with_delay(Duration::from_millis(100)),
    );
    let lifecycle = Arc::new(JobLifecycleManager::new(
        store.clone(),
        researcher,
        Duration::from_secs(2),
    ));
    let config = Config {
        broker_url: Some("http://127.0.0.1:1".to_string()),
        broker_probe_timeout: Duration::from_secs(1),
        ..Config::default()
    };

    let queue = connect_queue(&config, store.clone(), lifecycle).await;
    assert_eq!(queue.backend(), QueueBackend::Store);

    let orchestrator = Orchestrator::new(store.clone(), queue.clone(), OverlapPolicy::Exact, 60);
    let ids = orchestrator.submit_job(&request(&["CA"])).await.unwrap();

    let handle = queue.get_job(ids[0]).await.unwrap().unwrap();
    assert_eq!(handle.id, ids[0]);

    let mut seen: Vec<JobStatus> = Vec::new();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let jobs = orchestrator.get_jobs(&JobFilter::default()).await.unwrap();
        let status = jobs[0].status;
        if seen.last() != Some(&status) {
            seen.push(status);
        }
        if status.is_terminal() || tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        seen,
        vec![JobStatus::Queued, JobStatus::Running, JobStatus::Succeeded]
    );

    orchestrator.shutdown().await;
    assert!(orchestrator.submit_job(&request(&["TX"])).await.is_err());
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn due_schedule_submits_through_the_overlap_guard() {
    let harness = TestHarness::new(
        MockResearcher::new()
            .on("CA", vec![candidate("CA", "emissions", "Cap-and-Trade Program")])
            .with_delay(Duration::from_millis(300)),
    );
    let engine = ScheduleEngine::new(
        harness.store.clone(),
        harness.orchestrator.clone(),
        Duration::from_secs(60),
        60,
    );

    let schedule = engine
        .create_schedule(&ScheduleRequest {
            name: "nightly CA".to_string(),
            cron_expression: "0 9 * * *".to_string(),
            jurisdictions: vec!["CA".to_string()],
            data_types: vec!["emissions".to_string()],
            depth: Depth::Summary,
            is_active: true,
        })
        .await
        .unwrap();
    assert!(schedule.next_run_at > Utc::now());

    // A manual run is already in flight for the same scope.
    let manual = harness.orchestrator.submit_job(&request(&["CA"])).await.unwrap();

    let now = Utc::now();
    harness.store.set_next_run_at(schedule.id, now - chrono::Duration::minutes(1));
    let report = engine.run_due(now).await.unwrap();
    assert_eq!(report.fired, 1);
    assert_eq!(report.conflicts, 1);

    let advanced = engine.get_schedule(schedule.id).await.unwrap().unwrap();
    assert_eq!(advanced.last_run_at, Some(now));
    assert!(advanced.next_run_at > now);

    harness.wait_for_terminal(&manual, WAIT).await;

    harness.store.set_next_run_at(schedule.id, now);
    let report = engine.run_due(Utc::now()).await.unwrap();
    assert_eq!(report.submitted, 1);

    let scheduled = harness
        .orchestrator
        .get_jobs(&JobFilter::default())
        .await
        .unwrap()
        .into_iter()
        .filter(|j| j.schedule_id == Some(schedule.id))
        .collect::<Vec<_>>();
    assert_eq!(scheduled.len(), 1);
    harness
        .wait_for_terminal(&[scheduled[0].id], WAIT)
        .await;
}

#[tokio::test]
async fn invalid_cron_is_rejected_without_a_row() {
    let harness = TestHarness::new(MockResearcher::new());
    let engine = ScheduleEngine::new(
        harness.store.clone(),
        harness.orchestrator.clone(),
        Duration::from_secs(60),
        60,
    );

    let err = engine
        .create_schedule(&ScheduleRequest {
            name: "broken".to_string(),
            cron_expression: "not-a-cron".to_string(),
            jurisdictions: vec!["CA".to_string()],
            data_types: vec!["emissions".to_string()],
            depth: Depth::Summary,
            is_active: true,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CivicScanError::ScheduleParse { .. }));
    assert!(engine.get_upcoming_schedules(24 * 366).await.unwrap().is_empty());
}

#[tokio::test]
async fn results_since_excludes_programs_not_seen_again() {
    let harness = TestHarness::new(two_state_researcher());
    let ids = harness
        .orchestrator
        .submit_job(&request(&["CA", "TX"]))
        .await
        .unwrap();
    harness.wait_for_terminal(&ids, WAIT).await;

    let before = Utc::now() - chrono::Duration::minutes(5);
    let after = Utc::now() + chrono::Duration::minutes(5);

    for id in &ids {
        let scoped = |since| ResultFilter {
            jurisdiction: Some("ca".to_string()),
            job_id: Some(*id),
            since: Some(since),
            ..Default::default()
        };
        let job = harness.orchestrator.get_job(*id).await.unwrap().unwrap();
        let expected = usize::from(job.jurisdictions.iter().any(|j| j == "CA"));

        let seen = harness.orchestrator.get_results(&scoped(before)).await.unwrap();
        assert_eq!(seen.len(), expected, "job {id}");

        let unseen = harness.orchestrator.get_results(&scoped(after)).await.unwrap();
        assert!(unseen.is_empty(), "job {id}");
    }
}
