//! End-to-end scheduler tests
//!
//! Each test stands up a real scheduler over temp directories and drives
//! actual `sh` subprocesses, asserting on the final workflow snapshot.

use std::sync::Arc;
use tolva_engine::{
    CacheStore, EngineConfig, FailureReason, JobExecutor, JobId, JobSpec, JobState, LocalDirCache,
    ReportCollector, StepSpec, WorkflowRunHandle, WorkflowScheduler, WorkflowSpec, WorkflowStatus,
};

struct Harness {
    scheduler: WorkflowScheduler,
    _work: tempfile::TempDir,
    _cache: tempfile::TempDir,
}

fn harness(max_workers: usize, fail_fast: bool) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let work = tempfile::tempdir().expect("tempdir");
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(EngineConfig {
        max_workers,
        fail_fast,
        cancel_grace_ms: 200,
        work_dir: work.path().to_path_buf(),
        cache_dir: cache_dir.path().to_path_buf(),
        ..EngineConfig::default()
    });
    let cache = Arc::new(CacheStore::new(Arc::new(LocalDirCache::new(
        cache_dir.path(),
    ))));
    let executor = Arc::new(JobExecutor::new(config.clone(), Some(cache)));
    let scheduler = WorkflowScheduler::new(config, executor)
        .with_collector(Arc::new(ReportCollector::new()));
    Harness {
        scheduler,
        _work: work,
        _cache: cache_dir,
    }
}

fn job(id: &str, run: &str, requires: &[&str]) -> JobSpec {
    JobSpec::new(id, vec![StepSpec::new("main", run)])
        .with_requires(requires.iter().map(|r| JobId::from(*r)).collect())
}

async fn run_to_end(handle: &WorkflowRunHandle) -> tolva_engine::WorkflowRunSnapshot {
    tokio::time::timeout(std::time::Duration::from_secs(30), handle.wait())
        .await
        .expect("workflow should finish well inside the timeout")
}

#[tokio::test]
async fn test_diamond_workflow_runs_in_dependency_order() {
    let h = harness(4, false);
    let spec = WorkflowSpec::new(
        "diamond",
        vec![
            job("install", "true", &[]),
            job("clippy", "true", &["install"]),
            job("test", "true", &["install"]),
            job("build", "true", &["clippy", "test"]),
        ],
    );
    let handle = h.scheduler.submit(spec).expect("submit");
    let snapshot = run_to_end(&handle).await;

    assert_eq!(snapshot.status, WorkflowStatus::Succeeded);
    for id in ["install", "clippy", "test", "build"] {
        assert_eq!(snapshot.state_of(id), Some(JobState::Succeeded), "{}", id);
    }

    let finished = |id: &str| {
        snapshot
            .run(&JobId::from(id))
            .and_then(|r| r.finished_at)
            .expect("terminal job has finished_at")
    };
    let started = |id: &str| {
        snapshot
            .run(&JobId::from(id))
            .and_then(|r| r.started_at)
            .expect("dispatched job has started_at")
    };
    assert!(finished("install") <= started("clippy"));
    assert!(finished("install") <= started("test"));
    assert!(finished("clippy") <= started("build"));
    assert!(finished("test") <= started("build"));
}

#[tokio::test]
async fn test_failure_skips_dependents_but_not_independent_branches() {
    let h = harness(4, false);
    let spec = WorkflowSpec::new(
        "partial",
        vec![
            job("broken", "exit 7", &[]),
            job("downstream", "true", &["broken"]),
            job("leaf", "true", &["downstream"]),
            job("docs", "true", &[]),
        ],
    );
    let handle = h.scheduler.submit(spec).expect("submit");
    let snapshot = run_to_end(&handle).await;

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(snapshot.state_of("broken"), Some(JobState::Failed));
    assert_eq!(snapshot.state_of("downstream"), Some(JobState::Skipped));
    assert_eq!(snapshot.state_of("leaf"), Some(JobState::Skipped));
    assert_eq!(snapshot.state_of("docs"), Some(JobState::Succeeded));

    let broken = snapshot.run(&JobId::from("broken")).expect("run");
    assert_eq!(
        broken.reason,
        Some(FailureReason::StepFailure {
            step_index: 0,
            exit_code: 7,
        })
    );
}

#[tokio::test]
async fn test_independent_jobs_overlap_with_two_workers() {
    let h = harness(2, false);
    let spec = WorkflowSpec::new(
        "parallel",
        vec![
            job("left", "sleep 0.5", &[]),
            job("right", "sleep 0.5", &[]),
        ],
    );
    let handle = h.scheduler.submit(spec).expect("submit");
    let snapshot = run_to_end(&handle).await;

    assert_eq!(snapshot.status, WorkflowStatus::Succeeded);
    let left = snapshot.run(&JobId::from("left")).expect("run");
    let right = snapshot.run(&JobId::from("right")).expect("run");
    let (ls, lf) = (left.started_at.unwrap(), left.finished_at.unwrap());
    let (rs, rf) = (right.started_at.unwrap(), right.finished_at.unwrap());
    assert!(ls < rf && rs < lf, "expected overlapping execution windows");
}

#[tokio::test]
async fn test_single_worker_dispatches_in_declaration_order() {
    let h = harness(1, false);
    let out = tempfile::tempdir().expect("tempdir");
    let log = out.path().join("order.log");
    let append = |id: &str| format!("echo {} >> {}", id, log.display());
    let spec = WorkflowSpec::new(
        "serial",
        vec![
            job("first", &append("first"), &[]),
            job("second", &append("second"), &[]),
            job("third", &append("third"), &[]),
        ],
    );
    let handle = h.scheduler.submit(spec).expect("submit");
    let snapshot = run_to_end(&handle).await;

    assert_eq!(snapshot.status, WorkflowStatus::Succeeded);
    let contents = std::fs::read_to_string(&log).expect("order log");
    assert_eq!(contents, "first\nsecond\nthird\n");
}

#[tokio::test]
async fn test_cancel_fails_running_and_skips_queued() {
    let h = harness(2, false);
    let spec = WorkflowSpec::new(
        "cancelme",
        vec![
            job("test", "sleep 30", &[]),
            job("build", "true", &["test"]),
        ],
    );
    let handle = h.scheduler.submit(spec).expect("submit");

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(
        handle.status().await.state_of("test"),
        Some(JobState::Running)
    );
    handle.cancel();
    let snapshot = run_to_end(&handle).await;

    assert_eq!(snapshot.status, WorkflowStatus::Cancelled);
    assert_eq!(snapshot.state_of("test"), Some(JobState::Failed));
    assert_eq!(snapshot.state_of("build"), Some(JobState::Skipped));
    let test_run = snapshot.run(&JobId::from("test")).expect("run");
    assert_eq!(test_run.reason, Some(FailureReason::Cancelled));
}

#[tokio::test]
async fn test_timeout_fails_the_job() {
    let h = harness(1, false);
    let mut slow = job("slow", "sleep 30", &[]);
    slow.timeout_ms = Some(300);
    let spec = WorkflowSpec::new("timeouts", vec![slow]);
    let handle = h.scheduler.submit(spec).expect("submit");
    let snapshot = run_to_end(&handle).await;

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    let run = snapshot.run(&JobId::from("slow")).expect("run");
    assert_eq!(run.state, JobState::Failed);
    assert_eq!(run.reason, Some(FailureReason::Timeout));
}

#[tokio::test]
async fn test_fail_fast_skips_unrelated_pending_jobs() {
    let h = harness(1, true);
    let spec = WorkflowSpec::new(
        "failfast",
        vec![job("broken", "exit 1", &[]), job("other", "true", &[])],
    );
    let handle = h.scheduler.submit(spec).expect("submit");
    let snapshot = run_to_end(&handle).await;

    // fail-fast is a failure outcome, not a user cancellation
    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(snapshot.state_of("broken"), Some(JobState::Failed));
    assert_eq!(snapshot.state_of("other"), Some(JobState::Skipped));
}

#[tokio::test]
async fn test_without_fail_fast_unrelated_jobs_still_run() {
    let h = harness(1, false);
    let spec = WorkflowSpec::new(
        "keepgoing",
        vec![job("broken", "exit 1", &[]), job("other", "true", &[])],
    );
    let handle = h.scheduler.submit(spec).expect("submit");
    let snapshot = run_to_end(&handle).await;

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(snapshot.state_of("other"), Some(JobState::Succeeded));
}

#[tokio::test]
async fn test_step_failure_records_captured_output() {
    let h = harness(1, false);
    let spec = WorkflowSpec::new(
        "outputs",
        vec![job(
            "noisy",
            "echo to-stdout; echo to-stderr >&2; exit 2",
            &[],
        )],
    );
    let handle = h.scheduler.submit(spec).expect("submit");
    let snapshot = run_to_end(&handle).await;

    let run = snapshot.run(&JobId::from("noisy")).expect("run");
    assert_eq!(run.state, JobState::Failed);
    assert_eq!(run.steps.len(), 1);
    assert_eq!(run.steps[0].exit_code, Some(2));
    assert_eq!(run.steps[0].stdout, "to-stdout\n");
    assert_eq!(run.steps[0].stderr, "to-stderr\n");
}

#[tokio::test]
async fn test_yaml_pipeline_end_to_end() {
    let h = harness(2, false);
    let dir = tempfile::tempdir().expect("tempdir");
    let yaml = r#"
name: sample
base:
  env:
    GREETING: hello
jobs:
  greet:
    steps:
      - name: say
        run: test "$GREETING" = hello
  after:
    steps:
      - name: noop
        run: "true"
workflow:
  jobs:
    - greet
    - name: after
      requires: [greet]
"#;
    let spec = tolva_engine::parse_pipeline(yaml, dir.path(), "sample").expect("parse");
    let handle = h.scheduler.submit(spec).expect("submit");
    let snapshot = run_to_end(&handle).await;

    assert_eq!(snapshot.status, WorkflowStatus::Succeeded);
    assert_eq!(snapshot.state_of("greet"), Some(JobState::Succeeded));
    assert_eq!(snapshot.state_of("after"), Some(JobState::Succeeded));
}

#[tokio::test]
async fn test_cache_carries_artifacts_across_runs() {
    let h = harness(1, false);

    let cached_job = |cmd: &str| {
        let mut j = job("build", cmd, &[]);
        j.cache = Some(tolva_engine::CacheDirective {
            key: "it-cache-v1".to_string(),
            paths: vec!["out/artifact.txt".to_string()],
            save_on_success_only: true,
        });
        j
    };

    let producer = WorkflowSpec::new(
        "warm",
        vec![cached_job("mkdir -p out && echo payload > out/artifact.txt")],
    );
    let handle = h.scheduler.submit(producer).expect("submit");
    let snapshot = run_to_end(&handle).await;
    assert_eq!(snapshot.status, WorkflowStatus::Succeeded);
    let run = snapshot.run(&JobId::from("build")).expect("run");
    assert_eq!(run.cache_saved_to.as_deref(), Some("it-cache-v1"));

    // second run only checks the restored file exists
    let consumer = WorkflowSpec::new(
        "reuse",
        vec![cached_job("test \"$(cat out/artifact.txt)\" = payload")],
    );
    let handle = h.scheduler.submit(consumer).expect("submit");
    let snapshot = run_to_end(&handle).await;
    assert_eq!(snapshot.status, WorkflowStatus::Succeeded);
    let run = snapshot.run(&JobId::from("build")).expect("run");
    assert_eq!(run.cache_restored_from.as_deref(), Some("it-cache-v1"));
}
