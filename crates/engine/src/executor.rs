//! Job Executor
//!
//! Runs one job's ordered step list in an isolated per-job workspace,
//! streaming step output into capped buffers and capturing exit status.
//! The executor consults the cache store before the first step and after
//! the last one, honors the job-level timeout, and reacts to the
//! workflow's cancellation signal with SIGTERM to the step's process
//! group, escalating to SIGKILL after the grace period. It never panics
//! a worker: every failure mode folds into the returned `JobOutcome`.

use crate::cache::CacheStore;
use crate::config::EngineConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tolva_core::{FailureReason, JobSpec, StepOutcome, WorkflowRunId};

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the executor learned about one job invocation
#[derive(Debug)]
pub struct JobOutcome {
    pub steps: Vec<StepOutcome>,
    /// `None` means every step exited zero
    pub failure: Option<FailureReason>,
    pub workspace: PathBuf,
    pub cache_restored_from: Option<String>,
    pub cache_saved_to: Option<String>,
    pub warnings: Vec<String>,
}

impl JobOutcome {
    fn new(workspace: PathBuf) -> Self {
        Self {
            steps: vec![],
            failure: None,
            workspace,
            cache_restored_from: None,
            cache_saved_to: None,
            warnings: vec![],
        }
    }
}

enum StepWait {
    Exited(std::process::ExitStatus),
    Cancelled { exit_code: Option<i32> },
    TimedOut,
}

/// Executes jobs as sequential `sh -c` subprocesses
pub struct JobExecutor {
    config: Arc<EngineConfig>,
    cache: Option<Arc<CacheStore>>,
}

impl JobExecutor {
    pub fn new(config: Arc<EngineConfig>, cache: Option<Arc<CacheStore>>) -> Self {
        Self { config, cache }
    }

    /// Run every step of `spec` in declared order
    ///
    /// Terminal-state decisions stay with the scheduler; this returns the
    /// raw outcome including the failing step index, captured output, and
    /// cache bookkeeping.
    pub async fn execute(
        &self,
        run_id: &WorkflowRunId,
        spec: &JobSpec,
        mut cancel: watch::Receiver<bool>,
    ) -> JobOutcome {
        let workspace = self
            .config
            .work_dir
            .join(run_id.to_string())
            .join(spec.id.as_str());
        let mut outcome = JobOutcome::new(workspace.clone());

        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            outcome.failure = Some(FailureReason::Internal {
                message: format!("failed to create workspace: {}", e),
            });
            return outcome;
        }

        self.restore_cache(spec, &workspace, &mut outcome).await;

        let deadline = spec
            .timeout_ms
            .map(|ms| tokio::time::Instant::now() + tokio::time::Duration::from_millis(ms));
        let grace = tokio::time::Duration::from_millis(self.config.cancel_grace_ms);

        for (index, step) in spec.steps.iter().enumerate() {
            if *cancel.borrow() {
                outcome.failure = Some(FailureReason::Cancelled);
                break;
            }

            info!(job = %spec.id, step = %step.name, "starting step");
            let started_at = chrono::Utc::now();

            let mut child = match self.spawn_step(spec, step, &workspace) {
                Ok(child) => child,
                Err(e) => {
                    outcome.failure = Some(FailureReason::Internal {
                        message: e.to_string(),
                    });
                    break;
                }
            };

            let cap = self.config.max_output_bytes;
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let out_task = tokio::spawn(read_capped(stdout, cap));
            let err_task = tokio::spawn(read_capped(stderr, cap));

            let waited = wait_step(&mut child, &mut cancel, deadline, grace).await;

            let (stdout, out_truncated) = out_task.await.unwrap_or_default();
            let (stderr, err_truncated) = err_task.await.unwrap_or_default();
            let truncated = out_truncated || err_truncated;
            if truncated {
                outcome
                    .warnings
                    .push(format!("step '{}' output truncated", step.name));
            }

            let (exit_code, failure) = match waited {
                Ok(StepWait::Exited(status)) => {
                    let code = status.code().unwrap_or(-1);
                    if status.success() {
                        (Some(code), None)
                    } else {
                        (
                            Some(code),
                            Some(FailureReason::StepFailure {
                                step_index: index,
                                exit_code: code,
                            }),
                        )
                    }
                }
                Ok(StepWait::Cancelled { exit_code }) => {
                    (exit_code, Some(FailureReason::Cancelled))
                }
                Ok(StepWait::TimedOut) => (None, Some(FailureReason::Timeout)),
                Err(e) => (
                    None,
                    Some(FailureReason::Internal {
                        message: e.to_string(),
                    }),
                ),
            };

            outcome.steps.push(StepOutcome {
                index,
                name: step.name.clone(),
                exit_code,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                truncated,
                started_at,
                finished_at: chrono::Utc::now(),
            });

            if let Some(reason) = failure {
                warn!(job = %spec.id, step = %step.name, %reason, "step failed, aborting job");
                outcome.failure = Some(reason);
                break;
            }
            debug!(job = %spec.id, step = %step.name, "step succeeded");
        }

        self.save_cache(spec, &workspace, &mut outcome).await;
        outcome
    }

    fn spawn_step(
        &self,
        spec: &JobSpec,
        step: &tolva_core::StepSpec,
        workspace: &Path,
    ) -> Result<Child, ProcessError> {
        let cwd = match &step.cwd {
            Some(dir) => workspace.join(dir),
            None => workspace.to_path_buf(),
        };
        std::fs::create_dir_all(&cwd)?;

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&step.run)
            .current_dir(&cwd)
            .envs(&spec.env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // own process group, so signals reach background children too
            .process_group(0)
            .kill_on_drop(true);

        command
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))
    }

    async fn restore_cache(&self, spec: &JobSpec, workspace: &Path, outcome: &mut JobOutcome) {
        let (Some(store), Some(directive)) = (&self.cache, &spec.cache) else {
            return;
        };
        match store.restore(&directive.key).await {
            Ok(Some(blob)) => match store.restore_into(&blob, workspace).await {
                Ok(files) => {
                    info!(job = %spec.id, key = %blob.key, files, "cache restored");
                    outcome.cache_restored_from = Some(blob.key);
                }
                Err(e) => {
                    warn!(job = %spec.id, error = %e, "cache unpack failed, proceeding cold");
                    outcome
                        .warnings
                        .push(format!("cache unpack failed: {}", e));
                }
            },
            Ok(None) => {
                debug!(job = %spec.id, key = %directive.key, "cache miss");
                outcome
                    .warnings
                    .push(format!("cache miss for key '{}'", directive.key));
            }
            Err(e) => {
                warn!(job = %spec.id, error = %e, "cache restore failed, proceeding cold");
                outcome.warnings.push(format!("cache restore failed: {}", e));
            }
        }
    }

    async fn save_cache(&self, spec: &JobSpec, workspace: &Path, outcome: &mut JobOutcome) {
        let (Some(store), Some(directive)) = (&self.cache, &spec.cache) else {
            return;
        };
        if directive.save_on_success_only && outcome.failure.is_some() {
            debug!(job = %spec.id, "skipping cache save for failed job");
            return;
        }
        match store
            .save(&directive.key, workspace, &directive.paths)
            .await
        {
            Ok(files) => {
                info!(job = %spec.id, key = %directive.key, files, "cache saved");
                outcome.cache_saved_to = Some(directive.key.clone());
            }
            Err(e) => {
                warn!(job = %spec.id, error = %e, "cache save failed");
                outcome.warnings.push(format!("cache save failed: {}", e));
            }
        }
    }
}

/// Signal a step's whole process group (negative pid addresses the group)
fn signal_group(pid: Option<u32>, signal: libc::c_int) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as libc::pid_t), signal);
        }
    }
}

/// Wait for the step's subprocess, the job deadline, or a cancellation
async fn wait_step(
    child: &mut Child,
    cancel: &mut watch::Receiver<bool>,
    deadline: Option<tokio::time::Instant>,
    grace: tokio::time::Duration,
) -> std::io::Result<StepWait> {
    // child.id() is gone once the child is reaped; keep it for group signals
    let pid = child.id();
    let timeout_fut = async {
        match deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timeout_fut);
    let mut cancel_open = true;

    loop {
        tokio::select! {
            status = child.wait() => return Ok(StepWait::Exited(status?)),
            changed = cancel.changed(), if cancel_open => {
                match changed {
                    Ok(()) if *cancel.borrow() => {
                        // TERM first so the step can trap and clean up,
                        // SIGKILL to the group once the grace period lapses
                        signal_group(pid, libc::SIGTERM);
                        let waited = tokio::time::timeout(grace, child.wait()).await;
                        // sweep stragglers either way, or the output pipes
                        // stay open past the grace period
                        signal_group(pid, libc::SIGKILL);
                        match waited {
                            Ok(status) => {
                                return Ok(StepWait::Cancelled { exit_code: status?.code() });
                            }
                            Err(_) => {
                                child.kill().await.ok();
                                return Ok(StepWait::Cancelled { exit_code: None });
                            }
                        }
                    }
                    Ok(()) => {}
                    // sender gone, no further signals can arrive
                    Err(_) => cancel_open = false,
                }
            }
            _ = &mut timeout_fut => {
                signal_group(pid, libc::SIGKILL);
                child.kill().await.ok();
                return Ok(StepWait::TimedOut);
            }
        }
    }
}

/// Drain a stream into a capped buffer, flagging overflow
async fn read_capped<R>(reader: Option<R>, cap: usize) -> (Vec<u8>, bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut buf = [0u8; 8192];
    let mut out = Vec::new();
    let mut truncated = false;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if out.len() < cap {
                    let take = n.min(cap - out.len());
                    out.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (out, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tolva_core::{JobId, StepSpec};

    fn executor_with(config: EngineConfig, cache: Option<Arc<CacheStore>>) -> JobExecutor {
        JobExecutor::new(Arc::new(config), cache)
    }

    fn test_config(work_dir: &Path) -> EngineConfig {
        EngineConfig {
            work_dir: work_dir.to_path_buf(),
            cancel_grace_ms: 100,
            ..EngineConfig::default()
        }
    }

    fn cancel_rx() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_steps_run_in_order_and_capture_output() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor_with(test_config(dir.path()), None);
        let spec = JobSpec::new(
            "echoes",
            vec![
                StepSpec::new("first", "echo hello"),
                StepSpec::new("second", "echo world >&2"),
            ],
        );
        let (_tx, rx) = cancel_rx();

        let outcome = executor.execute(&WorkflowRunId::new(), &spec, rx).await;
        assert!(outcome.failure.is_none());
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(outcome.steps[0].stdout, "hello\n");
        assert_eq!(outcome.steps[1].stderr, "world\n");
        assert_eq!(outcome.steps[0].exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_nonzero_exit_aborts_remaining_steps() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor_with(test_config(dir.path()), None);
        let spec = JobSpec::new(
            "fails",
            vec![
                StepSpec::new("ok", "true"),
                StepSpec::new("boom", "exit 3"),
                StepSpec::new("never", "echo unreachable"),
            ],
        );
        let (_tx, rx) = cancel_rx();

        let outcome = executor.execute(&WorkflowRunId::new(), &spec, rx).await;
        assert_eq!(
            outcome.failure,
            Some(FailureReason::StepFailure {
                step_index: 1,
                exit_code: 3,
            })
        );
        // the third step never ran
        assert_eq!(outcome.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_kills_job() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor_with(test_config(dir.path()), None);
        let mut spec = JobSpec::new("slow", vec![StepSpec::new("sleep", "sleep 30")]);
        spec.timeout_ms = Some(200);
        let (_tx, rx) = cancel_rx();

        let outcome = executor.execute(&WorkflowRunId::new(), &spec, rx).await;
        assert_eq!(outcome.failure, Some(FailureReason::Timeout));
        assert_eq!(outcome.steps[0].exit_code, None);
    }

    #[tokio::test]
    async fn test_cancellation_fails_running_step() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor_with(test_config(dir.path()), None);
        let spec = JobSpec::new("slow", vec![StepSpec::new("sleep", "sleep 30")]);
        let (tx, rx) = cancel_rx();

        let run_id = WorkflowRunId::new();
        let task = {
            let spec = spec.clone();
            tokio::spawn(async move { executor.execute(&run_id, &spec, rx).await })
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
    }

    #[tokio::test]
    async fn test_cancellation_delivers_term_before_kill() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor_with(test_config(dir.path()), None);
        let marker = dir.path().join("saw-term");
        let run = format!(
            "trap 'touch {}; exit 0' TERM; sleep 30 & wait",
            marker.display()
        );
        let spec = JobSpec::new("trapper", vec![StepSpec::new("trap", run)]);
        let (tx, rx) = cancel_rx();

        let run_id = WorkflowRunId::new();
        let task = {
            let spec = spec.clone();
            tokio::spawn(async move { executor.execute(&run_id, &spec, rx).await })
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(300)).await;
        tx.send(true).unwrap();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
        assert!(marker.exists(), "step never received the TERM signal");
    }

    #[tokio::test]
    async fn test_cancellation_reaps_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor_with(test_config(dir.path()), None);
        // background child inherits the output pipes; killing only `sh`
        // would leave the drain blocked on it for the full 30s
        let spec = JobSpec::new(
            "backgrounded",
            vec![StepSpec::new("spawn", "sleep 30 & sleep 30")],
        );
        let (tx, rx) = cancel_rx();

        let started = std::time::Instant::now();
        let run_id = WorkflowRunId::new();
        let task = {
            let spec = spec.clone();
            tokio::spawn(async move { executor.execute(&run_id, &spec, rx).await })
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
        assert!(
            started.elapsed() < std::time::Duration::from_secs(10),
            "cancelled job waited for an orphaned child"
        );
    }

    #[tokio::test]
    async fn test_output_cap_marks_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_output_bytes = 16;
        let executor = executor_with(config, None);
        let spec = JobSpec::new(
            "chatty",
            vec![StepSpec::new("spam", "yes loud | head -n 1000")],
        );
        let (_tx, rx) = cancel_rx();

        let outcome = executor.execute(&WorkflowRunId::new(), &spec, rx).await;
        assert!(outcome.failure.is_none());
        assert!(outcome.steps[0].truncated);
        assert!(outcome.steps[0].stdout.len() <= 16);
        assert!(outcome.warnings.iter().any(|w| w.contains("truncated")));
    }

    #[tokio::test]
    async fn test_cache_save_and_restore_between_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::in_memory());
        let executor = executor_with(test_config(dir.path()), Some(store.clone()));

        let mut producer = JobSpec::new(
            "producer",
            vec![StepSpec::new("emit", "mkdir -p target && echo data > target/out")],
        );
        producer.cache = Some(tolva_core::CacheDirective {
            key: "k-v1-abc".to_string(),
            paths: vec!["target".to_string()],
            save_on_success_only: false,
        });

        let (_tx, rx) = cancel_rx();
        let outcome = executor.execute(&WorkflowRunId::new(), &producer, rx).await;
        assert_eq!(outcome.cache_saved_to.as_deref(), Some("k-v1-abc"));

        let mut consumer = JobSpec::new(
            "consumer",
            vec![StepSpec::new("check", "grep -q data target/out")],
        );
        consumer.cache = Some(tolva_core::CacheDirective {
            key: "k-v1-abc".to_string(),
            paths: vec!["target".to_string()],
            save_on_success_only: false,
        });

        let (_tx, rx) = cancel_rx();
        let outcome = executor.execute(&WorkflowRunId::new(), &consumer, rx).await;
        assert_eq!(outcome.cache_restored_from.as_deref(), Some("k-v1-abc"));
        assert!(outcome.failure.is_none(), "restored file should be present");
    }

    #[tokio::test]
    async fn test_save_on_success_only_skips_failed_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::in_memory());
        let executor = executor_with(test_config(dir.path()), Some(store.clone()));

        let mut spec = JobSpec::new("bad", vec![StepSpec::new("boom", "exit 1")]);
        spec.cache = Some(tolva_core::CacheDirective {
            key: "only-success".to_string(),
            paths: vec![".".to_string()],
            save_on_success_only: true,
        });

        let (_tx, rx) = cancel_rx();
        let outcome = executor.execute(&WorkflowRunId::new(), &spec, rx).await;
        assert!(outcome.cache_saved_to.is_none());
        assert!(store.restore("only-success").await.unwrap().is_none());
    }
}
