//! Workflow Scheduler
//!
//! Walks the dependency graph and drives job executors under a bounded
//! worker pool. Ready jobs are dispatched FIFO with declaration order as
//! the tie-break; a failed job marks its not-yet-started transitive
//! dependents Skipped while independent running branches finish (unless
//! fail-fast is configured). Cancellation is cooperative: running jobs
//! receive the signal through a watch channel, queued jobs move straight
//! to Skipped.

use crate::collector::ReportCollector;
use crate::config::EngineConfig;
use crate::executor::{JobExecutor, JobOutcome};
use crate::graph::{DependencyGraph, GraphError};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock, Semaphore};
use tracing::{error, info, warn};
use tolva_core::{
    DomainError, JobId, JobState, WorkflowRun, WorkflowRunId, WorkflowRunSnapshot, WorkflowSpec,
};

/// Rejected before dispatch - nothing ran
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Handle to one submitted workflow run
#[derive(Debug)]
pub struct WorkflowRunHandle {
    id: WorkflowRunId,
    state: Arc<RwLock<WorkflowRun>>,
    cancel_tx: Arc<watch::Sender<bool>>,
    finished_rx: watch::Receiver<bool>,
}

impl WorkflowRunHandle {
    pub fn id(&self) -> &WorkflowRunId {
        &self.id
    }

    /// Point-in-time copy of the run; never blocks on job completion
    pub async fn status(&self) -> WorkflowRunSnapshot {
        self.state.read().await.snapshot()
    }

    /// Best-effort cancellation: running jobs get the signal, queued jobs
    /// move straight to Skipped
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Await completion of every job and return the final snapshot
    pub async fn wait(&self) -> WorkflowRunSnapshot {
        let mut rx = self.finished_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.status().await
    }
}

/// Scheduler - turns workflow specs into driven runs
pub struct WorkflowScheduler {
    config: Arc<EngineConfig>,
    executor: Arc<JobExecutor>,
    collector: Option<Arc<ReportCollector>>,
}

impl WorkflowScheduler {
    pub fn new(config: Arc<EngineConfig>, executor: Arc<JobExecutor>) -> Self {
        Self {
            config,
            executor,
            collector: None,
        }
    }

    pub fn with_collector(mut self, collector: Arc<ReportCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Validate the workflow, build the DAG, and start driving it
    ///
    /// # Errors
    /// Returns `SubmitError` for malformed workflows (duplicate ids,
    /// unknown references, cycles) - these abort before any job runs
    pub fn submit(&self, spec: WorkflowSpec) -> Result<WorkflowRunHandle, SubmitError> {
        spec.validate()?;
        let graph = DependencyGraph::build(&spec)?;
        // cycle check happens up front; the driver trusts the order
        let order = graph.execution_order()?;
        info!(workflow = %spec.name, jobs = order.len(), "workflow submitted");

        let run = WorkflowRun::new(spec);
        let id = run.id.clone();
        let state = Arc::new(RwLock::new(run));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let (finished_tx, finished_rx) = watch::channel(false);

        let driver = Driver {
            run_id: id.clone(),
            config: self.config.clone(),
            executor: self.executor.clone(),
            collector: self.collector.clone(),
            graph,
            state: state.clone(),
            cancel_tx: cancel_tx.clone(),
            cancel_rx,
            finished_tx,
        };
        tokio::spawn(driver.run());

        Ok(WorkflowRunHandle {
            id,
            state,
            cancel_tx,
            finished_rx,
        })
    }
}

struct Driver {
    run_id: WorkflowRunId,
    config: Arc<EngineConfig>,
    executor: Arc<JobExecutor>,
    collector: Option<Arc<ReportCollector>>,
    graph: DependencyGraph,
    state: Arc<RwLock<WorkflowRun>>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    finished_tx: watch::Sender<bool>,
}

impl Driver {
    async fn run(self) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(JobId, JobOutcome)>();
        let mut ready_queue: VecDeque<JobId> = VecDeque::new();
        let mut running = 0usize;
        let mut externally_cancelled = false;
        let mut halted = false;
        let mut cancel_open = true;
        let mut cancel_rx = self.cancel_rx.clone();

        self.promote_ready(&mut ready_queue).await;

        loop {
            // dispatch: first free worker takes the queue head
            while !ready_queue.is_empty() {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let Some(job_id) = ready_queue.pop_front() else {
                    break;
                };

                let spec = {
                    let mut run = self.state.write().await;
                    let Some(job_run) = run.run_mut(&job_id) else {
                        continue;
                    };
                    if job_run.state != JobState::Ready {
                        continue;
                    }
                    if let Err(e) = job_run.start() {
                        error!(job = %job_id, error = %e, "dispatch rejected");
                        continue;
                    }
                    run.spec.job(&job_id).cloned()
                };
                let Some(spec) = spec else { continue };

                info!(job = %job_id, "dispatching job");
                let executor = self.executor.clone();
                let run_id = self.run_id.clone();
                let cancel = self.cancel_tx.subscribe();
                let tx = done_tx.clone();
                running += 1;
                tokio::spawn(async move {
                    let outcome = executor.execute(&run_id, &spec, cancel).await;
                    drop(permit);
                    let _ = tx.send((spec.id, outcome));
                });
            }

            if running == 0 && ready_queue.is_empty() {
                break;
            }

            tokio::select! {
                completed = done_rx.recv() => {
                    let Some((job_id, outcome)) = completed else { break };
                    running -= 1;
                    self.apply_outcome(job_id, outcome, &mut ready_queue, &mut halted)
                        .await;
                }
                changed = cancel_rx.changed(), if cancel_open && !halted => {
                    match changed {
                        Ok(()) if *cancel_rx.borrow() => {
                            info!(run = %self.run_id, "cancellation requested");
                            externally_cancelled = true;
                            halted = true;
                            self.skip_not_started(&mut ready_queue).await;
                        }
                        Ok(()) => {}
                        Err(_) => cancel_open = false,
                    }
                }
            }
        }

        let mut run = self.state.write().await;
        run.resolve_status(externally_cancelled);
        info!(run = %self.run_id, status = %run.status, "workflow finished");
        drop(run);
        let _ = self.finished_tx.send(true);
    }

    /// Promote Pending jobs whose dependencies all succeeded, in
    /// declaration order (the FIFO tie-break)
    async fn promote_ready(&self, ready_queue: &mut VecDeque<JobId>) {
        let mut run = self.state.write().await;
        for job_id in self.graph.declaration_order() {
            let pending = run
                .run(job_id)
                .map(|r| r.state == JobState::Pending)
                .unwrap_or(false);
            if !pending {
                continue;
            }
            let satisfied = self.graph.dependencies_of(job_id).iter().all(|dep| {
                run.run(dep)
                    .map(|r| r.state == JobState::Succeeded)
                    .unwrap_or(false)
            });
            if satisfied {
                if let Some(job_run) = run.run_mut(job_id) {
                    if job_run.mark_ready().is_ok() {
                        ready_queue.push_back(job_id.clone());
                    }
                }
            }
        }
    }

    async fn apply_outcome(
        &self,
        job_id: JobId,
        outcome: JobOutcome,
        ready_queue: &mut VecDeque<JobId>,
        halted: &mut bool,
    ) {
        let workspace = outcome.workspace.clone();
        let failed = outcome.failure.is_some();
        {
            let mut run = self.state.write().await;
            let Some(job_run) = run.run_mut(&job_id) else {
                return;
            };
            job_run.steps = outcome.steps;
            job_run.cache_restored_from = outcome.cache_restored_from;
            job_run.cache_saved_to = outcome.cache_saved_to;
            job_run.warnings.extend(outcome.warnings);
            let transitioned = match outcome.failure {
                None => job_run.succeed(),
                Some(reason) => {
                    warn!(job = %job_id, %reason, "job failed");
                    job_run.fail(reason)
                }
            };
            if let Err(e) = transitioned {
                error!(job = %job_id, error = %e, "terminal transition rejected");
            }
        }

        if let Some(collector) = &self.collector {
            let (spec, job_run) = {
                let run = self.state.read().await;
                (run.spec.job(&job_id).cloned(), run.run(&job_id).cloned())
            };
            if let (Some(spec), Some(job_run)) = (spec, job_run) {
                let warnings = collector.collect(&spec, &job_run, &workspace).await;
                if !warnings.is_empty() {
                    let mut run = self.state.write().await;
                    if let Some(job_run) = run.run_mut(&job_id) {
                        job_run.warnings.extend(warnings);
                    }
                }
            }
        }

        if failed {
            self.skip_dependents_of(&job_id, ready_queue).await;
            if self.config.fail_fast && !*halted {
                warn!(run = %self.run_id, "fail-fast: cancelling remaining jobs");
                *halted = true;
                let _ = self.cancel_tx.send(true);
                self.skip_not_started(ready_queue).await;
            }
        } else if !*halted {
            self.promote_ready(ready_queue).await;
        }
    }

    /// Mark every not-yet-started transitive dependent of `job_id` Skipped
    async fn skip_dependents_of(&self, job_id: &JobId, ready_queue: &mut VecDeque<JobId>) {
        let dependents = self.graph.transitive_dependents(job_id);
        let mut run = self.state.write().await;
        for dependent in &dependents {
            if let Some(job_run) = run.run_mut(dependent) {
                if matches!(job_run.state, JobState::Pending | JobState::Ready)
                    && job_run.skip().is_ok()
                {
                    info!(job = %dependent, caused_by = %job_id, "job skipped");
                }
            }
        }
        ready_queue.retain(|id| !dependents.contains(id));
    }

    /// Mark every Pending/Ready job Skipped; running jobs keep the signal
    async fn skip_not_started(&self, ready_queue: &mut VecDeque<JobId>) {
        let mut run = self.state.write().await;
        for job_id in self.graph.declaration_order() {
            if let Some(job_run) = run.run_mut(job_id) {
                if matches!(job_run.state, JobState::Pending | JobState::Ready) {
                    let _ = job_run.skip();
                }
            }
        }
        ready_queue.clear();
    }
}
