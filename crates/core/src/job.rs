//! Job Domain Entity
//!
//! This module contains the static job definition (`JobSpec`) and the
//! per-invocation runtime record (`JobRun`) together with the state
//! machine that governs job lifecycle transitions.

use crate::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Job identifier - Value Object
///
/// Jobs are addressed by their declared name, which is unique within a
/// pipeline and doubles as the dependency-graph key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single step within a job - Value Object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    /// Shell command executed for this step
    pub run: String,
    /// Working directory override, relative to the job workspace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: run.into(),
            cwd: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Informational resource profile for a job
///
/// The engine records this for inspection; it does not enforce quotas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            class: "default".to_string(),
            cpu: None,
            memory_mb: None,
        }
    }
}

/// Cache directive attached to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheDirective {
    /// Fully interpolated cache key
    pub key: String,
    /// Path globs (relative to the job workspace) persisted under the key
    pub paths: Vec<String>,
    /// Skip the save phase when the job did not succeed
    #[serde(default)]
    pub save_on_success_only: bool,
}

/// Static job definition - immutable once loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub steps: Vec<StepSpec>,
    /// Jobs that must complete successfully before this one starts
    #[serde(default)]
    pub requires: Vec<JobId>,
    #[serde(default)]
    pub resources: ResourceProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheDirective>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Maximum duration; exceeding it fails the job with a timeout reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Glob of a structured report emitted by the job's own tooling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
}

impl JobSpec {
    pub fn new(id: impl Into<JobId>, steps: Vec<StepSpec>) -> Self {
        Self {
            id: id.into(),
            steps,
            requires: vec![],
            resources: ResourceProfile::default(),
            cache: None,
            env: HashMap::new(),
            timeout_ms: None,
            report: None,
        }
    }

    pub fn with_requires(mut self, requires: Vec<JobId>) -> Self {
        self.requires = requires;
        self
    }

    /// Validate the spec
    ///
    /// # Errors
    /// Returns `DomainError::Validation` if the spec is malformed
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(DomainError::Validation("job id must not be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(DomainError::Validation(format!(
                "job '{}' declares no steps",
                self.id
            )));
        }
        for step in &self.steps {
            if step.run.trim().is_empty() {
                return Err(DomainError::Validation(format!(
                    "step '{}' of job '{}' has an empty command",
                    step.name, self.id
                )));
            }
        }
        if let Some(cache) = &self.cache {
            if cache.key.is_empty() {
                return Err(DomainError::Validation(format!(
                    "job '{}' declares a cache directive with an empty key",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// Job lifecycle state
///
/// `Pending → Ready → Running → {Succeeded | Failed}` with the side
/// transition `{Pending, Ready} → Skipped` when a prerequisite fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Ready => "READY",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Skipped => "SKIPPED",
        }
    }

    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped
        )
    }

    pub fn can_transition_to(&self, next: &JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Ready)
                | (JobState::Pending, JobState::Skipped)
                | (JobState::Ready, JobState::Running)
                | (JobState::Ready, JobState::Skipped)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a job run ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// A step exited non-zero; remaining steps were aborted
    StepFailure { step_index: usize, exit_code: i32 },
    /// The job exceeded its declared maximum duration
    Timeout,
    /// The job was killed by a workflow cancellation
    Cancelled,
    /// Engine-side failure (spawn error, I/O error, ...)
    Internal { message: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::StepFailure {
                step_index,
                exit_code,
            } => write!(f, "step {} exited with code {}", step_index, exit_code),
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

/// Captured outcome of a single executed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub name: String,
    /// None when the process was killed before exiting on its own
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Set when captured output hit the configured byte cap
    pub truncated: bool,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

/// Runtime record of one job execution - owned exclusively by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub job_id: JobId,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub steps: Vec<StepOutcome>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Key the cache was actually restored from, when a restore hit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_restored_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_saved_to: Option<String>,
    /// Non-fatal issues surfaced during the run (cache misses, report parse
    /// problems, output truncation)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl JobRun {
    pub fn new(job_id: JobId) -> Self {
        let now = chrono::Utc::now();
        Self {
            job_id,
            state: JobState::Pending,
            reason: None,
            steps: vec![],
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            cache_restored_from: None,
            cache_saved_to: None,
            warnings: vec![],
        }
    }

    fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(DomainError::invalid_state_transition(
                self.state.as_str(),
                next.as_str(),
            ));
        }
        self.state = next;
        self.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Transition to READY once every dependency has succeeded
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if transition is invalid
    pub fn mark_ready(&mut self) -> Result<()> {
        self.transition(JobState::Ready)
    }

    /// Transition to RUNNING when dispatched to a worker
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if transition is invalid
    pub fn start(&mut self) -> Result<()> {
        self.transition(JobState::Running)?;
        self.started_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// Transition to SUCCEEDED (terminal)
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if transition is invalid
    pub fn succeed(&mut self) -> Result<()> {
        self.transition(JobState::Succeeded)?;
        self.finished_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// Transition to FAILED (terminal), recording the reason
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if transition is invalid
    pub fn fail(&mut self, reason: FailureReason) -> Result<()> {
        self.transition(JobState::Failed)?;
        self.reason = Some(reason);
        self.finished_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// Transition to SKIPPED (terminal) when a prerequisite failed or the
    /// run was cancelled before dispatch
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if transition is invalid
    pub fn skip(&mut self) -> Result<()> {
        self.transition(JobState::Skipped)?;
        self.finished_at = Some(chrono::Utc::now());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> JobSpec {
        JobSpec::new(id, vec![StepSpec::new("step", "true")])
    }

    #[test]
    fn test_valid_lifecycle() {
        let mut run = JobRun::new(JobId::from("build"));
        run.mark_ready().unwrap();
        run.start().unwrap();
        run.succeed().unwrap();
        assert_eq!(run.state, JobState::Succeeded);
        assert!(run.is_terminal());
        assert!(run.started_at.is_some());
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_skip_from_pending_and_ready() {
        let mut run = JobRun::new(JobId::from("a"));
        run.skip().unwrap();
        assert_eq!(run.state, JobState::Skipped);

        let mut run = JobRun::new(JobId::from("b"));
        run.mark_ready().unwrap();
        run.skip().unwrap();
        assert_eq!(run.state, JobState::Skipped);
    }

    #[test]
    fn test_running_cannot_skip() {
        let mut run = JobRun::new(JobId::from("a"));
        run.mark_ready().unwrap();
        run.start().unwrap();
        let err = run.skip().unwrap_err();
        assert!(matches!(
            err,
            DomainError::InvalidStateTransition { .. }
        ));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut run = JobRun::new(JobId::from("a"));
        run.mark_ready().unwrap();
        run.start().unwrap();
        run.fail(FailureReason::Timeout).unwrap();
        assert!(run.succeed().is_err());
        assert!(run.skip().is_err());
        assert_eq!(run.reason, Some(FailureReason::Timeout));
    }

    #[test]
    fn test_spec_validation() {
        assert!(spec("ok").validate().is_ok());

        let empty = JobSpec::new("nosteps", vec![]);
        assert!(empty.validate().is_err());

        let blank = JobSpec::new("blank", vec![StepSpec::new("s", "  ")]);
        assert!(blank.validate().is_err());
    }
}
