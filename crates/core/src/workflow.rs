//! Workflow Domain Entity
//!
//! A `WorkflowSpec` is the declaration-ordered set of jobs participating
//! in one pipeline; a `WorkflowRun` is one invocation of it, holding the
//! per-job runtime records until every job reaches a terminal state.

use crate::job::{JobId, JobRun, JobSpec, JobState};
use crate::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Workflow run identifier - Value Object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowRunId(Uuid);

impl WorkflowRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkflowRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static workflow definition
///
/// Job order is declaration order and is the tie-break among
/// equally-ready jobs at dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub jobs: Vec<JobSpec>,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>, jobs: Vec<JobSpec>) -> Self {
        Self {
            name: name.into(),
            jobs,
        }
    }

    pub fn job(&self, id: &JobId) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    pub fn job_ids(&self) -> impl Iterator<Item = &JobId> {
        self.jobs.iter().map(|j| &j.id)
    }

    /// Validate the workflow as a whole
    ///
    /// # Errors
    /// Returns `DomainError::Validation` on duplicate job ids or any
    /// invalid member spec
    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            return Err(DomainError::Validation(
                "workflow declares no jobs".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for job in &self.jobs {
            job.validate()?;
            if !seen.insert(job.id.clone()) {
                return Err(DomainError::Validation(format!(
                    "duplicate job id '{}'",
                    job.id
                )));
            }
        }
        Ok(())
    }
}

/// Overall status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Succeeded => "SUCCEEDED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One workflow invocation - holds the DAG snapshot and every JobRun
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: WorkflowRunId,
    pub spec: WorkflowSpec,
    pub runs: HashMap<JobId, JobRun>,
    pub status: WorkflowStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl WorkflowRun {
    pub fn new(spec: WorkflowSpec) -> Self {
        let runs = spec
            .jobs
            .iter()
            .map(|j| (j.id.clone(), JobRun::new(j.id.clone())))
            .collect();
        Self {
            id: WorkflowRunId::new(),
            spec,
            runs,
            status: WorkflowStatus::Running,
            created_at: chrono::Utc::now(),
            finished_at: None,
        }
    }

    pub fn run(&self, id: &JobId) -> Option<&JobRun> {
        self.runs.get(id)
    }

    pub fn run_mut(&mut self, id: &JobId) -> Option<&mut JobRun> {
        self.runs.get_mut(id)
    }

    pub fn all_terminal(&self) -> bool {
        self.runs.values().all(|r| r.is_terminal())
    }

    /// Fold the per-job terminal states into the overall status
    pub fn resolve_status(&mut self, cancelled: bool) {
        self.status = if cancelled {
            WorkflowStatus::Cancelled
        } else if self
            .runs
            .values()
            .all(|r| r.state == JobState::Succeeded)
        {
            WorkflowStatus::Succeeded
        } else {
            WorkflowStatus::Failed
        };
        self.finished_at = Some(chrono::Utc::now());
    }

    /// Point-in-time copy for non-blocking inspection
    pub fn snapshot(&self) -> WorkflowRunSnapshot {
        WorkflowRunSnapshot {
            id: self.id.clone(),
            workflow: self.spec.name.clone(),
            status: self.status,
            runs: self.runs.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// Point-in-time view of a workflow run
///
/// Enumerates every job's state and reason; nothing is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunSnapshot {
    pub id: WorkflowRunId,
    pub workflow: String,
    pub status: WorkflowStatus,
    pub runs: HashMap<JobId, JobRun>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl WorkflowRunSnapshot {
    pub fn run(&self, id: &JobId) -> Option<&JobRun> {
        self.runs.get(id)
    }

    pub fn state_of(&self, id: &str) -> Option<JobState> {
        self.runs.get(&JobId::from(id)).map(|r| r.state)
    }
}
