//! Domain Core - Business Logic and Shared Types
//!
//! This crate contains the domain entities and value objects of the Tolva
//! pipeline orchestration engine: job and workflow definitions, the job
//! lifecycle state machine, and the shared error type. It performs no I/O.

pub mod error;
pub mod job;
pub mod workflow;

pub use crate::error::DomainError;
pub use chrono::{DateTime, Utc};

/// Result alias for the domain layer
pub type Result<T> = std::result::Result<T, DomainError>;

// Re-export all types for easy importing
pub use crate::job::{
    CacheDirective, FailureReason, JobId, JobRun, JobSpec, JobState, ResourceProfile, StepOutcome,
    StepSpec,
};
pub use crate::workflow::{
    WorkflowRun, WorkflowRunId, WorkflowRunSnapshot, WorkflowSpec, WorkflowStatus,
};
