//! Pipeline Engine - Orchestration Runtime
//!
//! Everything that turns a declared pipeline into running subprocesses:
//! YAML config composition, the dependency graph, the bounded-worker
//! scheduler, the subprocess job executor, the keyed artifact cache, and
//! the test-report collector.

pub mod cache;
pub mod collector;
pub mod config;
pub mod executor;
pub mod graph;
pub mod scheduler;

pub use crate::cache::{
    CacheBackend, CacheError, CacheKeyInfo, CacheStore, LocalDirCache, MemoryCache, RestoredBlob,
};
pub use crate::collector::{
    CollectedReport, CollectorError, DirReportSink, ReportCollector, ReportSink, ReportSummary,
};
pub use crate::config::{load_pipeline, parse_pipeline, ConfigError, EngineConfig};
pub use crate::executor::{JobExecutor, JobOutcome, ProcessError};
pub use crate::graph::{DependencyGraph, GraphError};
pub use crate::scheduler::{SubmitError, WorkflowRunHandle, WorkflowScheduler};

pub use tolva_core::{
    CacheDirective, DomainError, FailureReason, JobId, JobRun, JobSpec, JobState, StepOutcome,
    StepSpec, WorkflowRun, WorkflowRunId, WorkflowRunSnapshot, WorkflowSpec, WorkflowStatus,
};
