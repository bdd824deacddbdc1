//! Artifact/Report Collector
//!
//! Gathers structured test reports for jobs that declare one. The report
//! format belongs to the external tool, so the collector treats the bytes
//! as an opaque blob plus a normalization step: BOM strip, newline
//! normalization, and a lightweight `<testsuite>` attribute scan into a
//! summary. Failure to parse is a collector-local warning, never a
//! pipeline failure.

use crate::cache::find_matches;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use tolva_core::{JobId, JobRun, JobSpec};

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("export failed: {0}")]
    Export(String),
}

/// Counts scanned out of a JUnit-style report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub tests: u64,
    pub failures: u64,
    pub errors: u64,
    pub skipped: u64,
}

/// One collected report, keyed by the job that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectedReport {
    pub job_id: JobId,
    /// Normalized report bytes
    pub raw: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ReportSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub collected_at: chrono::DateTime<chrono::Utc>,
}

/// Export port for normalized reports
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn export(&self, report: &CollectedReport) -> Result<(), CollectorError>;
}

/// Writes normalized reports as `<job>.xml` under a directory
#[derive(Debug)]
pub struct DirReportSink {
    dir: PathBuf,
}

impl DirReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ReportSink for DirReportSink {
    async fn export(&self, report: &CollectedReport) -> Result<(), CollectorError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = report.job_id.as_str().replace(['/', '\\'], "_");
        tokio::fs::write(self.dir.join(format!("{}.xml", name)), &report.raw).await?;
        Ok(())
    }
}

/// Collects per-job reports as JobRuns reach a terminal state
#[derive(Default)]
pub struct ReportCollector {
    reports: RwLock<HashMap<JobId, CollectedReport>>,
    sink: Option<Arc<dyn ReportSink>>,
}

impl ReportCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn ReportSink>) -> Self {
        Self {
            reports: RwLock::new(HashMap::new()),
            sink: Some(sink),
        }
    }

    /// Handle one terminal JobRun; returns collector-local warnings so
    /// the scheduler can attach them to the run
    pub async fn collect(&self, spec: &JobSpec, run: &JobRun, workspace: &Path) -> Vec<String> {
        debug_assert!(run.is_terminal());
        let Some(pattern) = &spec.report else {
            return vec![];
        };
        let mut warnings = Vec::new();

        let matches = match find_matches(workspace, pattern) {
            Ok(m) => m,
            Err(e) => {
                warn!(job = %spec.id, error = %e, "report lookup failed");
                return vec![format!("report lookup failed: {}", e)];
            }
        };
        let Some(path) = matches.first() else {
            debug!(job = %spec.id, pattern, "no report emitted");
            return vec![format!("no report matched '{}'", pattern)];
        };
        if matches.len() > 1 {
            warnings.push(format!(
                "report glob '{}' matched {} files, keeping '{}'",
                pattern,
                matches.len(),
                path.display()
            ));
        }

        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(job = %spec.id, error = %e, "report unreadable");
                warnings.push(format!("report unreadable: {}", e));
                return warnings;
            }
        };

        let (raw, summary, mut parse_warnings) = normalize(&bytes);
        warnings.append(&mut parse_warnings);

        let report = CollectedReport {
            job_id: spec.id.clone(),
            raw,
            summary,
            warnings: warnings.clone(),
            collected_at: chrono::Utc::now(),
        };

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.export(&report).await {
                warn!(job = %spec.id, error = %e, "report export failed");
                warnings.push(format!("report export failed: {}", e));
            }
        }

        info!(job = %spec.id, summary = ?report.summary, "report collected");
        let mut reports = self.reports.write().await;
        reports.insert(spec.id.clone(), report);
        warnings
    }

    /// Retrieve a collected report by job id
    pub async fn report(&self, id: &JobId) -> Option<CollectedReport> {
        let reports = self.reports.read().await;
        reports.get(id).cloned()
    }

    pub async fn job_ids(&self) -> Vec<JobId> {
        let reports = self.reports.read().await;
        let mut ids: Vec<_> = reports.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Normalize report bytes and scan `<testsuite>` attributes
///
/// Returns the normalized bytes, a summary when at least one testsuite
/// element was found, and any parse warnings.
fn normalize(bytes: &[u8]) -> (Vec<u8>, Option<ReportSummary>, Vec<String>) {
    let stripped = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    let text = String::from_utf8_lossy(stripped).replace("\r\n", "\n");

    let mut summary = ReportSummary::default();
    let mut found = false;

    let mut rest = text.as_str();
    while let Some(pos) = rest.find("<testsuite") {
        let after = &rest[pos + "<testsuite".len()..];
        // `<testsuites>` carries aggregate counts; only leaf elements count.
        // The name may be followed by attributes, `>`, or `/>`
        if after.starts_with(|c: char| c.is_whitespace() || c == '>' || c == '/') {
            let tag_end = after.find('>').unwrap_or(after.len());
            let tag = &after[..tag_end];
            found = true;
            summary.tests += scan_attr(tag, "tests").unwrap_or(0);
            summary.failures += scan_attr(tag, "failures").unwrap_or(0);
            summary.errors += scan_attr(tag, "errors").unwrap_or(0);
            summary.skipped += scan_attr(tag, "skipped").unwrap_or(0);
        }
        rest = &rest[pos + "<testsuite".len()..];
    }

    let warnings = if found {
        vec![]
    } else {
        vec!["report parse: no <testsuite> element found".to_string()]
    };
    let summary = found.then_some(summary);
    (text.into_bytes(), summary, warnings)
}

fn scan_attr(tag: &str, name: &str) -> Option<u64> {
    let marker = format!("{}=\"", name);
    let start = tag.find(&marker)? + marker.len();
    let end = tag[start..].find('"')? + start;
    tag[start..end].parse().ok()
}
