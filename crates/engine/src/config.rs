//! Pipeline definition loading and engine configuration
//!
//! Two concerns live here. `load_pipeline` consumes the declarative YAML
//! pipeline document (jobs, steps, cache directives, and the `workflow`
//! section that is the DAG source of truth) and composes it into an
//! immutable `WorkflowSpec`: base fragments are merged into each job and
//! cache-key templates are interpolated before validation, so no runtime
//! indirection remains. `EngineConfig` is the engine's own knobs, loaded
//! from `TOLVA_*` environment variables with validated defaults.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tolva_core::{CacheDirective, DomainError, JobId, JobSpec, ResourceProfile, StepSpec, WorkflowSpec};
use tracing::warn;

/// Configuration error - fatal before any job runs
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("pipeline file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to read pipeline file: {0}")]
    FileRead(#[source] std::io::Error),

    #[error("failed to parse pipeline YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("workflow references unknown job '{0}'")]
    UnknownJob(String),

    #[error("workflow lists job '{0}' more than once")]
    DuplicateJob(String),

    #[error("invalid configuration value: {0}")]
    InvalidValue(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Reusable fragment merged into every job before validation
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BaseFragment {
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub resource_class: Option<String>,
}

/// Raw cache directive as written in the pipeline file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawCache {
    /// Key template; `{{ checksum "<file>" }}` is interpolated at load time
    pub key: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub save_on_success_only: bool,
}

/// Raw step as written in the pipeline file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawStep {
    pub name: String,
    pub run: String,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Raw job as written in the pipeline file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawJob {
    pub steps: Vec<RawStep>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub resource_class: Option<String>,
    #[serde(default)]
    pub cache: Option<RawCache>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub report: Option<String>,
}

/// Entry in the workflow section - either a bare job name or a job name
/// with its `requires` edges
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WorkflowEntry {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        requires: Vec<String>,
    },
}

impl WorkflowEntry {
    fn name(&self) -> &str {
        match self {
            WorkflowEntry::Name(n) => n,
            WorkflowEntry::Detailed { name, .. } => name,
        }
    }

    fn requires(&self) -> &[String] {
        match self {
            WorkflowEntry::Name(_) => &[],
            WorkflowEntry::Detailed { requires, .. } => requires,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawWorkflow {
    pub jobs: Vec<WorkflowEntry>,
}

/// Top-level pipeline document
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base: Option<BaseFragment>,
    pub jobs: HashMap<String, RawJob>,
    pub workflow: RawWorkflow,
}

/// Load and compose a pipeline definition from a YAML file
///
/// # Errors
/// Returns `ConfigError` on read/parse failure or malformed composition;
/// all such errors are fatal before dispatch
pub fn load_pipeline(path: &Path) -> Result<WorkflowSpec> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path).map_err(ConfigError::FileRead)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let fallback_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "pipeline".to_string());
    parse_pipeline(&content, base_dir, &fallback_name)
}

/// Parse and compose a pipeline definition from YAML text
///
/// Checksum templates resolve file paths relative to `base_dir`.
pub fn parse_pipeline(yaml: &str, base_dir: &Path, fallback_name: &str) -> Result<WorkflowSpec> {
    let file: PipelineFile = serde_yaml::from_str(yaml)?;
    compose(file, base_dir, fallback_name)
}

/// Merge base fragments into each participating job and build the spec
///
/// Only jobs listed in the workflow section participate; job-level values
/// win key-by-key over base values.
fn compose(file: PipelineFile, base_dir: &Path, fallback_name: &str) -> Result<WorkflowSpec> {
    let base = file.base.unwrap_or_default();
    let mut seen = std::collections::HashSet::new();
    let mut jobs = Vec::with_capacity(file.workflow.jobs.len());

    for entry in &file.workflow.jobs {
        let name = entry.name();
        if !seen.insert(name.to_string()) {
            return Err(ConfigError::DuplicateJob(name.to_string()));
        }
        let raw = file
            .jobs
            .get(name)
            .ok_or_else(|| ConfigError::UnknownJob(name.to_string()))?;

        let mut env = base.env.clone();
        env.extend(raw.env.clone());

        let resources = ResourceProfile {
            class: raw
                .resource_class
                .clone()
                .or_else(|| base.resource_class.clone())
                .unwrap_or_else(|| "default".to_string()),
            ..ResourceProfile::default()
        };

        let cache = raw.cache.as_ref().map(|c| CacheDirective {
            key: interpolate_key(&c.key, base_dir),
            paths: c.paths.clone(),
            save_on_success_only: c.save_on_success_only,
        });

        let steps = raw
            .steps
            .iter()
            .map(|s| StepSpec {
                name: s.name.clone(),
                run: s.run.clone(),
                cwd: s.cwd.clone(),
            })
            .collect();

        jobs.push(JobSpec {
            id: JobId::new(name),
            steps,
            requires: entry.requires().iter().map(JobId::new).collect(),
            resources,
            cache,
            env,
            timeout_ms: raw.timeout_ms,
            report: raw.report.clone(),
        });
    }

    let spec = WorkflowSpec::new(
        file.name.unwrap_or_else(|| fallback_name.to_string()),
        jobs,
    );
    spec.validate()?;
    Ok(spec)
}

/// Interpolate `{{ checksum "<file>" }}` templates in a cache key
///
/// A missing or unreadable file degrades to the `none` sentinel with a
/// warning; the directive stays usable.
pub fn interpolate_key(template: &str, base_dir: &Path) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            // unbalanced template, keep the tail verbatim
            out.push_str(&rest[open..]);
            return out;
        };
        let inner = after[..close].trim();
        out.push_str(&resolve_template(inner, base_dir));
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

fn resolve_template(inner: &str, base_dir: &Path) -> String {
    let Some(arg) = inner.strip_prefix("checksum") else {
        warn!(template = inner, "unknown cache key template, keeping literal");
        return format!("{{{{ {} }}}}", inner);
    };
    let file = arg.trim().trim_matches('"');
    let path = base_dir.join(file);
    match std::fs::read(&path) {
        Ok(bytes) => {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            hex::encode(hasher.finalize())
        }
        Err(e) => {
            warn!(file = %path.display(), error = %e, "checksum input unreadable, using sentinel");
            "none".to_string()
        }
    }
}

/// Engine runtime configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool size - parallel execution slots
    pub max_workers: usize,
    /// Cancel the whole run on the first failed job instead of letting
    /// independent branches finish
    pub fail_fast: bool,
    /// Cap on buffered stdout/stderr per step; overflow is marked
    pub max_output_bytes: usize,
    /// Grace period between the cancellation signal and a forced kill
    pub cancel_grace_ms: u64,
    /// Directory backing the local cache store
    pub cache_dir: PathBuf,
    /// Where normalized reports are exported, when set
    pub report_dir: Option<PathBuf>,
    /// Root under which per-job workspaces are created
    pub work_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            fail_fast: false,
            max_output_bytes: 1024 * 1024,
            cancel_grace_ms: 5000,
            cache_dir: PathBuf::from(".tolva/cache"),
            report_dir: None,
            work_dir: std::env::temp_dir().join("tolva"),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `TOLVA_*` environment variables
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidValue` naming the offending variable
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let max_workers = env_parse("TOLVA_MAX_WORKERS", defaults.max_workers)?;
        let fail_fast = match std::env::var("TOLVA_FAIL_FAST") {
            Ok(v) => matches!(v.as_str(), "1" | "true" | "yes"),
            Err(_) => defaults.fail_fast,
        };
        let max_output_bytes = env_parse("TOLVA_MAX_OUTPUT_BYTES", defaults.max_output_bytes)?;
        let cancel_grace_ms = env_parse("TOLVA_CANCEL_GRACE_MS", defaults.cancel_grace_ms)?;
        let cache_dir = std::env::var("TOLVA_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);
        let report_dir = std::env::var("TOLVA_REPORT_DIR").ok().map(PathBuf::from);
        let work_dir = std::env::var("TOLVA_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.work_dir);

        let config = Self {
            max_workers,
            fail_fast,
            max_output_bytes,
            cancel_grace_ms,
            cache_dir,
            report_dir,
            work_dir,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "TOLVA_MAX_WORKERS must be > 0".to_string(),
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "TOLVA_MAX_OUTPUT_BYTES must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> Result<T> {
    match std::env::var(var) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(var.to_string())),
        Err(_) => Ok(default),
    }
}
