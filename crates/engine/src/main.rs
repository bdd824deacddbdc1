//! Tolva - embeddable CI pipeline runner
//!
//! `tolva <pipeline.yml>` loads the pipeline, runs its workflow to
//! completion, prints the final snapshot as JSON, and exits non-zero
//! unless every job succeeded.

use std::process::ExitCode;
use std::sync::Arc;
use tolva_engine::{
    load_pipeline, DirReportSink, EngineConfig, JobExecutor, LocalDirCache, ReportCollector,
    WorkflowScheduler,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: tolva <pipeline.yml>");
        return ExitCode::from(2);
    };

    match run(&path).await {
        Ok(success) => {
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "pipeline run aborted");
            eprintln!("error: {}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(path: &str) -> Result<bool, Box<dyn std::error::Error>> {
    let config = Arc::new(EngineConfig::from_env()?);
    let workflow = load_pipeline(path.as_ref())?;
    info!(workflow = %workflow.name, jobs = workflow.jobs.len(), "pipeline loaded");

    let cache = Arc::new(tolva_engine::CacheStore::new(Arc::new(LocalDirCache::new(
        config.cache_dir.clone(),
    ))));
    let executor = Arc::new(JobExecutor::new(config.clone(), Some(cache)));

    let mut scheduler = WorkflowScheduler::new(config.clone(), executor);
    if let Some(report_dir) = &config.report_dir {
        let sink = Arc::new(DirReportSink::new(report_dir.clone()));
        scheduler = scheduler.with_collector(Arc::new(ReportCollector::with_sink(sink)));
    } else {
        scheduler = scheduler.with_collector(Arc::new(ReportCollector::new()));
    }

    let handle = scheduler.submit(workflow)?;
    let snapshot = handle.wait().await;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    info!(status = %snapshot.status, "pipeline finished");
    Ok(snapshot.status == tolva_engine::WorkflowStatus::Succeeded)
}
