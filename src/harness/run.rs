use std::sync::Arc;

use crate::cases::{load_cases, select_cases};
use crate::error::{RunnerError, RunnerResult};
use crate::executor::RequestExecutor;
use crate::harness::types::{HarnessConfig, HarnessReport};
use crate::retry::{RetryController, RetryPolicy};
use crate::runner::RunMeta;
use crate::scheduler::{ConcurrencyScheduler, FsRecorder};
use crate::session::{RUN_META_FILE, RunLayout};
use crate::types::Variant;

/// Run every selected case against both variants and persist the results.
///
/// `run.json` is written before the first request and rewritten with the
/// summary once all workers finish.
pub async fn run_harness(config: &HarnessConfig) -> RunnerResult<HarnessReport> {
    config.runner.validate()?;

    let cases = load_cases(&config.cases_path)?;
    let cases = select_cases(cases, config.only.as_deref())?;

    let layout = match &config.run_id {
        Some(run_id) => RunLayout::with_run_id(&config.output_dir, run_id),
        None => RunLayout::new(&config.output_dir),
    };
    for variant in Variant::ALL {
        let existing = layout.variant_dir(variant).join(RUN_META_FILE);
        if existing.exists() {
            return Err(RunnerError::AlreadyRecorded(existing));
        }
    }
    layout.init()?;

    let case_ids = cases.iter().map(|c| c.id.clone()).collect();
    let meta = RunMeta::start(&layout.run_id, case_ids, &config.runner);
    layout.write_meta(&meta)?;

    tracing::info!(
        run_id = %layout.run_id,
        base_url = %config.runner.base_url,
        cases = cases.len(),
        concurrency = config.runner.concurrency,
        "run started"
    );

    let runner = Arc::new(config.runner.clone());
    let executor = RequestExecutor::new(Arc::clone(&runner), Some(layout.clone()))?;
    let controller = RetryController::new(executor, RetryPolicy::from_config(&runner));
    let recorder = FsRecorder::new(layout.clone(), runner.redaction);
    let scheduler = ConcurrencyScheduler::new(controller, recorder, runner.concurrency);

    let batch = scheduler.run(cases).await?;

    let meta = meta.finish(batch.summary.clone());
    layout.write_meta(&meta)?;

    tracing::info!(
        run_id = %layout.run_id,
        ok = batch.summary.all.ok,
        failed = batch.summary.all.failed,
        "run finished"
    );

    Ok(HarnessReport {
        run_id: layout.run_id.clone(),
        baseline_dir: layout.variant_dir(Variant::Baseline),
        new_dir: layout.variant_dir(Variant::New),
        summary: batch.summary,
        outcomes: batch.outcomes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;

    #[tokio::test]
    async fn test_invalid_config_rejected_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig {
            cases_path: dir.path().join("missing.json"),
            output_dir: dir.path().join("out"),
            runner: RunnerConfig::new("ftp://nope"),
            ..Default::default()
        };
        let err = run_harness(&config).await.unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
        assert!(!dir.path().join("out").exists());
    }

    #[tokio::test]
    async fn test_missing_case_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig {
            cases_path: dir.path().join("missing.json"),
            output_dir: dir.path().join("out"),
            ..Default::default()
        };
        assert!(matches!(
            run_harness(&config).await,
            Err(RunnerError::CaseFile { .. })
        ));
    }

    #[tokio::test]
    async fn test_existing_run_id_refused() {
        let dir = tempfile::tempdir().unwrap();
        let cases = dir.path().join("cases.json");
        std::fs::write(&cases, r#"[{"id": "a", "input": {"user": "hi"}}]"#).unwrap();
        let layout = RunLayout::with_run_id(dir.path().join("out"), "taken");
        layout.init().unwrap();
        layout
            .write_meta(&RunMeta::start("taken", vec![], &RunnerConfig::defaults()))
            .unwrap();

        let config = HarnessConfig {
            cases_path: cases,
            output_dir: dir.path().join("out"),
            run_id: Some("taken".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            run_harness(&config).await,
            Err(RunnerError::AlreadyRecorded(_))
        ));
    }
}
