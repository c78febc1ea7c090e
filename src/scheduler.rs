//! Bounded worker pool over the selected cases.
//!
//! `concurrency` workers share one atomic cursor into the case list. Each
//! worker claims the next index, runs baseline then new for that case, hands
//! both results to the recorder and claims again until the cursor passes the
//! end. Every case index is claimed exactly once, so every (case, variant)
//! pair is executed and recorded exactly once.

use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{RunnerError, RunnerResult};
use crate::executor::AttemptExecutor;
use crate::retry::RetryController;
use crate::runner::{CaseOutcome, CaseRun, RunSummary};
use crate::sanitize::{RedactionPreset, sanitize_value};
use crate::session::RunLayout;
use crate::types::{CaseItem, Variant};

/// Destination for finished (case, variant) results
pub trait RunRecorder: Send + Sync {
    /// Persist one final result; called once per pair
    fn record(&self, run: &CaseRun) -> impl Future<Output = RunnerResult<()>> + Send;
}

/// Writes `<out>/<variant>/<run_id>/<case_id>.json`, redacted
#[derive(Debug, Clone)]
pub struct FsRecorder {
    layout: RunLayout,
    redaction: RedactionPreset,
}

impl FsRecorder {
    pub fn new(layout: RunLayout, redaction: RedactionPreset) -> Self {
        Self { layout, redaction }
    }

    async fn write_result(&self, run: &CaseRun) -> RunnerResult<()> {
        let path = self.layout.case_result_path(run.variant, &run.case_id);
        let payload: Value = sanitize_value(&run.result.to_payload()?, self.redaction);
        let json = serde_json::to_vec_pretty(&payload)?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::AlreadyExists => RunnerError::AlreadyRecorded(path.clone()),
                _ => RunnerError::Io(err),
            })?;
        file.write_all(&json).await?;
        file.flush().await?;
        tracing::debug!(path = %path.display(), "wrote case result");
        Ok(())
    }

    pub fn result_path(&self, variant: Variant, case_id: &str) -> PathBuf {
        self.layout.case_result_path(variant, case_id)
    }
}

impl RunRecorder for FsRecorder {
    fn record(&self, run: &CaseRun) -> impl Future<Output = RunnerResult<()>> + Send {
        self.write_result(run)
    }
}

/// What a scheduled batch produced
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    /// One outcome per pair, in case-file order, baseline before new
    pub outcomes: Vec<CaseOutcome>,
    pub summary: RunSummary,
}

/// Fixed-size worker pool sharing one cursor
pub struct ConcurrencyScheduler<E, R> {
    controller: Arc<RetryController<E>>,
    recorder: Arc<R>,
    concurrency: usize,
}

impl<E, R> ConcurrencyScheduler<E, R>
where
    E: AttemptExecutor + 'static,
    R: RunRecorder + 'static,
{
    pub fn new(controller: RetryController<E>, recorder: R, concurrency: usize) -> Self {
        Self {
            controller: Arc::new(controller),
            recorder: Arc::new(recorder),
            concurrency: concurrency.max(1),
        }
    }

    /// Run every case against both variants.
    ///
    /// A recorder error stops all workers from claiming further cases and is
    /// returned once in-flight cases finish.
    pub async fn run(&self, cases: Vec<CaseItem>) -> RunnerResult<BatchReport> {
        let cases: Arc<[CaseItem]> = cases.into();
        let cursor = Arc::new(AtomicUsize::new(0));
        let stop = CancellationToken::new();
        let workers = self.concurrency;

        tracing::info!(cases = cases.len(), workers, "starting workers");

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let cases = Arc::clone(&cases);
            let cursor = Arc::clone(&cursor);
            let stop = stop.clone();
            let controller = Arc::clone(&self.controller);
            let recorder = Arc::clone(&self.recorder);
            handles.push(tokio::spawn(async move {
                worker(worker_id, &cases, &cursor, &stop, &controller, recorder.as_ref()).await
            }));
        }

        let mut claimed: Vec<(usize, CaseOutcome)> = Vec::with_capacity(cases.len() * 2);
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(outcomes)) => claimed.extend(outcomes),
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join) => {
                    stop.cancel();
                    first_error.get_or_insert(RunnerError::Worker(join.to_string()));
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        claimed.sort_by_key(|(index, outcome)| (*index, outcome.variant != Variant::Baseline));
        let outcomes: Vec<CaseOutcome> = claimed.into_iter().map(|(_, outcome)| outcome).collect();
        let summary = RunSummary::from_outcomes(&outcomes);
        Ok(BatchReport { outcomes, summary })
    }
}

async fn worker<E, R>(
    worker_id: usize,
    cases: &[CaseItem],
    cursor: &AtomicUsize,
    stop: &CancellationToken,
    controller: &RetryController<E>,
    recorder: &R,
) -> RunnerResult<Vec<(usize, CaseOutcome)>>
where
    E: AttemptExecutor,
    R: RunRecorder,
{
    let mut outcomes = Vec::new();
    loop {
        if stop.is_cancelled() {
            break;
        }
        let index = cursor.fetch_add(1, Ordering::SeqCst);
        let Some(case) = cases.get(index) else {
            break;
        };

        for variant in Variant::ALL {
            let run = controller.run(case, variant).await;
            tracing::info!(
                worker_id,
                case_id = %case.id,
                version = %variant,
                success = run.result.is_success(),
                attempts = run.attempts.len(),
                "case finished"
            );
            if let Err(err) = recorder.record(&run).await {
                tracing::error!(case_id = %case.id, version = %variant, error = %err, "failed to record result");
                stop.cancel();
                return Err(err);
            }
            outcomes.push((index, CaseOutcome::from(&run)));
        }
    }
    tracing::debug!(worker_id, "worker done");
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::AttemptOutcome;
    use crate::failure::{AttemptInfo, FailureArtifact, classify_http};
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Sleeps per attempt and tracks peak parallelism
    #[derive(Default)]
    struct SlowExecutor {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail_case: Option<String>,
    }

    impl AttemptExecutor for Arc<SlowExecutor> {
        fn execute(
            &self,
            case: &CaseItem,
            variant: Variant,
            attempt: u32,
        ) -> impl Future<Output = AttemptOutcome> + Send {
            let this = Arc::clone(self);
            let case_id = case.id.clone();
            async move {
                let now = this.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                this.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                this.in_flight.fetch_sub(1, Ordering::SeqCst);

                if this.fail_case.as_deref() == Some(case_id.as_str()) {
                    let info = AttemptInfo {
                        case_id: &case_id,
                        version: variant,
                        url: "http://test/run-case",
                        attempt,
                        timeout_ms: 100,
                        max_body_bytes: 10,
                    };
                    return Err(FailureArtifact::new(info, classify_http(400), 20).with_status(400, None));
                }
                Ok(json!({"case_id": case_id, "version": variant.as_str()}))
            }
        }
    }

    /// Counts writes per pair
    #[derive(Default)]
    struct MemoryRecorder {
        writes: Mutex<HashMap<(String, Variant), usize>>,
        fail_on: Option<String>,
    }

    impl RunRecorder for MemoryRecorder {
        fn record(&self, run: &CaseRun) -> impl Future<Output = RunnerResult<()>> + Send {
            let result = if self.fail_on.as_deref() == Some(run.case_id.as_str()) {
                Err(RunnerError::AlreadyRecorded(PathBuf::from(&run.case_id)))
            } else {
                *self
                    .writes
                    .lock()
                    .unwrap()
                    .entry((run.case_id.clone(), run.variant))
                    .or_default() += 1;
                Ok(())
            };
            async move { result }
        }
    }

    /// Succeeds immediately
    struct InstantExecutor;

    impl AttemptExecutor for InstantExecutor {
        fn execute(
            &self,
            _case: &CaseItem,
            _variant: Variant,
            _attempt: u32,
        ) -> impl Future<Output = AttemptOutcome> + Send {
            async { Ok(json!({})) }
        }
    }

    fn cases(n: usize) -> Vec<CaseItem> {
        (0..n).map(|i| CaseItem::new(format!("case_{:02}", i), "hi")).collect()
    }

    #[tokio::test]
    async fn test_every_pair_once_with_bounded_parallelism() {
        let exec = Arc::new(SlowExecutor::default());
        let recorder = Arc::new(MemoryRecorder::default());
        let scheduler = ConcurrencyScheduler {
            controller: Arc::new(RetryController::new(Arc::clone(&exec), RetryPolicy::new(0, 0))),
            recorder: Arc::clone(&recorder),
            concurrency: 3,
        };

        let report = scheduler.run(cases(10)).await.unwrap();

        assert_eq!(report.outcomes.len(), 20);
        assert_eq!(report.summary.all.ok, 20);
        assert!(exec.peak.load(Ordering::SeqCst) <= 3);
        let writes = recorder.writes.lock().unwrap();
        assert_eq!(writes.len(), 20);
        assert!(writes.values().all(|count| *count == 1));
    }

    #[tokio::test]
    async fn test_outcomes_in_file_order() {
        let exec = Arc::new(SlowExecutor {
            fail_case: Some("case_01".to_string()),
            ..Default::default()
        });
        let scheduler = ConcurrencyScheduler::new(
            RetryController::new(exec, RetryPolicy::new(0, 0)),
            MemoryRecorder::default(),
            4,
        );
        let report = scheduler.run(cases(3)).await.unwrap();

        let order: Vec<(&str, Variant)> = report
            .outcomes
            .iter()
            .map(|o| (o.case_id.as_str(), o.variant))
            .collect();
        assert_eq!(
            order,
            vec![
                ("case_00", Variant::Baseline),
                ("case_00", Variant::New),
                ("case_01", Variant::Baseline),
                ("case_01", Variant::New),
                ("case_02", Variant::Baseline),
                ("case_02", Variant::New),
            ]
        );
        assert_eq!(report.summary.all.failed, 2);
        assert_eq!(report.summary.baseline.failed, 1);
    }

    #[tokio::test]
    async fn test_more_workers_than_cases() {
        let scheduler = ConcurrencyScheduler::new(
            RetryController::new(InstantExecutor, RetryPolicy::new(0, 0)),
            MemoryRecorder::default(),
            16,
        );
        let report = scheduler.run(cases(2)).await.unwrap();
        assert_eq!(report.outcomes.len(), 4);
    }

    #[tokio::test]
    async fn test_recorder_error_fails_run() {
        let scheduler = ConcurrencyScheduler::new(
            RetryController::new(Arc::new(SlowExecutor::default()), RetryPolicy::new(0, 0)),
            MemoryRecorder {
                fail_on: Some("case_00".to_string()),
                ..Default::default()
            },
            1,
        );
        let err = scheduler.run(cases(5)).await.unwrap_err();
        assert!(matches!(err, RunnerError::AlreadyRecorded(_)));
    }

    #[tokio::test]
    async fn test_fs_recorder_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::with_run_id(dir.path(), "r1");
        layout.init().unwrap();
        let recorder = FsRecorder::new(layout, RedactionPreset::InternalOnly);
        let run = CaseRun {
            case_id: "c1".to_string(),
            variant: Variant::New,
            result: crate::runner::CaseResult::Success(json!({"text": "mail bob@example.com"})),
            attempts: Vec::new(),
        };

        recorder.record(&run).await.unwrap();
        let written: Value =
            serde_json::from_slice(&std::fs::read(recorder.result_path(Variant::New, "c1")).unwrap()).unwrap();
        assert_eq!(written["text"], "mail [redacted_email]");

        let again = recorder.record(&run).await.unwrap_err();
        assert!(matches!(again, RunnerError::AlreadyRecorded(_)));
    }
}
