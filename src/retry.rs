//! Retry loop around a single attempt executor.
//!
//! Attempts for one (case, variant) pair run strictly one after another. A
//! transient failure is retried after an exponential backoff with up to 20%
//! jitter; a permanent failure, or running out of attempts, ends the loop with
//! the last failure. The controller never errors: every pair ends with a
//! [`CaseRun`].

use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RunnerConfig;
use crate::executor::AttemptExecutor;
use crate::loops;
use crate::runner::{AttemptRecord, AttemptStatus, CaseResult, CaseRun};
use crate::types::{CaseItem, Variant};

/// Largest exponent applied to the base backoff
pub const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Fraction of the base delay added at most as jitter
pub const JITTER_FRACTION: f64 = 0.2;

/// Retry budget and backoff base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    /// Base delay before the first retry
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff_ms: u64) -> Self {
        Self { retries, backoff_ms }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.retries, config.backoff_ms)
    }

    /// Total attempts allowed, including the first
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// `backoff_ms * 2^min(6, attempt - 1)` for the attempt that just failed
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.backoff_ms.saturating_mul(1 << exponent)
    }

    /// Base delay plus `unit * 20%` of it; `unit` is expected in `[0, 1)`
    pub fn backoff_delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_delay_ms(attempt);
        let unit = unit.clamp(0.0, 1.0);
        let jitter = (base as f64 * JITTER_FRACTION * unit).floor() as u64;
        Duration::from_millis(base.saturating_add(jitter))
    }

    /// Backoff with a random jitter draw
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let unit: f64 = rand::thread_rng().r#gen();
        self.backoff_delay_with_jitter(attempt, unit)
    }
}

/// Runs attempts for one pair until success, a permanent failure, or the
/// budget is spent
#[derive(Debug)]
pub struct RetryController<E> {
    executor: E,
    policy: RetryPolicy,
}

impl<E: AttemptExecutor> RetryController<E> {
    pub fn new(executor: E, policy: RetryPolicy) -> Self {
        Self { executor, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Drive one (case, variant) pair to its final result
    pub async fn run(&self, case: &CaseItem, variant: Variant) -> CaseRun {
        let max_attempts = self.policy.max_attempts();
        let mut attempts = Vec::new();
        let mut attempt = 1;

        loop {
            let started_at = Utc::now();
            let clock = Instant::now();
            let outcome = self.executor.execute(case, variant, attempt).await;
            let latency_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

            match outcome {
                Ok(mut payload) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        started_at,
                        latency_ms,
                        status: AttemptStatus::Success,
                    });
                    let analysis = loops::analyze_payload(&payload);
                    if loops::merge_into_payload(&mut payload, &analysis) {
                        tracing::info!(case_id = %case.id, version = %variant, "loop pattern detected in trace");
                    }
                    return CaseRun {
                        case_id: case.id.clone(),
                        variant,
                        result: CaseResult::Success(payload),
                        attempts,
                    };
                }
                Err(failure) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        started_at,
                        latency_ms,
                        status: AttemptStatus::Failed {
                            class: failure.class,
                            is_transient: failure.is_transient,
                        },
                    });

                    if !failure.is_transient || attempt >= max_attempts {
                        tracing::warn!(
                            case_id = %case.id,
                            version = %variant,
                            attempt,
                            class = %failure.class,
                            transient = failure.is_transient,
                            "giving up on case"
                        );
                        return CaseRun {
                            case_id: case.id.clone(),
                            variant,
                            result: CaseResult::Failure(failure),
                            attempts,
                        };
                    }

                    let wait = self.policy.backoff_delay(attempt);
                    tracing::warn!(
                        case_id = %case.id,
                        version = %variant,
                        attempt,
                        max_attempts,
                        class = %failure.class,
                        wait_ms = wait.as_millis() as u64,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::AttemptOutcome;
    use crate::failure::{
        AttemptInfo, FailureArtifact, FailureClass, ThrownError, classify_body_error, classify_http,
        classify_thrown,
    };
    use serde_json::json;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::Mutex;

    /// Replays a fixed sequence of outcomes and records attempt numbers
    struct Scripted {
        script: Mutex<VecDeque<Step>>,
        seen: Mutex<Vec<u32>>,
    }

    enum Step {
        Ok(serde_json::Value),
        Http(u16),
        Deadline,
        BadJson,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                script: Mutex::new(steps.into()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn attempts_seen(&self) -> Vec<u32> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl AttemptExecutor for &Scripted {
        fn execute(
            &self,
            case: &CaseItem,
            variant: Variant,
            attempt: u32,
        ) -> impl Future<Output = AttemptOutcome> + Send {
            self.seen.lock().unwrap().push(attempt);
            let step = self.script.lock().unwrap().pop_front().expect("script exhausted");
            let info = AttemptInfo {
                case_id: &case.id,
                version: variant,
                url: "http://test/run-case",
                attempt,
                timeout_ms: 100,
                max_body_bytes: 1024,
            };
            let outcome = match step {
                Step::Ok(value) => Ok(value),
                Step::Http(status) => Err(FailureArtifact::new(info, classify_http(status), 1).with_status(status, None)),
                Step::Deadline => Err(FailureArtifact::new(info, classify_thrown(&ThrownError::deadline(100)), 100)),
                Step::BadJson => Err(FailureArtifact::new(info, classify_body_error(), 1)),
            };
            async move { outcome }
        }
    }

    fn case() -> CaseItem {
        CaseItem::new("c1", "hello")
    }

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(10, 100);
        assert_eq!(policy.base_delay_ms(1), 100);
        assert_eq!(policy.base_delay_ms(2), 200);
        assert_eq!(policy.base_delay_ms(3), 400);
        assert_eq!(policy.base_delay_ms(7), 6400);
        assert_eq!(policy.base_delay_ms(20), 6400);
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::new(3, 250);
        for attempt in 1..=8 {
            let base = policy.base_delay_ms(attempt);
            assert_eq!(policy.backoff_delay_with_jitter(attempt, 0.0).as_millis() as u64, base);
            let high = policy.backoff_delay_with_jitter(attempt, 0.999_999).as_millis() as u64;
            assert!(high >= base);
            assert!((high as f64) < base as f64 * 1.2);
            for _ in 0..20 {
                let random = policy.backoff_delay(attempt).as_millis() as u64;
                assert!(random >= base && (random as f64) < base as f64 * 1.2);
            }
        }
    }

    #[test]
    fn test_zero_backoff() {
        let policy = RetryPolicy::new(2, 0);
        assert_eq!(policy.backoff_delay(3), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhausts_budget() {
        let exec = Scripted::new(vec![Step::Http(500), Step::Http(500), Step::Http(500)]);
        let controller = RetryController::new(&exec, RetryPolicy::new(2, 10));
        let run = controller.run(&case(), Variant::Baseline).await;

        assert_eq!(exec.attempts_seen(), vec![1, 2, 3]);
        assert_eq!(run.attempts.len(), 3);
        let failure = run.result.failure().unwrap();
        assert_eq!(failure.class, FailureClass::HttpError);
        assert_eq!(failure.attempt, 3);
        assert!(failure.is_transient);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_stops_immediately() {
        let exec = Scripted::new(vec![Step::Http(404)]);
        let controller = RetryController::new(&exec, RetryPolicy::new(5, 10));
        let run = controller.run(&case(), Variant::New).await;

        assert_eq!(exec.attempts_seen(), vec![1]);
        assert_eq!(run.result.failure().unwrap().status, Some(404));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_json_not_retried() {
        let exec = Scripted::new(vec![Step::BadJson]);
        let controller = RetryController::new(&exec, RetryPolicy::new(3, 10));
        let run = controller.run(&case(), Variant::New).await;

        assert_eq!(exec.attempts_seen(), vec![1]);
        assert_eq!(run.result.failure().unwrap().class, FailureClass::InvalidJson);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_timeout() {
        let exec = Scripted::new(vec![Step::Deadline, Step::Ok(json!({"case_id": "c1", "events": []}))]);
        let controller = RetryController::new(&exec, RetryPolicy::new(2, 50));
        let run = controller.run(&case(), Variant::Baseline).await;

        assert!(run.result.is_success());
        assert_eq!(exec.attempts_seen(), vec![1, 2]);
        assert_eq!(run.attempts[0].status, AttemptStatus::Failed { class: FailureClass::Timeout, is_transient: true });
        assert_eq!(run.attempts[1].status, AttemptStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_before_retry() {
        let exec = Scripted::new(vec![Step::Http(503), Step::Ok(json!({}))]);
        let controller = RetryController::new(&exec, RetryPolicy::new(1, 1000));
        let start = Instant::now();
        controller.run(&case(), Variant::Baseline).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(1000));
        assert!(waited < Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_gets_loop_details() {
        let payload = json!({
            "events": [
                {"type": "tool_call", "call_id": "1", "tool": "search", "args": {"q": "a"}},
                {"type": "tool_call", "call_id": "2", "tool": "search", "args": {"q": "a"}},
                {"type": "tool_call", "call_id": "3", "tool": "search", "args": {"q": "a"}}
            ],
            "token_usage": {"total": 5}
        });
        let exec = Scripted::new(vec![Step::Ok(payload)]);
        let controller = RetryController::new(&exec, RetryPolicy::new(0, 0));
        let run = controller.run(&case(), Variant::New).await;

        let CaseResult::Success(value) = run.result else {
            panic!("expected success");
        };
        assert_eq!(value["token_usage"]["loop_detected"], true);
        assert_eq!(value["token_usage"]["total"], 5);
        assert!(value["token_usage"]["loop_details"]["similarity_suspects"].is_array());
    }
}
