//! Single HTTP attempt with a hard deadline.
//!
//! One attempt POSTs the case to `{base}/run-case` under a cancellation token
//! that fires at `timeout_ms`. The token covers both the request exchange and
//! the body read, so a stalled body is a timeout, never a partial success.
//! Bodies are always read through [`capture_body`], which bounds memory.

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::BufWriter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureError, CaptureLimits, CaptureMeta, capture_body, write_capture_meta};
use crate::config::RunnerConfig;
use crate::error::RunnerResult;
use crate::failure::{
    AttemptInfo, FailureArtifact, ThrownError, classify_body_error, classify_http, classify_thrown,
};
use crate::sanitize::mask_string;
use crate::session::{DiagnosticPaths, RunLayout};
use crate::types::{CaseItem, RunCaseRequest, Variant};

/// Outcome of one attempt: the decoded payload or the failure record
pub type AttemptOutcome = Result<Value, FailureArtifact>;

/// Anything that can run one attempt for a (case, variant) pair
///
/// Implementations:
/// - [`RequestExecutor`] for the real endpoint
/// - scripted executors in tests
pub trait AttemptExecutor: Send + Sync {
    /// Run attempt number `attempt` (1-based)
    fn execute(
        &self,
        case: &CaseItem,
        variant: Variant,
        attempt: u32,
    ) -> impl Future<Output = AttemptOutcome> + Send;
}

/// Cancellation token that fires once when the attempt deadline passes
struct Deadline {
    token: CancellationToken,
    timer: JoinHandle<()>,
}

impl Deadline {
    fn start(timeout: Duration) -> Self {
        let token = CancellationToken::new();
        let fire = token.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            fire.cancel();
        });
        Self { token, timer }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// Issues real HTTP attempts against the configured endpoint
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    client: reqwest::Client,
    config: Arc<RunnerConfig>,
    layout: Option<RunLayout>,
}

impl RequestExecutor {
    /// Create an executor; `layout` is where failure diagnostics go, if anywhere
    pub fn new(config: Arc<RunnerConfig>, layout: Option<RunLayout>) -> RunnerResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("agent-runner/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            config,
            layout,
        })
    }

    fn limits(&self) -> CaptureLimits {
        CaptureLimits {
            snippet_bytes: self.config.body_snippet_bytes,
            max_body_bytes: self.config.max_body_bytes,
        }
    }

    /// Paths for full-body diagnostics, when saving them is enabled
    fn diagnostic_paths(&self, info: &AttemptInfo<'_>) -> Option<DiagnosticPaths> {
        if !self.config.save_full_body_on_failure {
            return None;
        }
        self.layout
            .as_ref()
            .map(|layout| layout.diagnostic_paths(info.version, info.case_id, info.attempt))
    }

    async fn execute_attempt(&self, case: &CaseItem, variant: Variant, attempt: u32) -> AttemptOutcome {
        let url = self.config.run_case_url();
        let info = AttemptInfo {
            case_id: &case.id,
            version: variant,
            url: &url,
            attempt,
            timeout_ms: self.config.timeout_ms,
            max_body_bytes: self.config.max_body_bytes,
        };
        let started = Instant::now();
        let deadline = Deadline::start(self.config.timeout());

        tracing::debug!(case_id = %case.id, version = %variant, attempt, "sending run-case request");

        let send = self
            .client
            .post(&url)
            .json(&RunCaseRequest::new(case, variant))
            .send();

        let response = tokio::select! {
            biased;
            _ = deadline.token.cancelled() => {
                return Err(thrown_failure(info, &ThrownError::deadline(info.timeout_ms), started));
            }
            result = send => result,
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => return Err(thrown_failure(info, &ThrownError::from_reqwest(&err), started)),
        };

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        if !response.status().is_success() {
            return Err(self.http_failure(info, response, content_type, &deadline.token, started).await);
        }
        self.decode_success(info, response, content_type, &deadline.token, started)
            .await
    }

    /// Capture the error body (snippet, optionally the full body on disk) and classify
    async fn http_failure(
        &self,
        info: AttemptInfo<'_>,
        response: reqwest::Response,
        content_type: Option<String>,
        token: &CancellationToken,
        started: Instant,
    ) -> FailureArtifact {
        let status = response.status();
        let paths = self.diagnostic_paths(&info);

        let sink = match paths.as_ref() {
            Some(paths) => match tokio::fs::File::create(&paths.body).await {
                Ok(file) => Some(BufWriter::new(file)),
                Err(err) => {
                    tracing::warn!(path = %paths.body.display(), error = %err, "could not create failure body file");
                    None
                }
            },
            None => None,
        };

        let capture = capture_body(body_stream(response), sink, self.limits(), token).await;
        let capture = match capture {
            Ok(capture) => capture,
            Err(err) => {
                if let Some(paths) = paths.as_ref() {
                    discard_partial_body(&paths.body).await;
                }
                return capture_failure(info, err, started).with_status(status.as_u16(), status.canonical_reason());
            }
        };

        let mut saved_body = None;
        let mut saved_meta = None;
        if let (Some(paths), Some(_)) = (paths.as_ref(), capture.sink.as_ref()) {
            saved_body = Some(paths.body.display().to_string());
            saved_meta = self
                .write_meta(info, paths, capture.truncated, capture.bytes_written, content_type)
                .await;
        }

        FailureArtifact::new(info, classify_http(status.as_u16()), elapsed_ms(started))
            .with_status(status.as_u16(), status.canonical_reason())
            .with_error("HttpError", format!("HTTP {}", status))
            .with_body(
                mask_string(&capture.snippet, self.config.redaction),
                capture.bytes_written,
                capture.truncated,
            )
            .with_saved_paths(saved_body, saved_meta)
    }

    /// Read a 2xx body into a capped buffer and decode it
    async fn decode_success(
        &self,
        info: AttemptInfo<'_>,
        response: reqwest::Response,
        content_type: Option<String>,
        token: &CancellationToken,
        started: Instant,
    ) -> AttemptOutcome {
        let initial = response
            .content_length()
            .unwrap_or(0)
            .min(self.config.max_body_bytes)
            .min(1024 * 1024);
        let buffer: Vec<u8> = Vec::with_capacity(usize::try_from(initial).unwrap_or(0));

        let capture = capture_body(body_stream(response), Some(buffer), self.limits(), token)
            .await
            .map_err(|err| capture_failure(info, err, started))?;
        let body = capture.sink.unwrap_or_default();
        let snippet = mask_string(&capture.snippet, self.config.redaction);

        let (name, message) = if capture.truncated {
            (
                "BodyTooLarge",
                format!(
                    "response body exceeded max_body_bytes={} before it was fully read",
                    self.config.max_body_bytes
                ),
            )
        } else {
            match serde_json::from_slice::<Value>(&body) {
                Ok(payload @ Value::Object(_)) => return Ok(payload),
                Ok(_) => ("InvalidShape", "response body is not a JSON object".to_string()),
                Err(err) => ("SyntaxError", err.to_string()),
            }
        };

        let (saved_body, saved_meta) = self
            .persist_body(info, &body, capture.truncated, content_type)
            .await;

        Err(
            FailureArtifact::new(info, classify_body_error(), elapsed_ms(started))
                .with_error(name, message)
                .with_body(snippet, capture.bytes_written, capture.truncated)
                .with_saved_paths(saved_body, saved_meta),
        )
    }

    /// Best-effort write of an in-memory body plus its sidecar
    async fn persist_body(
        &self,
        info: AttemptInfo<'_>,
        body: &[u8],
        truncated: bool,
        content_type: Option<String>,
    ) -> (Option<String>, Option<String>) {
        let Some(paths) = self.diagnostic_paths(&info) else {
            return (None, None);
        };
        if let Err(err) = tokio::fs::write(&paths.body, body).await {
            tracing::warn!(path = %paths.body.display(), error = %err, "could not save failure body");
            return (None, None);
        }
        let meta = self
            .write_meta(info, &paths, truncated, body.len() as u64, content_type)
            .await;
        (Some(paths.body.display().to_string()), meta)
    }

    async fn write_meta(
        &self,
        info: AttemptInfo<'_>,
        paths: &DiagnosticPaths,
        truncated: bool,
        bytes_written: u64,
        content_type: Option<String>,
    ) -> Option<String> {
        let meta = CaptureMeta {
            case_id: info.case_id.to_string(),
            version: info.version,
            attempt: info.attempt,
            max_body_bytes: info.max_body_bytes,
            truncated,
            bytes_written,
            content_type,
        };
        match write_capture_meta(&paths.meta, &meta).await {
            Ok(()) => Some(paths.meta.display().to_string()),
            Err(err) => {
                tracing::warn!(path = %paths.meta.display(), error = %err, "could not save failure body metadata");
                None
            }
        }
    }
}

impl AttemptExecutor for RequestExecutor {
    fn execute(
        &self,
        case: &CaseItem,
        variant: Variant,
        attempt: u32,
    ) -> impl Future<Output = AttemptOutcome> + Send {
        self.execute_attempt(case, variant, attempt)
    }
}

fn body_stream(response: reqwest::Response) -> impl Stream<Item = Result<Bytes, ThrownError>> + Unpin {
    Box::pin(
        response
            .bytes_stream()
            .map_err(|err| ThrownError::from_reqwest(&err)),
    )
}

/// Remove a body file left behind by an interrupted capture
async fn discard_partial_body(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "could not remove partial failure body");
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn thrown_failure(info: AttemptInfo<'_>, error: &ThrownError, started: Instant) -> FailureArtifact {
    FailureArtifact::new(info, classify_thrown(error), elapsed_ms(started))
        .with_error(error.name.clone(), error.message.clone())
}

fn capture_failure(info: AttemptInfo<'_>, error: CaptureError, started: Instant) -> FailureArtifact {
    let thrown = match error {
        CaptureError::Cancelled => ThrownError::deadline(info.timeout_ms),
        CaptureError::Source(thrown) => thrown,
    };
    thrown_failure(info, &thrown, started)
}
