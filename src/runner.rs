//! Types for run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::config::RunnerConfig;
use crate::failure::{FailureArtifact, FailureClass};
use crate::types::Variant;

/// Final result of one (case, variant) pair.
///
/// Serialises to the raw endpoint JSON on success, or to a minimal
/// agent-shaped payload wrapping the failure, so consumers see one shape.
#[derive(Debug, Clone, PartialEq)]
pub enum CaseResult {
    /// Decoded endpoint payload, possibly annotated with loop findings
    Success(Value),
    /// Last failure after retries stopped
    Failure(FailureArtifact),
}

#[derive(Serialize)]
struct FinalOutput<'a> {
    content_type: &'a str,
    content: String,
}

#[derive(Serialize)]
struct FailurePayload<'a> {
    case_id: &'a str,
    version: Variant,
    proposed_actions: Vec<Value>,
    final_output: FinalOutput<'a>,
    events: Vec<Value>,
    runner_failure: &'a FailureArtifact,
}

impl CaseResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CaseResult::Success(_))
    }

    pub fn failure(&self) -> Option<&FailureArtifact> {
        match self {
            CaseResult::Success(_) => None,
            CaseResult::Failure(artifact) => Some(artifact),
        }
    }

    /// The JSON document persisted for this pair
    pub fn to_payload(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

impl Serialize for CaseResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            CaseResult::Success(payload) => payload.serialize(serializer),
            CaseResult::Failure(artifact) => FailurePayload {
                case_id: &artifact.case_id,
                version: artifact.version,
                proposed_actions: Vec::new(),
                final_output: FinalOutput {
                    content_type: "text",
                    content: artifact.summary(),
                },
                events: Vec::new(),
                runner_failure: artifact,
            }
            .serialize(serializer),
        }
    }
}

/// How one attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failed { class: FailureClass, is_transient: bool },
}

/// One HTTP call for one (case, variant) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub latency_ms: u64,
    #[serde(flatten)]
    pub status: AttemptStatus,
}

/// Everything the retry controller learned about one pair
#[derive(Debug, Clone, PartialEq)]
pub struct CaseRun {
    pub case_id: String,
    pub variant: Variant,
    pub result: CaseResult,
    pub attempts: Vec<AttemptRecord>,
}

impl CaseRun {
    /// Latency of the attempt that produced the result
    pub fn final_latency_ms(&self) -> u64 {
        self.attempts.last().map(|a| a.latency_ms).unwrap_or(0)
    }
}

/// Compact per-pair outcome collected by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseOutcome {
    pub case_id: String,
    pub variant: Variant,
    pub success: bool,
    pub attempts: u32,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
}

impl From<&CaseRun> for CaseOutcome {
    fn from(run: &CaseRun) -> Self {
        Self {
            case_id: run.case_id.clone(),
            variant: run.variant,
            success: run.result.is_success(),
            attempts: run.attempts.len() as u32,
            latency_ms: run.final_latency_ms(),
            failure_class: run.result.failure().map(|f| f.class),
        }
    }
}

/// Aggregate statistics over a set of outcomes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantStats {
    pub ok: usize,
    pub failed: usize,
    pub attempts: u64,
    pub avg_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl VariantStats {
    pub fn from_outcomes<'a>(outcomes: impl Iterator<Item = &'a CaseOutcome>) -> Self {
        let mut stats = VariantStats::default();
        let mut latencies = Vec::new();
        for outcome in outcomes {
            stats.attempts += u64::from(outcome.attempts);
            if outcome.success {
                stats.ok += 1;
                latencies.push(outcome.latency_ms);
            } else {
                stats.failed += 1;
            }
        }
        if !latencies.is_empty() {
            let total: u64 = latencies.iter().sum();
            stats.avg_ms = (total as f64 / latencies.len() as f64).round() as u64;
        }
        latencies.sort_unstable();
        stats.p95_ms = percentile(&latencies, 95);
        stats.p99_ms = percentile(&latencies, 99);
        stats
    }
}

/// Nearest-rank-below percentile over sorted values; 0 when empty
pub fn percentile(sorted: &[u64], p: u32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = ((f64::from(p) / 100.0) * (sorted.len() - 1) as f64).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Summary of a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub all: VariantStats,
    pub baseline: VariantStats,
    pub new: VariantStats,
}

impl RunSummary {
    pub fn from_outcomes(outcomes: &[CaseOutcome]) -> Self {
        Self {
            all: VariantStats::from_outcomes(outcomes.iter()),
            baseline: VariantStats::from_outcomes(
                outcomes.iter().filter(|o| o.variant == Variant::Baseline),
            ),
            new: VariantStats::from_outcomes(outcomes.iter().filter(|o| o.variant == Variant::New)),
        }
    }

    pub fn total(&self) -> usize {
        self.all.ok + self.all.failed
    }
}

/// Per-run record written as `run.json` into both variant directories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub base_url: String,
    pub case_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub config: RunnerConfig,
    pub host: String,
    pub tool_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
}

impl RunMeta {
    /// Metadata for a run that starts now
    pub fn start(run_id: impl Into<String>, case_ids: Vec<String>, config: &RunnerConfig) -> Self {
        Self {
            run_id: run_id.into(),
            base_url: config.base_url.clone(),
            case_ids,
            started_at: Utc::now(),
            finished_at: None,
            config: config.clone(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            summary: None,
        }
    }

    /// Stamp the end time and attach the summary
    pub fn finish(mut self, summary: RunSummary) -> Self {
        self.finished_at = Some(Utc::now());
        self.summary = Some(summary);
        self
    }
}
