//! Agent Runner - resilient execution of evaluation cases against two agent deployments.
//!
//! This crate provides:
//! - A single-attempt HTTP executor with a hard per-attempt deadline
//! - Bounded streaming capture of response bodies (snippet plus optional file)
//! - A failure taxonomy with transient/permanent verdicts and retry with jittered back-off
//! - A fixed-size worker pool that runs every case against `baseline` and `new`
//! - Loop detection over the execution trace of successful responses
//! - Redaction of persisted artifacts
//!
//! # Example
//!
//! ```rust,no_run
//! use agent_runner::{HarnessConfig, RunnerConfig, run_harness};
//!
//! # async fn demo() -> agent_runner::RunnerResult<()> {
//! let config = HarnessConfig {
//!     runner: RunnerConfig::new("http://127.0.0.1:8787").concurrency(8),
//!     ..Default::default()
//! };
//! let report = run_harness(&config).await?;
//! println!("{} ok, {} failed", report.summary.all.ok, report.summary.all.failed);
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod cases;
pub mod config;
pub mod error;
pub mod executor;
pub mod failure;
pub mod harness;
pub mod loops;
pub mod retry;
pub mod runner;
pub mod sanitize;
pub mod scheduler;
pub mod session;
pub mod types;

// Re-export configuration and errors
pub use config::RunnerConfig;
pub use error::{RunnerError, RunnerResult};

// Re-export the run entry point
pub use harness::{HarnessConfig, HarnessReport, run_harness};

// Re-export the execution pipeline
pub use executor::{AttemptExecutor, AttemptOutcome, RequestExecutor};
pub use retry::{RetryController, RetryPolicy};
pub use scheduler::{BatchReport, ConcurrencyScheduler, FsRecorder, RunRecorder};

// Re-export result and failure types
pub use failure::{FailureArtifact, FailureClass, NetErrorKind};
pub use runner::{CaseResult, CaseRun, RunMeta, RunSummary};
pub use types::{CaseItem, Variant};
