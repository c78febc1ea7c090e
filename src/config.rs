//! Configuration management with environment variable support.
//!
//! This module provides the resolved, immutable configuration for one run:
//! - Environment variables for all configurable values (read by the CLI)
//! - Sensible defaults matching the behaviour downstream tooling expects
//! - Builder pattern for programmatic configuration
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `AGENT_RUNNER_BASE_URL` | Agent endpoint base URL | `http://localhost:8787` |
//! | `AGENT_RUNNER_CASES` | Case definition file | `cases/cases.json` |
//! | `AGENT_RUNNER_OUT` | Output root directory | `runs` |
//! | `AGENT_RUNNER_TIMEOUT_MS` | Per-request deadline (ms) | `15000` |
//! | `AGENT_RUNNER_RETRIES` | Retries after the first attempt | `2` |
//! | `AGENT_RUNNER_BACKOFF_MS` | Back-off base (ms) | `250` |
//! | `AGENT_RUNNER_CONCURRENCY` | Worker count | `4` |
//! | `AGENT_RUNNER_BODY_SNIPPET_BYTES` | In-memory snippet cap | `2048` |
//! | `AGENT_RUNNER_MAX_BODY_BYTES` | Captured body cap | `1048576` |
//! | `AGENT_RUNNER_SAVE_FULL_BODY_ON_FAILURE` | Persist failure bodies | `false` |
//! | `AGENT_RUNNER_REDACTION_PRESET` | Artifact redaction | `none` |
//!
//! # Example
//!
//! ```bash
//! export AGENT_RUNNER_BASE_URL="http://127.0.0.1:9000"
//! export AGENT_RUNNER_CONCURRENCY=8
//! agent-runner --only case_a,case_b
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RunnerError, RunnerResult};
use crate::sanitize::RedactionPreset;

// ============================================================================
// Default Values
// ============================================================================

/// Default agent endpoint base URL
pub const DEFAULT_BASE_URL: &str = "http://localhost:8787";

/// Default case definition file
pub const DEFAULT_CASES_PATH: &str = "cases/cases.json";

/// Default output root
pub const DEFAULT_OUT_DIR: &str = "runs";

/// Default per-request timeout (milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;

/// Default number of retries after the first attempt
pub const DEFAULT_RETRIES: u32 = 2;

/// Default exponential back-off base (milliseconds)
pub const DEFAULT_BACKOFF_MS: u64 = 250;

/// Default worker count
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default in-memory snippet cap (bytes)
pub const DEFAULT_BODY_SNIPPET_BYTES: usize = 2048;

/// Default captured body cap (bytes)
pub const DEFAULT_MAX_BODY_BYTES: u64 = 1024 * 1024;

/// Route appended to the base URL for every case call
pub const RUN_CASE_PATH: &str = "/run-case";

// ============================================================================
// Environment Variable Names
// ============================================================================

/// Environment variable for the base URL
pub const ENV_BASE_URL: &str = "AGENT_RUNNER_BASE_URL";

/// Environment variable for the case file
pub const ENV_CASES: &str = "AGENT_RUNNER_CASES";

/// Environment variable for the output root
pub const ENV_OUT: &str = "AGENT_RUNNER_OUT";

/// Environment variable for the run id
pub const ENV_RUN_ID: &str = "AGENT_RUNNER_RUN_ID";

/// Environment variable for the case-id allowlist
pub const ENV_ONLY: &str = "AGENT_RUNNER_ONLY";

/// Environment variable for the per-request timeout
pub const ENV_TIMEOUT_MS: &str = "AGENT_RUNNER_TIMEOUT_MS";

/// Environment variable for the retry count
pub const ENV_RETRIES: &str = "AGENT_RUNNER_RETRIES";

/// Environment variable for the back-off base
pub const ENV_BACKOFF_MS: &str = "AGENT_RUNNER_BACKOFF_MS";

/// Environment variable for the worker count
pub const ENV_CONCURRENCY: &str = "AGENT_RUNNER_CONCURRENCY";

/// Environment variable for the snippet cap
pub const ENV_BODY_SNIPPET_BYTES: &str = "AGENT_RUNNER_BODY_SNIPPET_BYTES";

/// Environment variable for the captured body cap
pub const ENV_MAX_BODY_BYTES: &str = "AGENT_RUNNER_MAX_BODY_BYTES";

/// Environment variable for persisting failure bodies
pub const ENV_SAVE_FULL_BODY_ON_FAILURE: &str = "AGENT_RUNNER_SAVE_FULL_BODY_ON_FAILURE";

/// Environment variable for the redaction preset
pub const ENV_REDACTION_PRESET: &str = "AGENT_RUNNER_REDACTION_PRESET";

/// Resolved configuration for one run.
///
/// Shared read-only by every worker; serialised into `run.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Endpoint base URL without trailing slash
    pub base_url: String,
    /// Per-attempt deadline (milliseconds)
    pub timeout_ms: u64,
    /// Retries after the first attempt
    pub retries: u32,
    /// Exponential back-off base (milliseconds)
    pub backoff_ms: u64,
    /// Number of workers, at least 1
    pub concurrency: usize,
    /// In-memory snippet cap (bytes)
    pub body_snippet_bytes: usize,
    /// Captured body cap (bytes)
    pub max_body_bytes: u64,
    /// Whether failing bodies are written to the failures directory
    pub save_full_body_on_failure: bool,
    /// Redaction applied to persisted artifacts
    pub redaction: RedactionPreset,
}

impl RunnerConfig {
    /// Create a configuration for `base_url` with every other value defaulted
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            ..Self::defaults()
        }
    }

    /// Create configuration with all defaults
    pub fn defaults() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retries: DEFAULT_RETRIES,
            backoff_ms: DEFAULT_BACKOFF_MS,
            concurrency: DEFAULT_CONCURRENCY,
            body_snippet_bytes: DEFAULT_BODY_SNIPPET_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            save_full_body_on_failure: false,
            redaction: RedactionPreset::None,
        }
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn body_snippet_bytes(mut self, bytes: usize) -> Self {
        self.body_snippet_bytes = bytes;
        self
    }

    pub fn max_body_bytes(mut self, bytes: u64) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    pub fn save_full_body_on_failure(mut self, save: bool) -> Self {
        self.save_full_body_on_failure = save;
        self
    }

    pub fn redaction(mut self, preset: RedactionPreset) -> Self {
        self.redaction = preset;
        self
    }

    /// Check the invariants the executor relies on
    pub fn validate(&self) -> RunnerResult<()> {
        if self.concurrency == 0 {
            return Err(RunnerError::Config("concurrency must be at least 1".to_string()));
        }
        if self.base_url.is_empty() {
            return Err(RunnerError::Config("base URL must not be empty".to_string()));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(RunnerError::Config(format!(
                "base URL must start with http:// or https://, got '{}'",
                self.base_url
            )));
        }
        Ok(())
    }

    /// Full URL of the run-case endpoint
    pub fn run_case_url(&self) -> String {
        format!("{}{}", self.base_url, RUN_CASE_PATH)
    }

    /// Per-attempt deadline
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Trim trailing slashes so that `{base}/run-case` never doubles the separator
pub fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("http://localhost:8787/"), "http://localhost:8787");
        assert_eq!(normalize_base_url("http://localhost:8787"), "http://localhost:8787");
        assert_eq!(normalize_base_url(" http://a//"), "http://a");
    }

    #[test]
    fn test_config_defaults() {
        let config = RunnerConfig::defaults();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.retries, DEFAULT_RETRIES);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert!(!config.save_full_body_on_failure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = RunnerConfig::new("http://127.0.0.1:9000/")
            .timeout_ms(500)
            .retries(0)
            .backoff_ms(10)
            .concurrency(2)
            .max_body_bytes(64);

        assert_eq!(config.run_case_url(), "http://127.0.0.1:9000/run-case");
        assert_eq!(config.timeout(), Duration::from_millis(500));
        assert_eq!(config.retries, 0);
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.max_body_bytes, 64);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = RunnerConfig::defaults().concurrency(0);
        assert!(matches!(config.validate(), Err(RunnerError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let config = RunnerConfig::new("ftp://example.com");
        assert!(config.validate().is_err());
    }
}
