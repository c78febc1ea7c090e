use serde::Serialize;
use std::path::PathBuf;

use crate::config::{DEFAULT_CASES_PATH, DEFAULT_OUT_DIR, RunnerConfig};
use crate::runner::{CaseOutcome, RunSummary};

/// Configuration for one harness run
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Path to the JSON case file
    pub cases_path: PathBuf,

    /// Output root; results land in `<out>/<variant>/<run_id>/`
    pub output_dir: PathBuf,

    /// Explicit run id, generated when absent
    pub run_id: Option<String>,

    /// Allowlist of case ids
    pub only: Option<Vec<String>>,

    /// Executor, retry and capture settings
    pub runner: RunnerConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            cases_path: PathBuf::from(DEFAULT_CASES_PATH),
            output_dir: PathBuf::from(DEFAULT_OUT_DIR),
            run_id: None,
            only: None,
            runner: RunnerConfig::defaults(),
        }
    }
}

/// What a finished run produced
#[derive(Debug, Clone, Serialize)]
pub struct HarnessReport {
    pub run_id: String,
    /// `<out>/baseline/<run_id>`
    pub baseline_dir: PathBuf,
    /// `<out>/new/<run_id>`
    pub new_dir: PathBuf,
    pub summary: RunSummary,
    pub outcomes: Vec<CaseOutcome>,
}

impl HarnessReport {
    /// Pairs that ended in a failure artifact
    pub fn failures(&self) -> impl Iterator<Item = &CaseOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }
}
