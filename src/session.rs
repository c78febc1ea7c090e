//! Output layout for one run.
//!
//! Every run writes two self-describing directories:
//!
//! ```text
//! <out>/baseline/<run_id>/run.json
//! <out>/baseline/<run_id>/<case_id>.json
//! <out>/baseline/<run_id>/failures/<case_id>__baseline__attempt<N>.body
//! <out>/baseline/<run_id>/failures/<case_id>__baseline__attempt<N>.meta.json
//! <out>/new/<run_id>/...
//! ```

use std::fs;
use std::path::PathBuf;

use crate::runner::RunMeta;
use crate::types::Variant;

/// File name of the per-variant run metadata
pub const RUN_META_FILE: &str = "run.json";

/// Subdirectory holding failure diagnostics
pub const FAILURES_DIR: &str = "failures";

/// Paths of a run's output tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    /// Run identifier, shared by both variant directories
    pub run_id: String,
    /// Output root
    pub out_dir: PathBuf,
}

/// Paths of one diagnostic capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticPaths {
    pub body: PathBuf,
    pub meta: PathBuf,
}

impl RunLayout {
    /// Create a layout with a fresh run id
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self::with_run_id(out_dir, generate_run_id())
    }

    /// Create a layout for an explicit run id
    pub fn with_run_id(out_dir: impl Into<PathBuf>, run_id: impl AsRef<str>) -> Self {
        Self {
            run_id: sanitize_name(run_id.as_ref()),
            out_dir: out_dir.into(),
        }
    }

    /// `<out>/<variant>/<run_id>`
    pub fn variant_dir(&self, variant: Variant) -> PathBuf {
        self.out_dir.join(variant.as_str()).join(&self.run_id)
    }

    /// `<out>/<variant>/<run_id>/failures`
    pub fn failures_dir(&self, variant: Variant) -> PathBuf {
        self.variant_dir(variant).join(FAILURES_DIR)
    }

    /// Result file of one (case, variant) pair
    pub fn case_result_path(&self, variant: Variant, case_id: &str) -> PathBuf {
        self.variant_dir(variant)
            .join(format!("{}.json", sanitize_name(case_id)))
    }

    /// Deterministic diagnostic file names for one attempt
    pub fn diagnostic_paths(&self, variant: Variant, case_id: &str, attempt: u32) -> DiagnosticPaths {
        let stem = format!("{}__{}__attempt{}", sanitize_name(case_id), variant, attempt);
        let dir = self.failures_dir(variant);
        DiagnosticPaths {
            body: dir.join(format!("{}.body", stem)),
            meta: dir.join(format!("{}.meta.json", stem)),
        }
    }

    /// Create both variant directories and their failures subdirectories
    pub fn init(&self) -> std::io::Result<()> {
        for variant in Variant::ALL {
            fs::create_dir_all(self.failures_dir(variant))?;
        }
        Ok(())
    }

    /// Write `run.json` into both variant directories
    pub fn write_meta(&self, meta: &RunMeta) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(meta)?;
        for variant in Variant::ALL {
            fs::write(self.variant_dir(variant).join(RUN_META_FILE), &json)?;
        }
        Ok(())
    }

    /// Read back the metadata of one variant
    pub fn read_meta(&self, variant: Variant) -> std::io::Result<RunMeta> {
        let raw = fs::read(self.variant_dir(variant).join(RUN_META_FILE))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Generate a unique, sortable run id
pub fn generate_run_id() -> String {
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    format!("run_{}_{}", timestamp, std::process::id())
}

/// Sanitize a name for use in filenames
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}
