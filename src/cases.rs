//! Case file loading and allowlist selection.

use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

use crate::error::{RunnerError, RunnerResult};
use crate::session::sanitize_name;
use crate::types::{CaseInput, CaseItem};

/// Load a case file: a JSON array of `{id, title?, input: {user?, context?}}`.
///
/// Items are coerced leniently: scalar ids are stringified, a missing title
/// or user message becomes the empty string. An item without an id is
/// rejected.
pub fn load_cases(path: &Path) -> RunnerResult<Vec<CaseItem>> {
    let raw = std::fs::read_to_string(path).map_err(|err| RunnerError::CaseFile {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    parse_cases(&raw).map_err(|message| RunnerError::CaseFile {
        path: path.to_path_buf(),
        message,
    })
}

/// Parse case file contents
pub fn parse_cases(raw: &str) -> Result<Vec<CaseItem>, String> {
    let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let Value::Array(items) = value else {
        return Err("case file must be a JSON array".to_string());
    };
    items
        .iter()
        .enumerate()
        .map(|(index, item)| parse_case(item).ok_or_else(|| format!("item {} has no usable id", index)))
        .collect()
}

fn parse_case(item: &Value) -> Option<CaseItem> {
    let id = match item.get("id")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    let title = item
        .get("title")
        .map(coerce_string)
        .unwrap_or_default();
    let input = item.get("input");
    let user = input
        .and_then(|i| i.get("user"))
        .map(coerce_string)
        .unwrap_or_default();
    let context = input
        .and_then(|i| i.get("context"))
        .filter(|c| !c.is_null())
        .cloned();
    Some(CaseItem {
        id,
        title,
        input: CaseInput { user, context },
    })
}

fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Split a comma-separated allowlist; `None` when nothing usable remains
pub fn parse_only_case_ids(raw: Option<&str>) -> Option<Vec<String>> {
    let ids: Vec<String> = raw?
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() { None } else { Some(ids) }
}

/// Apply an allowlist, keeping file order.
///
/// Unknown ids are logged. A case whose result file name collides with an
/// earlier case (same id, or same id after sanitising) is skipped with a
/// warning. Selecting nothing is an error.
pub fn select_cases(cases: Vec<CaseItem>, only: Option<&[String]>) -> RunnerResult<Vec<CaseItem>> {
    let selected = match only {
        None => cases,
        Some(ids) => {
            let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
            let known: HashSet<&str> = cases.iter().map(|c| c.id.as_str()).collect();
            let unknown: Vec<&str> = ids
                .iter()
                .map(String::as_str)
                .filter(|id| !known.contains(id))
                .collect();
            if !unknown.is_empty() {
                tracing::warn!(unknown = ?unknown, "allowlisted case ids not found in case file");
            }
            cases
                .into_iter()
                .filter(|c| wanted.contains(c.id.as_str()))
                .collect()
        }
    };
    let selected = drop_colliding_cases(selected);
    if selected.is_empty() {
        let reason = match only {
            Some(ids) => format!("allowlist [{}] matched no case", ids.join(", ")),
            None => "case file is empty".to_string(),
        };
        return Err(RunnerError::EmptySelection(reason));
    }
    Ok(selected)
}

/// Keep the first case for every result file stem
fn drop_colliding_cases(cases: Vec<CaseItem>) -> Vec<CaseItem> {
    let mut stems: HashSet<String> = HashSet::new();
    cases
        .into_iter()
        .filter(|case| {
            let stem = sanitize_name(&case.id);
            let first = stems.insert(stem.clone());
            if !first {
                tracing::warn!(case_id = %case.id, stem = %stem, "skipping case whose result file collides with an earlier case");
            }
            first
        })
        .collect()
}
