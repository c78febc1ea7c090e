// Core request-side types shared by the executor, scheduler and recorder

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two deployments under comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Reference deployment
    Baseline,
    /// Candidate deployment
    New,
}

impl Variant {
    /// Both variants in the order every case runs them
    pub const ALL: [Variant; 2] = [Variant::Baseline, Variant::New];

    /// Wire/file-system name
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Baseline => "baseline",
            Variant::New => "new",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User input of a case, forwarded verbatim to the endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseInput {
    /// User message
    pub user: String,

    /// Optional free-form context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// A test case loaded from the case file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseItem {
    /// Stable case identifier
    pub id: String,

    /// Human-readable title
    pub title: String,

    /// Input sent to the endpoint
    pub input: CaseInput,
}

impl CaseItem {
    pub fn new(id: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            input: CaseInput {
                user: user.into(),
                context: None,
            },
        }
    }
}

/// JSON body POSTed to `{base}/run-case`
#[derive(Debug, Clone, Serialize)]
pub struct RunCaseRequest<'a> {
    pub case_id: &'a str,
    pub version: Variant,
    pub input: &'a CaseInput,
}

impl<'a> RunCaseRequest<'a> {
    pub fn new(case: &'a CaseItem, version: Variant) -> Self {
        Self {
            case_id: &case.id,
            version,
            input: &case.input,
        }
    }
}
