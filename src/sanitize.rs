//! Redaction of persisted artifacts.
//!
//! Applied to every case result and diagnostic snippet before it is written.
//! Object keys are left alone; only string values are masked.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// How aggressively artifacts are masked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RedactionPreset {
    /// Write artifacts verbatim
    #[default]
    #[value(name = "none")]
    None,
    /// Mask e-mail addresses and customer/ticket/message identifiers
    #[value(name = "internal_only")]
    InternalOnly,
    /// Additionally mask token-like secrets
    #[value(name = "transferable")]
    Transferable,
}

impl fmt::Display for RedactionPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RedactionPreset::None => "none",
            RedactionPreset::InternalOnly => "internal_only",
            RedactionPreset::Transferable => "transferable",
        })
    }
}

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}\b").unwrap());
static CUSTOMER_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bCUST-\d+\b").unwrap());
static TICKET_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bT-\d+\b").unwrap());
static MESSAGE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bMSG-\d+\b").unwrap());
static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(sk|api|token|secret)[-_]?[a-z0-9]{8,}\b").unwrap());

/// Mask a single string
pub fn mask_string(input: &str, preset: RedactionPreset) -> String {
    if preset == RedactionPreset::None {
        return input.to_string();
    }
    let masked = EMAIL.replace_all(input, "[redacted_email]");
    let masked = CUSTOMER_ID.replace_all(&masked, "CUST-REDACTED");
    let masked = TICKET_ID.replace_all(&masked, "T-REDACTED");
    let masked = MESSAGE_ID.replace_all(&masked, "MSG-REDACTED");
    if preset == RedactionPreset::Transferable {
        return TOKEN.replace_all(&masked, "[redacted_token]").into_owned();
    }
    masked.into_owned()
}

/// Mask every string inside a JSON value
pub fn sanitize_value(value: &Value, preset: RedactionPreset) -> Value {
    if preset == RedactionPreset::None {
        return value.clone();
    }
    match value {
        Value::String(text) => Value::String(mask_string(text, preset)),
        Value::Array(items) => Value::Array(items.iter().map(|v| sanitize_value(v, preset)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_value(v, preset)))
                .collect(),
        ),
        other => other.clone(),
    }
}
