//! Post-hoc loop detection over an execution trace.
//!
//! Two independent detectors run over the `events` array of a successful
//! response:
//! - **Similarity breaker**: the last [`SIMILARITY_WINDOW`] calls of each tool
//!   are compared pairwise by a Jaccard score over their `key=value` argument
//!   entries. An average at or above [`SIMILARITY_THRESHOLD`] flags the tool.
//! - **Output hash tracking**: `tool_result` payload summaries are digested and
//!   grouped; any digest shared by two or more calls is reported.
//!
//! Analysis is pure and total. Events that do not parse are skipped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// How many of the most recent calls per tool are compared
pub const SIMILARITY_WINDOW: usize = 3;

/// Minimum average pairwise similarity reported as a suspect
pub const SIMILARITY_THRESHOLD: f64 = 0.9;

/// Hex characters kept from the payload digest
pub const OUTPUT_HASH_LEN: usize = 12;

/// Digest input used when a result carries no payload summary
const UNDEFINED_PAYLOAD: &str = "__undefined__";

/// One typed event of an execution trace
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    ToolCall {
        call_id: String,
        tool: String,
        args: Map<String, Value>,
    },
    ToolResult {
        call_id: String,
        #[serde(default)]
        payload_summary: Option<Value>,
    },
    Retrieval {},
    FinalOutput {},
}

/// Parse raw events, dropping any that are malformed or of unknown type
pub fn parse_trace(events: &[Value]) -> Vec<TraceEvent> {
    events
        .iter()
        .filter_map(|event| TraceEvent::deserialize(event).ok())
        .collect()
}

/// A tool whose recent calls look like repeats of each other
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilaritySuspect {
    pub tool: String,
    pub call_ids: Vec<String>,
    pub similarity_score: f64,
}

/// Calls whose results hashed identically
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputHashDuplicate {
    pub hash: String,
    pub call_ids: Vec<String>,
    pub count: usize,
}

/// Findings of both detectors; an empty detector is omitted when serialised
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LoopDetails {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub similarity_suspects: Vec<SimilaritySuspect>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_hash_duplicates: Vec<OutputHashDuplicate>,
}

/// Combined verdict
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoopAnalysis {
    pub loop_detected: bool,
    pub details: Option<LoopDetails>,
}

/// Jaccard score over `key=json(value)` entries; two empty argument sets are identical
pub fn args_similarity(a: &Map<String, Value>, b: &Map<String, Value>) -> f64 {
    let set_a = arg_entries(a);
    let set_b = arg_entries(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    }
}

fn arg_entries(args: &Map<String, Value>) -> HashSet<String> {
    args.iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect()
}

/// Group items by key, keeping first-seen key order
fn group_in_order<'a, T>(items: impl Iterator<Item = (String, &'a T)>) -> Vec<(String, Vec<&'a T>)>
where
    T: 'a,
{
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<&'a T>)> = Vec::new();
    for (key, item) in items {
        match index.get(&key) {
            Some(&slot) => groups[slot].1.push(item),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![item]));
            }
        }
    }
    groups
}

struct Call<'a> {
    call_id: &'a str,
    args: &'a Map<String, Value>,
}

/// Similarity breaker
pub fn detect_similarity_loops(events: &[TraceEvent]) -> Vec<SimilaritySuspect> {
    let calls: Vec<(String, Call<'_>)> = events
        .iter()
        .filter_map(|event| match event {
            TraceEvent::ToolCall { call_id, tool, args } => Some((tool.clone(), Call { call_id, args })),
            _ => None,
        })
        .collect();

    let mut suspects = Vec::new();
    for (tool, calls) in group_in_order(calls.iter().map(|(tool, call)| (tool.clone(), call))) {
        if calls.len() < 2 {
            continue;
        }
        let window = &calls[calls.len().saturating_sub(SIMILARITY_WINDOW)..];

        let mut total = 0.0;
        let mut pairs = 0usize;
        for i in 0..window.len() {
            for j in (i + 1)..window.len() {
                total += args_similarity(window[i].args, window[j].args);
                pairs += 1;
            }
        }
        let average = if pairs > 0 { total / pairs as f64 } else { 0.0 };

        if average >= SIMILARITY_THRESHOLD {
            suspects.push(SimilaritySuspect {
                tool,
                call_ids: window.iter().map(|call| call.call_id.to_string()).collect(),
                similarity_score: (average * 1000.0).round() / 1000.0,
            });
        }
    }
    suspects
}

/// Short content digest of a payload summary
pub fn hash_payload(payload: Option<&Value>) -> String {
    let raw = match payload {
        None => UNDEFINED_PAYLOAD.to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    };
    let digest = Sha256::digest(raw.as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{:02x}", byte)).collect();
    hex[..OUTPUT_HASH_LEN].to_string()
}

/// Output hash tracking
pub fn detect_output_hash_duplicates(events: &[TraceEvent]) -> Vec<OutputHashDuplicate> {
    let results = events.iter().filter_map(|event| match event {
        TraceEvent::ToolResult {
            call_id,
            payload_summary,
        } => Some((hash_payload(payload_summary.as_ref()), call_id)),
        _ => None,
    });

    group_in_order(results)
        .into_iter()
        .filter(|(_, call_ids)| call_ids.len() >= 2)
        .map(|(hash, call_ids)| OutputHashDuplicate {
            hash,
            count: call_ids.len(),
            call_ids: call_ids.into_iter().cloned().collect(),
        })
        .collect()
}

/// Run both detectors
pub fn analyze(events: &[TraceEvent]) -> LoopAnalysis {
    let details = LoopDetails {
        similarity_suspects: detect_similarity_loops(events),
        output_hash_duplicates: detect_output_hash_duplicates(events),
    };
    if details.similarity_suspects.is_empty() && details.output_hash_duplicates.is_empty() {
        return LoopAnalysis::default();
    }
    LoopAnalysis {
        loop_detected: true,
        details: Some(details),
    }
}

/// Analyse the `events` array of a response payload, if it has one
pub fn analyze_payload(payload: &Value) -> LoopAnalysis {
    match payload.get("events").and_then(Value::as_array) {
        Some(events) if !events.is_empty() => analyze(&parse_trace(events)),
        _ => LoopAnalysis::default(),
    }
}

/// Record findings under `token_usage`, creating it if needed.
///
/// Existing token usage fields are kept and an agent-reported
/// `loop_detected: true` is never cleared. Returns whether anything changed.
pub fn merge_into_payload(payload: &mut Value, analysis: &LoopAnalysis) -> bool {
    let Some(details) = analysis.details.as_ref() else {
        return false;
    };
    let Some(object) = payload.as_object_mut() else {
        return false;
    };
    let Ok(details_value) = serde_json::to_value(details) else {
        return false;
    };

    let usage = object
        .entry("token_usage")
        .or_insert_with(|| Value::Object(Map::new()));
    if !usage.is_object() {
        *usage = Value::Object(Map::new());
    }
    if let Some(usage) = usage.as_object_mut() {
        usage.insert("loop_detected".to_string(), Value::Bool(true));
        usage.insert("loop_details".to_string(), details_value);
    }
    true
}
