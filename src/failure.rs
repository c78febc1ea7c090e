//! Failure classification and the canonical failure record.
//!
//! Every way an attempt can fail maps onto exactly one [`FailureClass`]. The
//! `is_transient` verdict is derived from the class (plus the HTTP status or
//! network error kind) and is consumed only by the retry controller.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

use crate::types::Variant;

/// Stable failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Endpoint answered with a non-2xx status
    HttpError,
    /// Deadline exceeded before the exchange completed
    Timeout,
    /// Connection-level failure
    NetworkError,
    /// Body could not be decoded, or was too large to buffer
    InvalidJson,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::HttpError => "http_error",
            FailureClass::Timeout => "timeout",
            FailureClass::NetworkError => "network_error",
            FailureClass::InvalidJson => "invalid_json",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best-effort diagnostic label for network errors. Never gates retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetErrorKind {
    Dns,
    Tls,
    ConnRefused,
    ConnReset,
    SocketHangUp,
    Proxy,
    Abort,
    Unknown,
}

/// Ordered substring rules; the first kind with a matching needle wins.
const NET_ERROR_RULES: &[(NetErrorKind, &[&str])] = &[
    (NetErrorKind::Abort, &["abort", "canceled", "cancelled"]),
    (
        NetErrorKind::Dns,
        &[
            "dns",
            "enotfound",
            "eai_again",
            "getaddrinfo",
            "failed to lookup address",
            "name or service not known",
            "no such host",
        ],
    ),
    (NetErrorKind::Tls, &["tls", "ssl", "certificate", "handshake"]),
    (NetErrorKind::ConnRefused, &["econnrefused", "connection refused"]),
    (NetErrorKind::ConnReset, &["econnreset", "connection reset"]),
    (
        NetErrorKind::SocketHangUp,
        &[
            "socket hang up",
            "connection closed before message completed",
            "incomplete message",
            "unexpected eof",
            "broken pipe",
        ],
    ),
    (NetErrorKind::Proxy, &["proxy"]),
];

/// Outcome of classifying one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub class: FailureClass,
    pub net_error_kind: Option<NetErrorKind>,
    pub is_transient: bool,
}

/// An error raised while the exchange was in flight, reduced to the parts the
/// classifier looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrownError {
    /// Short error category, e.g. `ConnectError`
    pub name: String,
    /// Full message including the source chain
    pub message: String,
    /// Whether the error comes from the attempt deadline firing
    pub deadline: bool,
}

impl ThrownError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            deadline: false,
        }
    }

    /// The per-attempt deadline fired
    pub fn deadline(timeout_ms: u64) -> Self {
        Self {
            name: "TimeoutError".to_string(),
            message: format!("request aborted after deadline of {} ms", timeout_ms),
            deadline: true,
        }
    }

    /// Reduce a reqwest error, walking its source chain for the message
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let name = if err.is_timeout() {
            "TimeoutError"
        } else if err.is_connect() {
            "ConnectError"
        } else if err.is_body() {
            "BodyError"
        } else if err.is_decode() {
            "DecodeError"
        } else if err.is_request() {
            "RequestError"
        } else {
            "Error"
        };
        Self {
            name: name.to_string(),
            message: error_chain(err),
            deadline: err.is_timeout(),
        }
    }
}

/// Join an error and all of its sources with `": "`
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = inner.source();
    }
    message
}

/// Transient iff 408, 429 or any 5xx
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Classify a non-2xx response
pub fn classify_http(status: u16) -> Classification {
    Classification {
        class: FailureClass::HttpError,
        net_error_kind: None,
        is_transient: is_transient_status(status),
    }
}

/// Classify an error raised during the exchange
pub fn classify_thrown(error: &ThrownError) -> Classification {
    let kind = net_error_kind(&error.name, &error.message);
    if error.deadline {
        return Classification {
            class: FailureClass::Timeout,
            net_error_kind: Some(kind),
            is_transient: true,
        };
    }
    Classification {
        class: FailureClass::NetworkError,
        net_error_kind: Some(kind),
        is_transient: true,
    }
}

/// Classify a body that could not be decoded (malformed or truncated)
pub fn classify_body_error() -> Classification {
    Classification {
        class: FailureClass::InvalidJson,
        net_error_kind: None,
        is_transient: false,
    }
}

/// Match the lower-cased name and message against the ordered rule list
pub fn net_error_kind(name: &str, message: &str) -> NetErrorKind {
    let haystack = format!("{} {}", name, message).to_lowercase();
    NET_ERROR_RULES
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| haystack.contains(needle)))
        .map(|(kind, _)| *kind)
        .unwrap_or(NetErrorKind::Unknown)
}

/// Marker for the artifact's `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    #[default]
    RunnerFetchFailure,
}

/// Identifies the attempt a failure belongs to
#[derive(Debug, Clone, Copy)]
pub struct AttemptInfo<'a> {
    pub case_id: &'a str,
    pub version: Variant,
    pub url: &'a str,
    pub attempt: u32,
    pub timeout_ms: u64,
    pub max_body_bytes: u64,
}

/// Canonical failure record for one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureArtifact {
    #[serde(rename = "type", default)]
    pub artifact_type: ArtifactType,
    pub class: FailureClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_error_kind: Option<NetErrorKind>,
    pub is_transient: bool,

    pub case_id: String,
    pub version: Variant,
    pub url: String,
    pub attempt: u32,
    pub timeout_ms: u64,
    pub latency_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_is_transient: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default)]
    pub body_snippet: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_body_saved_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_body_meta_saved_to: Option<String>,
    #[serde(default)]
    pub body_truncated: bool,
    #[serde(default)]
    pub body_bytes_written: u64,
    pub max_body_bytes: u64,
}

impl FailureArtifact {
    /// Create an artifact; `is_transient` always comes from the classification
    pub fn new(info: AttemptInfo<'_>, classification: Classification, latency_ms: u64) -> Self {
        Self {
            artifact_type: ArtifactType::RunnerFetchFailure,
            class: classification.class,
            net_error_kind: classification.net_error_kind,
            is_transient: classification.is_transient,
            case_id: info.case_id.to_string(),
            version: info.version,
            url: info.url.to_string(),
            attempt: info.attempt,
            timeout_ms: info.timeout_ms,
            latency_ms,
            status: None,
            status_text: None,
            http_is_transient: None,
            error_name: None,
            error_message: None,
            body_snippet: String::new(),
            full_body_saved_to: None,
            full_body_meta_saved_to: None,
            body_truncated: false,
            body_bytes_written: 0,
            max_body_bytes: info.max_body_bytes,
        }
    }

    pub fn with_status(mut self, status: u16, status_text: Option<&str>) -> Self {
        self.status = Some(status);
        self.status_text = status_text.map(str::to_string);
        self.http_is_transient = Some(is_transient_status(status));
        self
    }

    pub fn with_error(mut self, name: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_name = Some(name.into());
        self.error_message = Some(message.into());
        self
    }

    pub fn with_body(mut self, snippet: String, bytes_written: u64, truncated: bool) -> Self {
        self.body_snippet = snippet;
        self.body_bytes_written = bytes_written;
        self.body_truncated = truncated;
        self
    }

    /// Point at diagnostic files that were actually written
    pub fn with_saved_paths(mut self, body: Option<String>, meta: Option<String>) -> Self {
        self.full_body_saved_to = body;
        self.full_body_meta_saved_to = meta;
        self
    }

    /// One-line description used as the synthesized `final_output`
    pub fn summary(&self) -> String {
        let detail = match (self.status, &self.error_message) {
            (Some(status), _) => format!(
                "HTTP {}{}",
                status,
                self.status_text
                    .as_deref()
                    .map(|t| format!(" {}", t))
                    .unwrap_or_default()
            ),
            (None, Some(message)) => message.clone(),
            (None, None) => "no further detail".to_string(),
        };
        format!(
            "Runner failed to fetch {} result for case {} ({}): {} after {} attempt(s)",
            self.version, self.case_id, self.class, detail, self.attempt
        )
    }
}
