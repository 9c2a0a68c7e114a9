//! Response checks
//!
//! A check is a named predicate over a response. Failures are tallied in
//! the `checks` rate and never abort an iteration.

use serde::{Deserialize, Serialize};

/// What a check asserts about a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckKind {
    /// Status code equals the given value
    Status { status: u16 },
    /// Response body has at least one byte
    BodyNotEmpty,
    /// Response body contains the given text
    BodyContains { text: String },
}

/// A named check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    #[serde(flatten)]
    pub kind: CheckKind,
}

impl Check {
    pub fn status(status: u16) -> Self {
        Self {
            name: format!("status {}", status),
            kind: CheckKind::Status { status },
        }
    }

    pub fn body_not_empty() -> Self {
        Self {
            name: "body is not empty".to_string(),
            kind: CheckKind::BodyNotEmpty,
        }
    }

    pub fn body_contains(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            name: format!("body contains {:?}", text),
            kind: CheckKind::BodyContains { text },
        }
    }

    /// Evaluate against a received response
    pub fn evaluate(&self, status: u16, body: &[u8]) -> bool {
        match &self.kind {
            CheckKind::Status { status: expected } => status == *expected,
            CheckKind::BodyNotEmpty => !body.is_empty(),
            CheckKind::BodyContains { text } => {
                let needle = text.as_bytes();
                needle.is_empty() || body.windows(needle.len()).any(|w| w == needle)
            }
        }
    }
}

/// Checks applied when a profile does not list any
pub fn default_checks() -> Vec<Check> {
    vec![Check::status(200), Check::body_not_empty()]
}
