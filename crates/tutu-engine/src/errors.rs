use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tutu_contracts::config::CredentialIssue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connection,
    Timeout,
    Auth,
    ResponseFormat,
    ModelMismatch,
    NoImageFound,
    /// Warning level: fewer images than requested.
    PartialImageFailure,
    /// Non-auth HTTP failures and anything unrecognised.
    Upstream,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Connection => "connection",
            FailureKind::Timeout => "timeout",
            FailureKind::Auth => "auth",
            FailureKind::ResponseFormat => "response_format",
            FailureKind::ModelMismatch => "model_mismatch",
            FailureKind::NoImageFound => "no_image_found",
            FailureKind::PartialImageFailure => "partial_image_failure",
            FailureKind::Upstream => "upstream",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conditions raised inside the generation pipeline. They travel inside
/// `anyhow::Error` and are recovered with `downcast_ref` when classifying.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{0}")]
    ModelMismatch(String),
    #[error("credential rejected: {issue}")]
    Credential { issue: CredentialIssue },
    #[error("request failed ({status}): {body}")]
    HttpStatus { status: u16, body: String },
    #[error("response stream timed out after {seconds}s")]
    StreamTimeout { seconds: u64 },
    #[error("invalid response format: {detail}")]
    ResponseFormat { detail: String },
    #[error("upstream reported an error: {message}")]
    UpstreamMessage { message: String },
    #[error("no image found in response")]
    NoImage { transcript: String },
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing: &String| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}
