//! Error types for evalmux.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (unknown model, missing credential)
//! - I^B materialized: Infrastructure failures (network, timeout, HTTP status)
//! - K_i violated: Internal invariant violations (bugs)
//!
//! Only [`EvalmuxError`] ever reaches a caller as an `Err`. [`FetchError`] and
//! [`JudgeFailure`] are recovered locally: a fetch failure becomes the answer
//! text (its `Display`), a judge failure ends in a synthesized judgment.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for evalmux.
#[derive(Debug, Error)]
pub enum EvalmuxError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Model {model} is missing credential {credential_key}")]
    MissingCredential {
        model: String,
        credential_key: String,
    },

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EvalmuxError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Failure of a single fan-out fetch.
///
/// The `Display` output is what the caller sees in place of an answer, so the
/// messages are written for a person reading an evaluation sheet.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Error: unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Error: credential {credential_key} is not configured")]
    MissingCredential { credential_key: String },

    #[error("Request failed: HTTP {status}")]
    Http { status: u16 },

    #[error("Cookie authentication failed: update the {credential_key} cookie")]
    CookieRejected { credential_key: String },

    #[error("Access denied: check the cookie permissions")]
    AccessDenied,

    #[error("Cookie authentication failed: {message}")]
    AuthExpired { message: String },

    #[error("API error: {message}")]
    Api { message: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Request error: concurrency gate closed")]
    GateClosed,
}

impl FetchError {
    /// Classify a transport error from reqwest.
    pub fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else {
            Self::Network(err)
        }
    }
}

/// Failure of a single judge attempt.
///
/// I^B: the judge backend is unreliable by assumption. Every variant has a
/// recovery path in the retry loop; none is surfaced to callers.
#[derive(Debug, Error)]
pub enum JudgeFailure {
    #[error("Judge credential {0} is not configured")]
    MissingCredential(String),

    #[error("Judge rate limited (HTTP 429)")]
    RateLimited,

    #[error("Judge rejected the request (HTTP 400): {0}")]
    BadRequest(String),

    #[error("Judge returned HTTP {status}")]
    Http { status: u16 },

    #[error("Judge request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Judge network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Judge API error: {0}")]
    Api(String),

    #[error("Judge response blocked by safety filter")]
    SafetyFiltered,

    #[error("Judge response truncated with no recoverable text")]
    Truncated,

    #[error("Judge response was empty or not structured")]
    Unstructured {
        /// Text the judge returned, possibly empty
        text: String,
    },

    #[error("Judge response envelope unreadable: {0}")]
    Envelope(String),
}

impl JudgeFailure {
    /// Classify a transport error from reqwest.
    pub fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else {
            Self::Network(err)
        }
    }
}

/// Result type alias for evalmux.
pub type Result<T> = std::result::Result<T, EvalmuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_text_carries_status() {
        let text = FetchError::Http { status: 502 }.to_string();
        assert_eq!(text, "Request failed: HTTP 502");
    }

    #[test]
    fn unstructured_failure_hides_judge_text() {
        let failure = JudgeFailure::Unstructured {
            text: "long prose".into(),
        };
        assert_eq!(failure.to_string(), "Judge response was empty or not structured");
    }
}
