//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to
//! build meaningful log entries.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while talking to a chat-completion endpoint.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response that is not a context-length rejection.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The request was rejected for exceeding the model's context window.
    #[error(transparent)]
    ContextLengthExceeded(TokenLimitError),

    /// The response body could not be decoded.
    #[error("response parse error: {reason}")]
    ResponseParseError { reason: String },

    /// The endpoint answered without any choices.
    #[error("empty response from model '{model}'")]
    EmptyResponse { model: String },
}

impl InferenceError {
    /// The token-limit payload, if this error is a context-length rejection.
    pub fn token_limit(&self) -> Option<&TokenLimitError> {
        match self {
            InferenceError::ContextLengthExceeded(e) => Some(e),
            _ => None,
        }
    }

    /// Classify a non-2xx response, promoting context-length rejections.
    pub fn from_http_status(status: u16, body: String) -> Self {
        if matches!(status, 400 | 413) {
            if let Some(limit) = TokenLimitError::from_error_body(&body) {
                return InferenceError::ContextLengthExceeded(limit);
            }
        }
        InferenceError::HttpError { status, body }
    }
}

// ─── Token Limit ─────────────────────────────────────────────────────────────

/// A chat request rejected because prompt plus requested completion exceed
/// the model's context window.
///
/// Constructed once per failure and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{message}")]
pub struct TokenLimitError {
    pub message: String,
    pub tokens_requested: u32,
    pub max_tokens: u32,
    pub messages_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenLimitError {
    pub fn new(
        message: impl Into<String>,
        tokens_requested: u32,
        max_tokens: u32,
        messages_tokens: u32,
        completion_tokens: u32,
    ) -> Self {
        Self {
            message: message.into(),
            tokens_requested,
            max_tokens,
            messages_tokens,
            completion_tokens,
        }
    }

    /// Parse an upstream error body into a token-limit error.
    ///
    /// Recognizes the OpenAI-style wording ("maximum context length is N
    /// tokens. However, you requested M tokens (A in the messages, B in the
    /// completion)") as well as a bare `context_length_exceeded` code. Numbers
    /// that are not present default to 0. Returns `None` when the body does not
    /// describe a context-length violation.
    pub fn from_error_body(body: &str) -> Option<Self> {
        let message = extract_error_message(body);
        let lower = message.to_lowercase();
        let is_limit = body.contains("context_length_exceeded")
            || lower.contains("maximum context length")
            || lower.contains("context window")
            || lower.contains("too many tokens");
        if !is_limit {
            return None;
        }

        let max_tokens = capture_u32(max_context_re(), &message).unwrap_or(0);
        let messages_tokens = capture_u32(messages_part_re(), &message).unwrap_or(0);
        let completion_tokens = capture_u32(completion_part_re(), &message).unwrap_or(0);
        let tokens_requested = capture_u32(requested_re(), &message)
            .unwrap_or(messages_tokens.saturating_add(completion_tokens));

        Some(Self {
            message,
            tokens_requested,
            max_tokens,
            messages_tokens,
            completion_tokens,
        })
    }

    /// Tokens by which the request overshot the window.
    pub fn overflow(&self) -> u32 {
        self.tokens_requested.saturating_sub(self.max_tokens)
    }
}

/// Pull `error.message` out of a JSON error body, or return the raw body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

fn capture_u32(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn max_context_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)maximum context length is (\d+)").expect("valid max-context regex")
    })
}

fn requested_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:requested|resulted in) (\d+) tokens").expect("valid requested regex")
    })
}

fn messages_part_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+) in the messages").expect("valid messages regex"))
}

fn completion_part_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+) in the completion").expect("valid completion regex"))
}
