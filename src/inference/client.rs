//! OpenAI-compatible chat client.
//!
//! The recovery engine only needs one non-streaming call (the compression
//! request), so the collaborator surface is the small [`ChatClient`] trait.
//! [`HttpChatClient`] is the production implementation; tests substitute
//! in-memory mocks.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;

use super::errors::InferenceError;
use super::types::{ChatCompletionRequest, ChatMessage, ChatOptions, ChatResponse, ResponseMessage, Usage};
use crate::config::ModelEndpoint;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── ChatClient ──────────────────────────────────────────────────────────────

/// A chat-completion backend.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send a non-streaming chat request and return the assistant reply.
    async fn send_chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, InferenceError>;
}

// ─── HttpChatClient ──────────────────────────────────────────────────────────

/// Chat client speaking the OpenAI Chat Completions API over HTTP.
pub struct HttpChatClient {
    http: HttpClient,
    endpoint: ModelEndpoint,
}

impl HttpChatClient {
    /// Build a client for the given endpoint. Does not check connectivity.
    pub fn new(endpoint: ModelEndpoint) -> Result<Self, InferenceError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(endpoint.request_timeout_secs))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: endpoint.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { http, endpoint })
    }

    /// The default model used when a request does not override it.
    pub fn default_model(&self) -> &str {
        &self.endpoint.model
    }

    fn build_request(&self, messages: &[ChatMessage], options: &ChatOptions) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.endpoint.model.clone()),
            messages: messages.to_vec(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream: false,
        }
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn send_chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, InferenceError> {
        let url = format!("{}/chat/completions", self.endpoint.base_url.trim_end_matches('/'));
        let body = self.build_request(messages, options);

        tracing::debug!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            max_tokens = ?body.max_tokens,
            "sending chat request"
        );

        let mut request = self.http.post(&url).json(&body);
        if let Some(ref key) = self.endpoint.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.endpoint.request_timeout_secs,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let err = InferenceError::from_http_status(status.as_u16(), body_text);
            if let Some(limit) = err.token_limit() {
                tracing::warn!(
                    tokens_requested = limit.tokens_requested,
                    max_tokens = limit.max_tokens,
                    "chat request exceeded context window"
                );
            }
            return Err(err);
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| InferenceError::ResponseParseError {
                reason: format!("failed to read response body: {e}"),
            })?;

        parse_completion_response(&body_text, &body.model)
    }
}

// ─── Response Parsing ────────────────────────────────────────────────────────

/// Decode a non-streaming completion body into a [`ChatResponse`].
pub fn parse_completion_response(body: &str, model: &str) -> Result<ChatResponse, InferenceError> {
    #[derive(Deserialize)]
    struct CompletionBody {
        #[serde(default)]
        choices: Vec<CompletionChoice>,
        #[serde(default)]
        usage: Option<Usage>,
    }

    #[derive(Deserialize)]
    struct CompletionChoice {
        message: ResponseMessage,
        #[serde(default)]
        finish_reason: Option<String>,
    }

    let parsed: CompletionBody =
        serde_json::from_str(body).map_err(|e| InferenceError::ResponseParseError {
            reason: format!("failed to parse completion body: {e}"),
        })?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::EmptyResponse {
            model: model.to_string(),
        })?;

    Ok(ChatResponse {
        message: choice.message,
        finish_reason: choice.finish_reason,
        usage: parsed.usage,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
