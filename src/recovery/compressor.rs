//! Context compression.
//!
//! Reduces older messages to a short summary string. The primary path asks a
//! low-cost model to compress a transcript of the most recent messages; any
//! failure falls back to a deterministic JSON tally. Callers get an opaque
//! string either way.

use std::sync::Arc;

use serde_json::json;

use crate::config::CompressionConfig;
use crate::inference::client::ChatClient;
use crate::inference::types::{ChatMessage, ChatOptions, Role};

use super::tokens::{clip_to_tokens, truncate_utf8};
use super::types::ToolInvocation;

/// Fixed instruction for the compression request.
const COMPRESSION_PROMPT: &str = "\
You compress conversation history for an agent that ran out of context window.
Produce a concise summary that preserves:
- the user's intent and any constraints they stated
- every tool that was called and the key facts its result returned
- pages or locations visited and the current position in the task
- data already collected that must not be gathered again
Discard redundant raw content such as full page dumps, repeated snapshots and boilerplate.
Reply with the summary only.";

/// Tool output longer than this is elided in the transcript.
const MAX_TRANSCRIPT_TOOL_CHARS: usize = 1_500;

/// Note attached to the deterministic fallback summary.
const FALLBACK_NOTE: &str =
    "Context was compressed after a token-limit error; earlier raw messages were discarded.";

/// Which path produced a compressed summary. Logged only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompressionPath {
    Model,
    Fallback,
}

/// LLM-backed compressor with a deterministic fallback.
pub struct ContextCompressor {
    client: Arc<dyn ChatClient>,
    config: CompressionConfig,
}

impl ContextCompressor {
    pub fn new(client: Arc<dyn ChatClient>, config: CompressionConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Compress `messages` into a bounded summary. Never fails.
    ///
    /// Only the last `max_messages` messages are sent. The reply is cut to
    /// roughly `max_tokens` tokens; an empty reply or any client error
    /// yields [`fallback_summary`] instead.
    pub async fn compress(&self, messages: &[ChatMessage]) -> String {
        let (summary, path) = self.compress_with_path(messages).await;
        tracing::debug!(path = ?path, chars = summary.len(), "compression finished");
        summary
    }

    async fn compress_with_path(&self, messages: &[ChatMessage]) -> (String, CompressionPath) {
        if messages.is_empty() {
            return (fallback_summary(messages), CompressionPath::Fallback);
        }

        let start = messages.len().saturating_sub(self.config.max_messages);
        let window = &messages[start..];
        let request = vec![
            ChatMessage::system(COMPRESSION_PROMPT),
            ChatMessage::user(render_transcript(window)),
        ];
        let options = ChatOptions {
            model: Some(self.config.model.clone()),
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
        };

        match self.client.send_chat(&request, &options).await {
            Ok(response) => {
                let text = response.message.content.unwrap_or_default();
                let text = text.trim();
                if text.is_empty() {
                    tracing::warn!(
                        model = %self.config.model,
                        "compression model returned empty summary, using fallback"
                    );
                    return (fallback_summary(messages), CompressionPath::Fallback);
                }
                let bounded = clip_to_tokens(text, self.config.max_tokens, "");
                tracing::info!(
                    model = %self.config.model,
                    compressed_messages = window.len(),
                    summary_chars = bounded.len(),
                    "context compressed by model"
                );
                (bounded, CompressionPath::Model)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    model = %self.config.model,
                    "compression request failed, using fallback"
                );
                (fallback_summary(messages), CompressionPath::Fallback)
            }
        }
    }
}

/// Flatten messages into a plain-text transcript.
///
/// Tool calls and results become text lines, so the compression request
/// carries no tool-call structure of its own.
fn render_transcript(messages: &[ChatMessage]) -> String {
    let mut transcript = String::new();

    for msg in messages {
        let role = msg.role.as_str();
        let content = msg.content.as_deref().unwrap_or("");
        match msg.role {
            Role::Tool => {
                let id = msg.tool_call_id.as_deref().unwrap_or("?");
                if content.len() > MAX_TRANSCRIPT_TOOL_CHARS {
                    let head = truncate_utf8(content, MAX_TRANSCRIPT_TOOL_CHARS);
                    transcript.push_str(&format!(
                        "tool ({id}): {head} [... {} more chars]\n",
                        content.len() - head.len()
                    ));
                } else {
                    transcript.push_str(&format!("tool ({id}): {content}\n"));
                }
            }
            Role::Assistant if msg.has_tool_calls() => {
                if !content.is_empty() {
                    transcript.push_str(&format!("assistant: {content}\n"));
                }
                for call in msg.tool_calls.iter().flatten() {
                    transcript.push_str(&format!(
                        "assistant: [called {} ({}) with {}]\n",
                        call.function.name, call.id, call.function.arguments
                    ));
                }
            }
            _ => transcript.push_str(&format!("{role}: {content}\n")),
        }
    }

    transcript
}

/// Deterministic summary used when the model path is unavailable.
///
/// Counts user requests, tool calls and navigation calls over all of
/// `messages`.
pub fn fallback_summary(messages: &[ChatMessage]) -> String {
    let user_requests = messages.iter().filter(|m| m.role == Role::User).count();
    let calls: Vec<_> = messages
        .iter()
        .flat_map(|m| m.tool_calls.iter().flatten())
        .collect();
    let navigations = calls
        .iter()
        .filter(|c| {
            matches!(
                ToolInvocation::parse(&c.function.name, &c.function.arguments),
                ToolInvocation::Navigate { .. }
            )
        })
        .count();

    json!({
        "userRequests": user_requests,
        "toolCalls": calls.len(),
        "navigations": navigations,
        "messagesCompressed": messages.len(),
        "note": FALLBACK_NOTE,
    })
    .to_string()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
