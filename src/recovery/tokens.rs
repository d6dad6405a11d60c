//! Token sizing for recovery decisions.
//!
//! Estimates are character-ratio heuristics that err high: prose at ~3.2
//! chars/token, tool output and wire envelopes at ~2.8. The only real number
//! is the upstream count carried on `TokenLimitError`; [`TokenBudget`] turns
//! that count into the ceiling a rebuilt context has to stay under.

use crate::inference::types::{ChatMessage, Role, ToolCallResponse};

const PROSE_CHARS_PER_TOKEN: f64 = 3.2;
const STRUCTURED_CHARS_PER_TOKEN: f64 = 2.8;

/// Role label and separators around every message.
const MESSAGE_FRAME_TOKENS: u32 = 4;

fn tokens_at(len: usize, chars_per_token: f64) -> u32 {
    (len as f64 / chars_per_token).ceil() as u32
}

// ─── Estimation ─────────────────────────────────────────────────────────────

/// Estimated cost of one message as sent on the wire.
///
/// Tool calls are priced from their serialized envelope (id, type, name and
/// arguments together) rather than from the arguments alone.
pub fn estimate_message_tokens(message: &ChatMessage) -> u32 {
    let body = match (message.role, message.content.as_deref()) {
        (_, None) => 0,
        (Role::Tool, Some(text)) => tokens_at(text.len(), STRUCTURED_CHARS_PER_TOKEN),
        (_, Some(text)) => tokens_at(text.len(), PROSE_CHARS_PER_TOKEN),
    };
    let calls: u32 = message.tool_calls.iter().flatten().map(envelope_tokens).sum();
    let answer_id = message
        .tool_call_id
        .as_deref()
        .map_or(0, |id| tokens_at(id.len(), STRUCTURED_CHARS_PER_TOKEN));

    MESSAGE_FRAME_TOKENS + body + calls + answer_id
}

/// Estimated cost of a whole message list.
pub fn estimate_messages_tokens(messages: &[ChatMessage]) -> u32 {
    messages.iter().map(estimate_message_tokens).sum()
}

fn envelope_tokens(call: &ToolCallResponse) -> u32 {
    let len = serde_json::to_string(call)
        .map(|wire| wire.len())
        .unwrap_or(call.id.len() + call.function.name.len() + call.function.arguments.len());
    tokens_at(len, STRUCTURED_CHARS_PER_TOKEN)
}

// ─── Budget ─────────────────────────────────────────────────────────────────

/// Strict ceiling for a rebuilt context: its estimate must stay below the
/// size of the request that was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    limit: u32,
}

impl TokenBudget {
    /// Budget under a rejected request of `tokens_requested` tokens.
    /// `None` when the upstream error carried no count.
    pub fn below(tokens_requested: u32) -> Option<Self> {
        (tokens_requested > 0).then_some(Self {
            limit: tokens_requested,
        })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn admits(&self, messages: &[ChatMessage]) -> bool {
        estimate_messages_tokens(messages) < self.limit
    }

    /// Tokens that can still be added to `messages` without reaching the limit.
    pub fn headroom(&self, messages: &[ChatMessage]) -> u32 {
        self.limit
            .saturating_sub(1)
            .saturating_sub(estimate_messages_tokens(messages))
    }
}

// ─── Clipping ───────────────────────────────────────────────────────────────

/// Truncate to at most `max_bytes` bytes on a char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    let mut end = max_bytes.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Cut prose so it estimates at most `max_tokens`, ending in `marker` when
/// anything was removed. The marker counts against the allowance.
pub fn clip_to_tokens(text: &str, max_tokens: u32, marker: &str) -> String {
    let max_bytes = (f64::from(max_tokens) * PROSE_CHARS_PER_TOKEN) as usize;
    if text.len() <= max_bytes {
        return text.to_string();
    }
    if marker.len() >= max_bytes {
        return truncate_utf8(text, max_bytes).to_string();
    }
    let head = truncate_utf8(text, max_bytes - marker.len());
    format!("{head}{marker}")
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_message_cost() {
        // 4 frame + ceil(13 / 3.2)
        assert_eq!(estimate_message_tokens(&ChatMessage::user("Hello, world!")), 9);
        assert_eq!(estimate_message_tokens(&ChatMessage::assistant_with_tool_calls(None, vec![])), 4);
    }

    #[test]
    fn test_tool_output_priced_denser_than_prose() {
        let text = "x".repeat(279);
        let as_user = estimate_message_tokens(&ChatMessage::user(text.clone()));
        let as_tool = estimate_message_tokens(&ChatMessage::tool_result("c", text));
        assert!(as_tool > as_user);
        // ceil(279 / 2.8) for the body, plus the answer id
        assert_eq!(as_tool, 4 + 100 + 1);
    }

    #[test]
    fn test_tool_call_priced_from_wire_envelope() {
        let call = ToolCallResponse::function(
            "call_1",
            "browser_navigate",
            r#"{"url": "https://example.com"}"#,
        );
        let wire_len = serde_json::to_string(&call).unwrap().len();
        let msg = ChatMessage::assistant_with_tool_calls(None, vec![call]);
        assert_eq!(estimate_message_tokens(&msg), 4 + tokens_at(wire_len, 2.8));
        // The envelope costs more than the arguments alone.
        assert!(tokens_at(wire_len, 2.8) > tokens_at(r#"{"url": "https://example.com"}"#.len(), 2.8));
    }

    #[test]
    fn test_list_cost_is_sum() {
        let msgs = vec![ChatMessage::system("sys"), ChatMessage::user("hello there")];
        assert_eq!(
            estimate_messages_tokens(&msgs),
            estimate_message_tokens(&msgs[0]) + estimate_message_tokens(&msgs[1])
        );
        assert_eq!(estimate_messages_tokens(&[]), 0);
    }

    #[test]
    fn test_budget_is_strict() {
        assert!(TokenBudget::below(0).is_none());

        let msgs = vec![ChatMessage::user("Hello, world!")]; // 9 tokens
        assert!(!TokenBudget::below(9).unwrap().admits(&msgs));
        assert!(TokenBudget::below(10).unwrap().admits(&msgs));
        assert_eq!(TokenBudget::below(20).unwrap().headroom(&msgs), 10);
        assert_eq!(TokenBudget::below(5).unwrap().headroom(&msgs), 0);
    }

    #[test]
    fn test_clipped_text_fits_its_allowance() {
        let text = "word ".repeat(2_000);
        let clipped = clip_to_tokens(&text, 100, " [cut]");
        assert!(clipped.ends_with(" [cut]"));
        assert!(clipped.len() <= 320);
        let msg = ChatMessage::user(clipped);
        assert!(estimate_message_tokens(&msg) <= 4 + 100);

        assert_eq!(clip_to_tokens("short", 100, " [cut]"), "short");
        assert_eq!(clip_to_tokens("abcdefgh", 1, " [cut]"), "abc");
    }

    #[test]
    fn test_truncate_utf8_within_multibyte() {
        // '═' is 3 bytes; byte 4 lands inside the second one
        let text = "═══";
        assert_eq!(truncate_utf8(text, 4), "═");
        assert_eq!(truncate_utf8(text, 6), "══");
        assert_eq!(truncate_utf8("short", 100), "short");
    }
}
