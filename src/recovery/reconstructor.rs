//! Context reconstruction.
//!
//! Rebuilds a short, protocol-valid message list from a [`RecoveryData`]:
//! a system message carrying the task state, the original user query, a
//! continuation narration, then the validated tail of recent messages. The
//! whole list goes through the validator once more before it is returned.
//!
//! The user query appears verbatim only once, as the user message. The system
//! message carries the summary's bounded preview of it.

use crate::inference::types::{ChatMessage, Role};

use super::tokens::truncate_utf8;
use super::types::{DroppedMessage, ProgressSummary, RecoveryData};
use super::validator::validate_tool_call_sequence;

/// Number of most recent pre-error messages carried into the rebuilt list.
pub const TAIL_SIZE: usize = 4;

/// Tool output in the tail longer than this is cut.
pub const MAX_TAIL_CONTENT_CHARS: usize = 8_000;

const TRUNCATION_MARKER: &str = "\n[... output truncated during context recovery]";

/// A rebuilt message list plus everything the validator removed from it.
#[derive(Debug, Clone, Default)]
pub struct Reconstruction {
    pub messages: Vec<ChatMessage>,
    pub dropped: Vec<DroppedMessage>,
}

/// Build the resumable message list for one recovery attempt.
pub fn reconstruct_context(data: &RecoveryData) -> Reconstruction {
    let mut messages = Vec::with_capacity(3 + data.tail_messages.len());
    messages.push(ChatMessage::system(system_prompt(data)));
    messages.push(ChatMessage::user(data.original_user_query.clone()));
    messages.push(ChatMessage::assistant(continuation_narrative(&data.progress_summary)));

    let tail: Vec<ChatMessage> = data.tail_messages.iter().map(shrink_tool_output).collect();
    let tail = validate_tool_call_sequence(&tail);
    let mut dropped = tail.dropped;
    messages.extend(tail.kept);

    // Final guard over the assembled list.
    let full = validate_tool_call_sequence(&messages);
    dropped.extend(full.dropped);

    tracing::info!(
        execution_id = %data.execution_id,
        recovery_count = data.recovery_count,
        messages = full.kept.len(),
        dropped = dropped.len(),
        "context reconstructed"
    );

    Reconstruction {
        messages: full.kept,
        dropped,
    }
}

fn system_prompt(data: &RecoveryData) -> String {
    let summary_json = serde_json::to_string_pretty(&data.progress_summary)
        .unwrap_or_else(|_| "{}".to_string());

    format!(
        "You are resuming a task that was interrupted because the conversation \
exceeded the model's context window. The earlier conversation has been \
compressed; continue from where it stopped and do not repeat completed work.\n\n\
## Original task\n{task}\n\n\
## Progress summary\n```json\n{summary_json}\n```\n\n\
## Compressed history\n{compressed}\n\n\
## Execution\n- Execution ID: {execution_id}\n- Recovery attempt: {recovery_count}\n",
        task = data.progress_summary.original_task,
        compressed = data.compressed_context,
        execution_id = data.execution_id,
        recovery_count = data.recovery_count,
    )
}

fn continuation_narrative(summary: &ProgressSummary) -> String {
    let progress = &summary.progress;
    let mut text = String::from("I hit the context limit and compressed our conversation. ");

    if progress.completed.is_empty() {
        text.push_str("No tool steps had completed yet.");
    } else {
        let recent: Vec<&str> = progress
            .completed
            .iter()
            .rev()
            .take(3)
            .rev()
            .map(String::as_str)
            .collect();
        text.push_str(&format!(
            "So far I have completed {} step(s), most recently: {}.",
            progress.completed.len(),
            recent.join("; ")
        ));
    }

    text.push_str(&format!(" Current state: {}.", progress.current_state));
    if let Some(next) = progress.next_steps.first() {
        text.push_str(&format!(" Next: {next}."));
    }
    text.push_str(" Continuing with the task now.");
    text
}

fn shrink_tool_output(msg: &ChatMessage) -> ChatMessage {
    let mut msg = msg.clone();
    if msg.role == Role::Tool {
        if let Some(ref content) = msg.content {
            if content.len() > MAX_TAIL_CONTENT_CHARS {
                let head = truncate_utf8(content, MAX_TAIL_CONTENT_CHARS);
                msg.content = Some(format!("{head}{TRUNCATION_MARKER}"));
            }
        }
    }
    msg
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::ToolCallResponse;
    use crate::recovery::progress::summarize_progress;
    use crate::recovery::validator::is_protocol_valid;

    fn data_with_tail(tail: Vec<ChatMessage>) -> RecoveryData {
        let query = vec![ChatMessage::user("List the newest issues")];
        RecoveryData {
            original_user_query: "List the newest issues".to_string(),
            progress_summary: summarize_progress(&query, &[], "exec_test"),
            tail_messages: tail,
            compressed_context: r#"{"userRequests":1}"#.to_string(),
            tool_results: vec![],
            execution_id: "exec_test".to_string(),
            recovery_count: 2,
        }
    }

    fn asst(id: &str) -> ChatMessage {
        ChatMessage::assistant_with_tool_calls(
            None,
            vec![ToolCallResponse::function(id, "browser_snapshot", "{}")],
        )
    }

    #[test]
    fn test_triad_then_tail() {
        let tail = vec![
            asst("a"),
            ChatMessage::tool_result("a", "snapshot"),
            ChatMessage::assistant("Looking at issues"),
            ChatMessage::user("keep going"),
        ];
        let out = reconstruct_context(&data_with_tail(tail.clone()));

        assert_eq!(out.messages.len(), 3 + tail.len());
        assert_eq!(out.messages[0].role, Role::System);
        assert_eq!(out.messages[1], ChatMessage::user("List the newest issues"));
        assert_eq!(out.messages[2].role, Role::Assistant);
        assert!(!out.messages[2].has_tool_calls());
        assert_eq!(&out.messages[3..], &tail[..]);
        assert!(out.dropped.is_empty());
    }

    #[test]
    fn test_system_prompt_embeds_state() {
        let out = reconstruct_context(&data_with_tail(vec![]));
        let system = out.messages[0].content.as_deref().unwrap();
        assert!(system.contains("List the newest issues"));
        assert!(system.contains("\"originalTask\""));
        assert!(system.contains(r#"{"userRequests":1}"#));
        assert!(system.contains("Execution ID: exec_test"));
        assert!(system.contains("Recovery attempt: 2"));
    }

    #[test]
    fn test_long_query_is_carried_verbatim_once() {
        let query = format!("Translate this document:\n{}", "lorem ipsum ".repeat(2_500));
        let msgs = vec![ChatMessage::user(query.clone())];
        let mut data = data_with_tail(vec![]);
        data.original_user_query = query.clone();
        data.progress_summary = summarize_progress(&msgs, &[], "exec_test");

        let out = reconstruct_context(&data);
        assert_eq!(out.messages[1].content.as_deref(), Some(query.as_str()));
        let system = out.messages[0].content.as_deref().unwrap();
        assert!(system.len() < 4_000, "system prompt is {} bytes", system.len());
        assert!(system.contains("Translate this document:"));
    }

    #[test]
    fn test_length_is_triad_plus_validated_tail() {
        // Tail starts with an orphaned answer and ends with a dangling call.
        let tail = vec![
            ChatMessage::tool_result("outside", "old"),
            ChatMessage::assistant("ok"),
            asst("b"),
            ChatMessage::tool_result("b", "done"),
            asst("dangling"),
        ];
        let validated = validate_tool_call_sequence(&tail);
        let out = reconstruct_context(&data_with_tail(tail));

        assert_eq!(out.messages.len(), 3 + validated.kept.len());
        assert_eq!(out.dropped.len(), 2);
        assert!(is_protocol_valid(&out.messages));
    }

    #[test]
    fn test_long_tool_output_truncated_in_tail() {
        let tail = vec![asst("a"), ChatMessage::tool_result("a", "y".repeat(20_000))];
        let out = reconstruct_context(&data_with_tail(tail));
        let content = out.messages[4].content.as_deref().unwrap();
        assert!(content.len() < 8_100);
        assert!(content.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_narrative_mentions_recent_steps() {
        let mut data = data_with_tail(vec![]);
        data.progress_summary.progress.completed = vec![
            "Navigated to https://a".to_string(),
            "Captured page snapshot".to_string(),
            "Clicked Next".to_string(),
            "Captured page snapshot".to_string(),
        ];
        let text = continuation_narrative(&data.progress_summary);
        assert!(text.contains("4 step(s)"));
        assert!(text.contains("Clicked Next"));
        assert!(!text.contains("https://a"));
        assert!(text.ends_with("Continuing with the task now."));
    }
}
