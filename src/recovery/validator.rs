//! Tool-call sequence validation.
//!
//! Chat-completion APIs require every assistant tool call to be answered by
//! exactly one `tool` message, directly after the call batch. This module
//! prunes a message list until that holds. It never fails and never
//! synthesizes messages: offending entries are dropped and reported.

use std::collections::{HashMap, HashSet};

use crate::inference::types::{ChatMessage, Role};

use super::types::{DropReason, DroppedMessage, ValidationOutcome};

/// Reduce `messages` to a protocol-valid sequence.
///
/// Pass 1 indexes, for every call id, the first `tool` message after the
/// introducing assistant message that answers it. Pass 2 walks the input and
/// emits:
/// - system, user and plain assistant messages unchanged;
/// - an assistant message with tool calls only when every one of its ids has
///   an answer, immediately followed by those answers in call order;
/// - no `tool` message on its own. Tool messages appear only behind their
///   assistant message; the rest are dropped.
///
/// Deterministic and idempotent: validating a valid list returns it unchanged.
pub fn validate_tool_call_sequence(messages: &[ChatMessage]) -> ValidationOutcome {
    // ── Pass 1: answer index ────────────────────────────────────────────
    // call id → index of its answering tool message
    let mut answers: HashMap<&str, usize> = HashMap::new();
    // call ids introduced so far (positional: answers must come later)
    let mut introduced: HashSet<&str> = HashSet::new();

    for (i, msg) in messages.iter().enumerate() {
        if msg.has_tool_calls() {
            introduced.extend(msg.tool_call_ids());
        } else if msg.role == Role::Tool {
            if let Some(id) = msg.tool_call_id.as_deref() {
                if introduced.contains(id) {
                    answers.entry(id).or_insert(i);
                }
            }
        }
    }

    // ── Pass 2: emit ────────────────────────────────────────────────────
    let mut kept = Vec::with_capacity(messages.len());
    let mut dropped = Vec::new();
    // tool message indices emitted behind their assistant
    let mut emitted_answers: HashSet<usize> = HashSet::new();
    // call ids claimed by an emitted assistant
    let mut claimed: HashSet<&str> = HashSet::new();
    // tool message indices whose assistant was dropped
    let mut orphaned_by_drop: HashSet<usize> = HashSet::new();

    for (i, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::Assistant if msg.has_tool_calls() => {
                let ids = msg.tool_call_ids();
                let answer_slots: Vec<Option<usize>> = ids
                    .iter()
                    .map(|id| {
                        answers
                            .get(id)
                            .copied()
                            .filter(|&idx| idx > i && !claimed.contains(id))
                    })
                    .collect();

                let unique_ids: HashSet<&str> = ids.iter().copied().collect();
                let complete = unique_ids.len() == ids.len()
                    && answer_slots.iter().all(Option::is_some);

                if complete {
                    kept.push(msg.clone());
                    for (id, slot) in ids.iter().zip(&answer_slots) {
                        if let Some(idx) = *slot {
                            claimed.insert(id);
                            emitted_answers.insert(idx);
                            kept.push(messages[idx].clone());
                        }
                    }
                } else {
                    let missing: Vec<String> = ids
                        .iter()
                        .zip(&answer_slots)
                        .filter(|(_, slot)| slot.is_none())
                        .map(|(id, _)| id.to_string())
                        .collect();
                    let call_ids = if missing.is_empty() {
                        ids.iter().map(|id| id.to_string()).collect()
                    } else {
                        missing
                    };
                    tracing::warn!(
                        index = i,
                        call_ids = ?call_ids,
                        "dropping assistant message with unanswered tool calls"
                    );
                    for (id, slot) in ids.iter().zip(&answer_slots) {
                        if let Some(idx) = *slot {
                            // keep the answer claimable by nobody else
                            claimed.insert(id);
                            orphaned_by_drop.insert(idx);
                        }
                    }
                    dropped.push(DroppedMessage {
                        reason: DropReason::UnansweredToolCalls { call_ids },
                        message: msg.clone(),
                    });
                }
            }
            Role::Tool => {
                if emitted_answers.contains(&i) {
                    continue;
                }
                let reason = classify_stray_tool_message(msg, i, &answers, &orphaned_by_drop);
                tracing::warn!(
                    index = i,
                    tool_call_id = msg.tool_call_id.as_deref().unwrap_or("<none>"),
                    reason = ?reason,
                    "dropping tool message"
                );
                dropped.push(DroppedMessage {
                    reason,
                    message: msg.clone(),
                });
            }
            _ => kept.push(msg.clone()),
        }
    }

    if !dropped.is_empty() {
        tracing::info!(
            input = messages.len(),
            kept = kept.len(),
            dropped = dropped.len(),
            "tool-call sequence repaired"
        );
    }

    ValidationOutcome { kept, dropped }
}

/// Explain why a tool message was not emitted behind an assistant message.
fn classify_stray_tool_message(
    msg: &ChatMessage,
    index: usize,
    answers: &HashMap<&str, usize>,
    orphaned_by_drop: &HashSet<usize>,
) -> DropReason {
    let Some(id) = msg.tool_call_id.clone() else {
        return DropReason::MissingToolCallId;
    };
    if orphaned_by_drop.contains(&index) {
        return DropReason::ParentCallDropped { tool_call_id: id };
    }
    match answers.get(id.as_str()) {
        Some(&first) if first != index => DropReason::DuplicateToolResult { tool_call_id: id },
        _ => DropReason::OrphanedToolResult { tool_call_id: id },
    }
}

/// Whether `messages` already satisfies the pairing invariant.
///
/// Every assistant tool call must be answered exactly once by the `tool`
/// messages directly following it, in any order, before any other message;
/// every `tool` message must answer a call from that batch.
pub fn is_protocol_valid(messages: &[ChatMessage]) -> bool {
    let mut pending: Vec<&str> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::Tool => {
                let Some(id) = msg.tool_call_id.as_deref() else {
                    return false;
                };
                match pending.iter().position(|p| *p == id) {
                    Some(pos) => {
                        pending.remove(pos);
                    }
                    None => return false,
                }
            }
            _ => {
                if !pending.is_empty() {
                    return false;
                }
                if msg.has_tool_calls() {
                    let ids = msg.tool_call_ids();
                    let unique: HashSet<&str> = ids.iter().copied().collect();
                    if unique.len() != ids.len() {
                        return false;
                    }
                    pending = ids;
                }
            }
        }
    }

    pending.is_empty()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::ToolCallResponse;

    fn call(id: &str) -> ToolCallResponse {
        ToolCallResponse::function(id, "browser_snapshot", "{}")
    }

    fn asst(ids: &[&str]) -> ChatMessage {
        ChatMessage::assistant_with_tool_calls(None, ids.iter().map(|id| call(id)).collect())
    }

    fn tool(id: &str) -> ChatMessage {
        ChatMessage::tool_result(id, format!("result for {id}"))
    }

    fn ids_of(messages: &[ChatMessage]) -> Vec<String> {
        messages
            .iter()
            .map(|m| match m.role {
                Role::Tool => format!("tool:{}", m.tool_call_id.as_deref().unwrap_or("")),
                Role::Assistant if m.has_tool_calls() => {
                    format!("asst:{}", m.tool_call_ids().join(","))
                }
                r => r.as_str().to_string(),
            })
            .collect()
    }

    #[test]
    fn test_valid_sequence_unchanged() {
        let msgs = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("go"),
            asst(&["a", "b"]),
            tool("a"),
            tool("b"),
            ChatMessage::assistant("done"),
        ];
        let out = validate_tool_call_sequence(&msgs);
        assert_eq!(out.kept, msgs);
        assert!(out.dropped.is_empty());
        assert!(is_protocol_valid(&out.kept));
    }

    #[test]
    fn test_dangling_call_dropped() {
        let msgs = vec![ChatMessage::user("go"), asst(&["a"]), tool("a"), asst(&["z"])];
        let out = validate_tool_call_sequence(&msgs);
        assert_eq!(ids_of(&out.kept), vec!["user", "asst:a", "tool:a"]);
        assert_eq!(out.dropped.len(), 1);
        assert_eq!(
            out.dropped[0].reason,
            DropReason::UnansweredToolCalls {
                call_ids: vec!["z".to_string()]
            }
        );
    }

    #[test]
    fn test_partial_batch_drops_assistant_and_its_answers() {
        let msgs = vec![ChatMessage::user("go"), asst(&["a", "b"]), tool("a"), ChatMessage::user("next")];
        let out = validate_tool_call_sequence(&msgs);
        assert_eq!(ids_of(&out.kept), vec!["user", "user"]);
        assert_eq!(out.dropped.len(), 2);
        assert_eq!(
            out.dropped[0].reason,
            DropReason::UnansweredToolCalls {
                call_ids: vec!["b".to_string()]
            }
        );
        assert_eq!(
            out.dropped[1].reason,
            DropReason::ParentCallDropped {
                tool_call_id: "a".to_string()
            }
        );
    }

    #[test]
    fn test_orphaned_leading_tool_result_dropped() {
        // Tail slices often begin with the answer to a call outside the slice.
        let msgs = vec![tool("x"), ChatMessage::assistant("ok"), ChatMessage::user("more")];
        let out = validate_tool_call_sequence(&msgs);
        assert_eq!(ids_of(&out.kept), vec!["assistant", "user"]);
        assert_eq!(
            out.dropped[0].reason,
            DropReason::OrphanedToolResult {
                tool_call_id: "x".to_string()
            }
        );
    }

    #[test]
    fn test_answer_before_call_does_not_count() {
        let msgs = vec![tool("a"), asst(&["a"])];
        let out = validate_tool_call_sequence(&msgs);
        assert!(out.kept.is_empty());
        assert_eq!(out.dropped.len(), 2);
    }

    #[test]
    fn test_out_of_order_answers_regrouped_in_call_order() {
        let msgs = vec![
            asst(&["a", "b"]),
            tool("b"),
            ChatMessage::user("interleaved"),
            tool("a"),
        ];
        let out = validate_tool_call_sequence(&msgs);
        assert_eq!(ids_of(&out.kept), vec!["asst:a,b", "tool:a", "tool:b", "user"]);
        assert!(is_protocol_valid(&out.kept));
    }

    #[test]
    fn test_duplicate_answer_dropped() {
        let msgs = vec![asst(&["a"]), tool("a"), tool("a")];
        let out = validate_tool_call_sequence(&msgs);
        assert_eq!(ids_of(&out.kept), vec!["asst:a", "tool:a"]);
        assert_eq!(
            out.dropped[0].reason,
            DropReason::DuplicateToolResult {
                tool_call_id: "a".to_string()
            }
        );
    }

    #[test]
    fn test_reused_call_id_second_batch_dropped() {
        let msgs = vec![asst(&["a"]), tool("a"), asst(&["a"])];
        let out = validate_tool_call_sequence(&msgs);
        assert_eq!(ids_of(&out.kept), vec!["asst:a", "tool:a"]);
        assert_eq!(out.dropped.len(), 1);
    }

    #[test]
    fn test_duplicate_ids_within_one_batch_dropped() {
        let msgs = vec![asst(&["a", "a"]), tool("a")];
        let out = validate_tool_call_sequence(&msgs);
        assert!(out.kept.is_empty());
        assert!(matches!(
            out.dropped[0].reason,
            DropReason::UnansweredToolCalls { .. }
        ));
    }

    #[test]
    fn test_tool_message_without_id() {
        let mut msg = tool("a");
        msg.tool_call_id = None;
        let out = validate_tool_call_sequence(&[msg]);
        assert_eq!(out.dropped[0].reason, DropReason::MissingToolCallId);
    }

    #[test]
    fn test_idempotent_on_messy_input() {
        let msgs = vec![
            tool("orphan"),
            ChatMessage::system("sys"),
            asst(&["a", "b"]),
            tool("b"),
            asst(&["c"]),
            tool("c"),
            tool("a"),
            ChatMessage::user("u"),
            asst(&["d"]),
            tool("d"),
            tool("d"),
            asst(&["e"]),
        ];
        let once = validate_tool_call_sequence(&msgs);
        let twice = validate_tool_call_sequence(&once.kept);
        assert_eq!(once.kept, twice.kept);
        assert!(twice.dropped.is_empty());
    }

    #[test]
    fn test_output_always_protocol_valid() {
        let cases: Vec<Vec<ChatMessage>> = vec![
            vec![],
            vec![asst(&["a"])],
            vec![tool("a")],
            vec![asst(&["a", "b"]), tool("b"), tool("a"), asst(&["c"]), tool("c")],
            vec![asst(&["a"]), ChatMessage::user("u"), tool("a")],
            vec![asst(&["a"]), asst(&["b"]), tool("b"), tool("a")],
        ];
        for msgs in cases {
            let out = validate_tool_call_sequence(&msgs);
            assert!(is_protocol_valid(&out.kept), "invalid output for {:?}", ids_of(&msgs));
            assert_eq!(out.kept.len() + out.dropped.len(), msgs.len());
        }
    }

    #[test]
    fn test_is_protocol_valid_rejects_interleaving() {
        assert!(!is_protocol_valid(&[asst(&["a"]), ChatMessage::user("u"), tool("a")]));
        assert!(!is_protocol_valid(&[tool("a")]));
        assert!(!is_protocol_valid(&[asst(&["a"])]));
        assert!(is_protocol_valid(&[asst(&["a", "b"]), tool("b"), tool("a")]));
    }
}
