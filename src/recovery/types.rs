//! Shared types for the recovery engine.
//!
//! Tool invocations, progress summaries, the transient recovery record, and
//! the persisted trace/result records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::inference::errors::TokenLimitError;
use crate::inference::types::ChatMessage;

// ─── Tool Invocations ───────────────────────────────────────────────────────

/// Maximum entries kept per `dataCollected` bucket.
pub const MAX_BUCKET_ENTRIES: usize = 20;

/// A tool call decoded into a known category.
///
/// Anything not recognized lands in `Opaque` with its raw arguments, so the
/// summarizer's matchers stay exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolInvocation {
    /// Page navigation (`browser_navigate`, `navigate`, `goto`).
    Navigate { url: Option<String> },
    /// Structural snapshot of the current page.
    Snapshot,
    /// Click on a page element.
    Click {
        element: Option<String>,
        target_ref: Option<String>,
    },
    /// Text entry into a page element.
    Type {
        element: Option<String>,
        text: Option<String>,
    },
    /// Any other tool.
    Opaque {
        tool_name: String,
        arguments: serde_json::Value,
    },
}

const NAVIGATE_TOOLS: &[&str] = &["browser_navigate", "navigate", "goto", "open_url"];
const SNAPSHOT_TOOLS: &[&str] = &["browser_snapshot", "snapshot", "page_snapshot"];
const CLICK_TOOLS: &[&str] = &["browser_click", "click"];
const TYPE_TOOLS: &[&str] = &["browser_type", "type_text", "fill"];

impl ToolInvocation {
    /// Decode a tool call from its name and raw JSON arguments.
    ///
    /// Names are matched on their last `.`, `/` or `:` segment; `browser_*`
    /// names also match with an arbitrary `_`-joined prefix, so
    /// `playwright.browser_click` and `mcp_playwright_browser_click` both
    /// classify as `Click`.
    pub fn parse(tool_name: &str, arguments_json: &str) -> Self {
        let arguments: serde_json::Value = serde_json::from_str(arguments_json)
            .unwrap_or_else(|_| serde_json::Value::String(arguments_json.to_string()));
        let base = base_tool_name(tool_name);

        if matches_any(&base, NAVIGATE_TOOLS) {
            ToolInvocation::Navigate {
                url: str_arg(&arguments, "url"),
            }
        } else if matches_any(&base, SNAPSHOT_TOOLS) {
            ToolInvocation::Snapshot
        } else if matches_any(&base, CLICK_TOOLS) {
            ToolInvocation::Click {
                element: str_arg(&arguments, "element"),
                target_ref: str_arg(&arguments, "ref"),
            }
        } else if matches_any(&base, TYPE_TOOLS) {
            ToolInvocation::Type {
                element: str_arg(&arguments, "element"),
                text: str_arg(&arguments, "text"),
            }
        } else {
            ToolInvocation::Opaque {
                tool_name: tool_name.to_string(),
                arguments,
            }
        }
    }

    /// Whether the invocation belongs to a recognized category.
    pub fn is_recognized(&self) -> bool {
        !matches!(self, ToolInvocation::Opaque { .. })
    }
}

fn base_tool_name(tool_name: &str) -> String {
    tool_name
        .rsplit(|c| c == '.' || c == '/' || c == ':')
        .next()
        .unwrap_or(tool_name)
        .to_lowercase()
}

fn matches_any(base: &str, names: &[&str]) -> bool {
    names.iter().any(|name| {
        base == *name || (name.starts_with("browser_") && base.ends_with(&format!("_{name}")))
    })
}

fn str_arg(arguments: &serde_json::Value, key: &str) -> Option<String> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// A tool message paired back to the call that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_name: String,
    pub content: String,
    pub call_arguments: ToolInvocation,
}

// ─── Progress Summary ───────────────────────────────────────────────────────

/// Structured record of what a task accomplished before the token limit hit.
///
/// Created once per recovery attempt; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub original_task: String,
    pub progress: Progress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completed: Vec<String>,
    pub current_state: String,
    pub next_steps: Vec<String>,
    pub data_collected: DataCollected,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Facts scraped from tool output, grouped by bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataCollected {
    pub visited_urls: Vec<String>,
    pub page_titles: Vec<String>,
    pub identifiers: Vec<String>,
    /// Label → observed numbers, e.g. `"comments" → [12, 40]`.
    pub counts: BTreeMap<String, Vec<u64>>,
}

impl DataCollected {
    pub fn is_empty(&self) -> bool {
        self.visited_urls.is_empty()
            && self.page_titles.is_empty()
            && self.identifiers.is_empty()
            && self.counts.is_empty()
    }

    /// Insert into a bucket, skipping duplicates and respecting the cap.
    pub(crate) fn push_unique(bucket: &mut Vec<String>, value: &str) {
        let value = value.trim();
        if value.is_empty() || bucket.len() >= MAX_BUCKET_ENTRIES {
            return;
        }
        if !bucket.iter().any(|v| v == value) {
            bucket.push(value.to_string());
        }
    }

    pub(crate) fn push_count(&mut self, label: &str, value: u64) {
        let bucket = self.counts.entry(label.to_string()).or_default();
        if bucket.len() < MAX_BUCKET_ENTRIES && !bucket.contains(&value) {
            bucket.push(value);
        }
    }
}

// ─── Recovery Record ────────────────────────────────────────────────────────

/// Working state for one recovery call, owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct RecoveryData {
    pub original_user_query: String,
    pub progress_summary: ProgressSummary,
    pub tail_messages: Vec<ChatMessage>,
    pub compressed_context: String,
    pub tool_results: Vec<ToolResult>,
    pub execution_id: String,
    pub recovery_count: u32,
}

// ─── Validation ─────────────────────────────────────────────────────────────

/// Why the validator removed a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DropReason {
    /// Assistant message whose calls were not all answered.
    UnansweredToolCalls { call_ids: Vec<String> },
    /// Tool message with no matching earlier call.
    OrphanedToolResult { tool_call_id: String },
    /// Second answer to an already-answered call.
    DuplicateToolResult { tool_call_id: String },
    /// Tool message without a `tool_call_id`.
    MissingToolCallId,
    /// Answer whose assistant message was itself dropped.
    ParentCallDropped { tool_call_id: String },
}

/// A removed message and the reason it was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedMessage {
    pub reason: DropReason,
    pub message: ChatMessage,
}

/// Validator output: the protocol-valid list plus an audit of what was cut.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationOutcome {
    pub kept: Vec<ChatMessage>,
    pub dropped: Vec<DroppedMessage>,
}

// ─── Persisted Records ──────────────────────────────────────────────────────

/// Execution phase a trace was written at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracePhase {
    Original,
    Recovery,
    Completion,
}

impl TracePhase {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TracePhase::Original => "original",
            TracePhase::Recovery => "recovery",
            TracePhase::Completion => "completion",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "original" => Some(TracePhase::Original),
            "recovery" => Some(TracePhase::Recovery),
            "completion" => Some(TracePhase::Completion),
            _ => None,
        }
    }
}

/// Estimated (and, when the upstream reported it, actual) token usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub estimated: u32,
    pub actual: Option<u32>,
}

/// Phase-tagged snapshot of an execution's messages. Insert-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTrace {
    /// Unique trace id.
    pub id: String,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    pub phase: TracePhase,
    pub recovery_count: u32,
    pub messages: Vec<ChatMessage>,
    pub token_usage: TokenUsage,
    pub progress_summary: Option<ProgressSummary>,
    pub results: Option<serde_json::Value>,
    pub error: Option<TokenLimitError>,
}

impl ExecutionTrace {
    /// New trace with a fresh id and the current timestamp.
    pub fn new(
        execution_id: &str,
        phase: TracePhase,
        recovery_count: u32,
        messages: Vec<ChatMessage>,
        token_usage: TokenUsage,
    ) -> Self {
        Self {
            id: format!("trace_{}", uuid::Uuid::new_v4()),
            execution_id: execution_id.to_string(),
            timestamp: Utc::now(),
            phase,
            recovery_count,
            messages,
            token_usage,
            progress_summary: None,
            results: None,
            error: None,
        }
    }
}

/// Status of a stored execution result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Completed => "completed",
        }
    }
}

/// Final payload of a completed execution, keyed by execution id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub task_type: String,
    pub results: serde_json::Value,
    pub status: ResultStatus,
    pub timestamp: DateTime<Utc>,
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_navigate_with_mcp_prefixes() {
        for name in [
            "browser_navigate",
            "playwright.browser_navigate",
            "mcp_playwright_browser_navigate",
            "playwright/browser_navigate",
        ] {
            let inv = ToolInvocation::parse(name, r#"{"url": "https://news.ycombinator.com"}"#);
            assert_eq!(
                inv,
                ToolInvocation::Navigate {
                    url: Some("https://news.ycombinator.com".to_string())
                },
                "{name} should classify as navigation"
            );
        }
    }

    #[test]
    fn test_parse_click_and_type() {
        let click = ToolInvocation::parse("browser_click", r#"{"element": "Login button", "ref": "e12"}"#);
        assert_eq!(
            click,
            ToolInvocation::Click {
                element: Some("Login button".to_string()),
                target_ref: Some("e12".to_string())
            }
        );

        let typed = ToolInvocation::parse("browser_type", r#"{"element": "Search", "text": "rust"}"#);
        assert!(matches!(typed, ToolInvocation::Type { text: Some(ref t), .. } if t == "rust"));
    }

    #[test]
    fn test_unrelated_suffix_stays_opaque() {
        let inv = ToolInvocation::parse("filesystem.get_content_type", r#"{"path": "/tmp/a"}"#);
        assert!(!inv.is_recognized());
        match inv {
            ToolInvocation::Opaque { tool_name, arguments } => {
                assert_eq!(tool_name, "filesystem.get_content_type");
                assert_eq!(arguments["path"], "/tmp/a");
            }
            other => panic!("expected opaque, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_arguments_kept_as_string() {
        let inv = ToolInvocation::parse("search", "{not json");
        match inv {
            ToolInvocation::Opaque { arguments, .. } => {
                assert_eq!(arguments, serde_json::Value::String("{not json".to_string()));
            }
            other => panic!("expected opaque, got {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_ignores_arguments() {
        assert_eq!(ToolInvocation::parse("browser_snapshot", ""), ToolInvocation::Snapshot);
    }

    #[test]
    fn test_trace_phase_roundtrip() {
        for phase in [TracePhase::Original, TracePhase::Recovery, TracePhase::Completion] {
            assert_eq!(TracePhase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(TracePhase::parse("resumed"), None);
    }

    #[test]
    fn test_push_unique_dedupes_and_caps() {
        let mut bucket = Vec::new();
        DataCollected::push_unique(&mut bucket, "a");
        DataCollected::push_unique(&mut bucket, " a ");
        assert_eq!(bucket, vec!["a"]);

        for i in 0..50 {
            DataCollected::push_unique(&mut bucket, &format!("v{i}"));
        }
        assert_eq!(bucket.len(), MAX_BUCKET_ENTRIES);
    }

    #[test]
    fn test_progress_summary_serializes_camel_case() {
        let summary = ProgressSummary {
            original_task: "find posts".to_string(),
            progress: Progress {
                completed: vec![],
                current_state: "Task in progress".to_string(),
                next_steps: vec![],
                data_collected: DataCollected::default(),
                execution_id: "exec_1".to_string(),
                timestamp: Utc::now(),
            },
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("originalTask"));
        assert!(json.contains("currentState"));
        assert!(json.contains("dataCollected"));
        assert!(json.contains("visitedUrls"));
    }
}
