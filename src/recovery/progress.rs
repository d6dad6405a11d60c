//! Progress summarization.
//!
//! Walks the tool results of an interrupted execution and builds a
//! [`ProgressSummary`]: one "completed" line per recognized tool call, facts
//! scraped from tool output into `dataCollected`, a `currentState` looked up
//! from the last recognized call, and `nextSteps` keyed off the task text.
//!
//! This is a pattern-matching accumulator. New tool categories or content
//! patterns are added to the tables below; the walk itself does not change.
//! Nothing here fails: unmatched results contribute nothing.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;

use crate::inference::types::{ChatMessage, Role};

use super::tokens::truncate_utf8;
use super::types::{DataCollected, Progress, ProgressSummary, ToolInvocation, ToolResult};

/// Most recent `completed` lines kept in a summary.
pub const MAX_COMPLETED_LINES: usize = 30;

/// Longest `originalTask` kept in a summary. The full request travels
/// once, as the user message of the rebuilt context.
pub const MAX_TASK_PREVIEW_CHARS: usize = 400;

const TASK_PREVIEW_MARKER: &str = " [... request continues in the user message]";

/// `currentState` when no recognized tool ran.
const DEFAULT_STATE: &str = "Task in progress";

/// `nextSteps` when no keyword rule matches the task.
const DEFAULT_NEXT_STEP: &str = "Continue autonomous execution of the original task";

// ─── Extraction ─────────────────────────────────────────────────────────────

/// Content of the first user message, or an empty string.
pub fn extract_original_query(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .find(|m| m.role == Role::User)
        .and_then(|m| m.content.clone())
        .unwrap_or_default()
}

/// Bounded prefix of the user's request for the summary and system prompt.
pub fn task_preview(query: &str) -> String {
    if query.len() <= MAX_TASK_PREVIEW_CHARS {
        return query.to_string();
    }
    format!("{}{TASK_PREVIEW_MARKER}", truncate_utf8(query, MAX_TASK_PREVIEW_CHARS))
}

/// Pair every `tool` message back to the call that produced it.
///
/// Tool messages whose id was never introduced by an earlier assistant
/// message are skipped.
pub fn extract_tool_results(messages: &[ChatMessage]) -> Vec<ToolResult> {
    // call id → (tool name, raw arguments)
    let mut calls: HashMap<&str, (&str, &str)> = HashMap::new();
    let mut results = Vec::new();

    for msg in messages {
        match msg.role {
            Role::Assistant => {
                for call in msg.tool_calls.iter().flatten() {
                    calls.insert(
                        call.id.as_str(),
                        (call.function.name.as_str(), call.function.arguments.as_str()),
                    );
                }
            }
            Role::Tool => {
                let Some(id) = msg.tool_call_id.as_deref() else {
                    continue;
                };
                if let Some((name, args)) = calls.get(id) {
                    results.push(ToolResult {
                        tool_name: name.to_string(),
                        content: msg.content.clone().unwrap_or_default(),
                        call_arguments: ToolInvocation::parse(name, args),
                    });
                }
            }
            _ => {}
        }
    }

    results
}

// ─── Summarization ──────────────────────────────────────────────────────────

/// Build the progress record for one recovery attempt.
pub fn summarize_progress(
    messages: &[ChatMessage],
    tool_results: &[ToolResult],
    execution_id: &str,
) -> ProgressSummary {
    let full_task = extract_original_query(messages);
    let mut completed = Vec::new();
    let mut data = DataCollected::default();
    let mut current_state: Option<String> = None;

    for result in tool_results {
        if let Some(line) = completed_line(&result.call_arguments) {
            completed.push(line);
        }
        if let Some(state) = state_for(&result.call_arguments) {
            current_state = Some(state);
        }
        if let ToolInvocation::Navigate { url: Some(ref url) } = result.call_arguments {
            DataCollected::push_unique(&mut data.visited_urls, url);
        }
        scan_content(&result.content, &mut data);
    }

    let completed = keep_recent(completed);
    let next_steps = next_steps_for(&full_task);

    tracing::debug!(
        execution_id,
        tool_results = tool_results.len(),
        recognized = tool_results
            .iter()
            .filter(|r| r.call_arguments.is_recognized())
            .count(),
        completed = completed.len(),
        urls = data.visited_urls.len(),
        "progress summarized"
    );

    ProgressSummary {
        original_task: task_preview(&full_task),
        progress: Progress {
            completed,
            current_state: current_state.unwrap_or_else(|| DEFAULT_STATE.to_string()),
            next_steps,
            data_collected: data,
            execution_id: execution_id.to_string(),
            timestamp: Utc::now(),
        },
    }
}

/// Human-readable line for a recognized tool call.
fn completed_line(invocation: &ToolInvocation) -> Option<String> {
    let line = match invocation {
        ToolInvocation::Navigate { url: Some(url) } => format!("Navigated to {url}"),
        ToolInvocation::Navigate { url: None } => "Navigated to a page".to_string(),
        ToolInvocation::Snapshot => "Captured page snapshot".to_string(),
        ToolInvocation::Click { element, target_ref } => {
            let target = element
                .as_deref()
                .or(target_ref.as_deref())
                .unwrap_or("page element");
            format!("Clicked {target}")
        }
        ToolInvocation::Type { element, text } => match (text, element) {
            (Some(text), Some(element)) => format!("Typed \"{text}\" into {element}"),
            (Some(text), None) => format!("Typed \"{text}\""),
            _ => "Entered text".to_string(),
        },
        ToolInvocation::Opaque { .. } => return None,
    };
    Some(line)
}

/// `currentState` lookup for the most recent recognized call.
fn state_for(invocation: &ToolInvocation) -> Option<String> {
    let state = match invocation {
        ToolInvocation::Navigate { url: Some(url) } => format!("Viewing {url}"),
        ToolInvocation::Navigate { url: None } => "Viewing a page".to_string(),
        ToolInvocation::Snapshot => "Inspecting page structure".to_string(),
        ToolInvocation::Click { .. } => "Interacting with page elements".to_string(),
        ToolInvocation::Type { .. } => "Entering text into a page form".to_string(),
        ToolInvocation::Opaque { .. } => return None,
    };
    Some(state)
}

fn keep_recent(mut completed: Vec<String>) -> Vec<String> {
    if completed.len() <= MAX_COMPLETED_LINES {
        return completed;
    }
    let omitted = completed.len() - MAX_COMPLETED_LINES;
    let mut kept = Vec::with_capacity(MAX_COMPLETED_LINES + 1);
    kept.push(format!("({omitted} earlier steps omitted)"));
    kept.extend(completed.drain(omitted..));
    kept
}

// ─── Content Matchers ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Bucket {
    VisitedUrl,
    PageTitle,
    Identifier,
    /// Capture 1 is the number, capture 2 the label.
    Count,
}

/// Content patterns. Capture group 1 holds the value to record.
const CONTENT_MATCHERS: &[(Bucket, &str)] = &[
    (Bucket::VisitedUrl, r"(?m)^\s*-?\s*Page URL:\s*(\S+)"),
    (Bucket::PageTitle, r"(?m)^\s*-?\s*Page Title:\s*(.+?)\s*$"),
    (Bucket::Identifier, r"[?&]id=([A-Za-z0-9_-]+)"),
    (Bucket::Identifier, r"(?i)\b(?:item|post|story|issue|order) (?:id|#)\s*:?\s*([A-Za-z0-9_-]+)"),
    (
        Bucket::Count,
        r"(?i)\b(\d[\d,]*)\s+(comments?|likes?|points?|results?|replies|views|items?|stars?)\b",
    ),
];

fn compiled_matchers() -> &'static [(Bucket, Regex)] {
    static MATCHERS: OnceLock<Vec<(Bucket, Regex)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        CONTENT_MATCHERS
            .iter()
            .map(|(bucket, pattern)| {
                (*bucket, Regex::new(pattern).expect("valid content matcher regex"))
            })
            .collect()
    })
}

fn scan_content(content: &str, data: &mut DataCollected) {
    for (bucket, re) in compiled_matchers() {
        for caps in re.captures_iter(content) {
            let Some(value) = caps.get(1).map(|m| m.as_str()) else {
                continue;
            };
            match bucket {
                Bucket::VisitedUrl => DataCollected::push_unique(&mut data.visited_urls, value),
                Bucket::PageTitle => DataCollected::push_unique(&mut data.page_titles, value),
                Bucket::Identifier => DataCollected::push_unique(&mut data.identifiers, value),
                Bucket::Count => {
                    let number = value.replace(',', "").parse::<u64>().ok();
                    let label = caps.get(2).map(|m| count_label(m.as_str()));
                    if let (Some(number), Some(label)) = (number, label) {
                        data.push_count(&label, number);
                    }
                }
            }
        }
    }
}

/// Normalize `comment` / `Comments` to `comments`.
fn count_label(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if lower.ends_with('s') {
        lower
    } else {
        format!("{lower}s")
    }
}

// ─── Next Steps ─────────────────────────────────────────────────────────────

/// Task keywords → suggested next steps. Every matching rule contributes.
const NEXT_STEP_RULES: &[(&[&str], &[&str])] = &[
    (
        &["comment", "reply", "replies", "discussion"],
        &[
            "Open the remaining items to read their comments",
            "Record comment counts for each item",
        ],
    ),
    (
        &["search", "find", "look up", "lookup"],
        &[
            "Review the remaining search results",
            "Collect the entries that match the request",
        ],
    ),
    (
        &["log in", "login", "sign in"],
        &["Complete authentication", "Verify the signed-in state"],
    ),
    (
        &["form", "fill", "submit", "register"],
        &[
            "Fill in the remaining form fields",
            "Submit the form and confirm the result",
        ],
    ),
    (
        &["extract", "collect", "scrape", "list", "top"],
        &[
            "Continue extracting data from the current page",
            "Compile the collected data into the final answer",
        ],
    ),
    (
        &["compare", "summarize", "summarise", "report"],
        &["Summarize the collected data against the task requirements"],
    ),
];

fn next_steps_for(task: &str) -> Vec<String> {
    let lower = task.to_lowercase();
    let mut steps: Vec<String> = Vec::new();

    for (keywords, rule_steps) in NEXT_STEP_RULES {
        if keywords.iter().any(|k| lower.contains(k)) {
            for step in *rule_steps {
                if !steps.iter().any(|s| s == step) {
                    steps.push(step.to_string());
                }
            }
        }
    }

    if steps.is_empty() {
        steps.push(DEFAULT_NEXT_STEP.to_string());
    }
    steps
}

// ─── Tests ──────────────────────────────────────────────────────────────────
