//! Recovery orchestrator.
//!
//! Per execution id, three phases:
//! 1. **original**: normal execution, ends with a `TokenLimitError`
//! 2. **recovery**: extract → summarize → compress → reconstruct → validate,
//!    persisted as a `recovery` trace; may repeat any number of times
//! 3. **completion**: the task finishes and its result is stored
//!
//! The orchestrator owns the working [`RecoveryData`] for the length of one
//! call. Persistence is best-effort: a failed write is logged, and the
//! rebuilt message list is returned regardless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::{CompressionConfig, EngineConfig};
use crate::inference::client::{ChatClient, HttpChatClient};
use crate::inference::errors::TokenLimitError;
use crate::inference::types::ChatMessage;

use super::compressor::ContextCompressor;
use super::errors::RecoveryError;
use super::progress::{extract_original_query, extract_tool_results, summarize_progress};
use super::reconstructor::{reconstruct_context, Reconstruction, TAIL_SIZE};
use super::tokens::{clip_to_tokens, estimate_messages_tokens, TokenBudget};
use super::trace_store::TraceStore;
use super::types::{
    DroppedMessage, ExecutionResult, ExecutionTrace, RecoveryData, TokenUsage, TracePhase,
};

/// Ends a user query that had to be cut to fit the budget.
const CLIPPED_QUERY_MARKER: &str = "\n[... request truncated during context recovery]";

// ─── Types ──────────────────────────────────────────────────────────────────

/// What one recovery pass produced.
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    /// Protocol-valid list to resume the chat loop with.
    pub messages: Vec<ChatMessage>,
    pub execution_id: String,
    /// 1 for the first recovery of this execution, 2 for the second, ...
    pub recovery_count: u32,
    /// Messages the validator removed from the tail.
    pub dropped: Vec<DroppedMessage>,
    pub estimated_tokens: u32,
    /// Whether the `recovery` trace reached the store.
    pub trace_persisted: bool,
}

/// Ties the recovery components together for any number of executions.
pub struct RecoveryOrchestrator {
    store: TraceStore,
    compressor: ContextCompressor,
    /// execution id → recoveries run by this process
    counters: Mutex<HashMap<String, u32>>,
}

impl RecoveryOrchestrator {
    pub fn new(store: TraceStore, client: Arc<dyn ChatClient>, compression: CompressionConfig) -> Self {
        Self {
            store,
            compressor: ContextCompressor::new(client, compression),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Build an orchestrator from configuration: HTTP chat client plus the
    /// on-disk trace store.
    pub async fn from_config(config: &EngineConfig) -> Result<Self, RecoveryError> {
        let client = HttpChatClient::new(config.endpoint.clone()).map_err(|e| {
            RecoveryError::ClientInit {
                reason: e.to_string(),
            }
        })?;
        let store_path = config.store.resolved_path();
        let store = TraceStore::open(&store_path).await?;

        tracing::info!(
            store = %store_path.display(),
            chat_model = client.default_model(),
            compression_model = %config.compression.model,
            "recovery orchestrator ready"
        );
        Ok(Self::new(store, Arc::new(client), config.compression.clone()))
    }

    pub fn store(&self) -> &TraceStore {
        &self.store
    }

    /// Rebuild an oversized conversation into a short, resumable one.
    ///
    /// Generates an execution id when none is given, records the failing
    /// conversation as an `original` trace (not awaited), runs the pipeline,
    /// and awaits the `recovery` trace before returning.
    pub async fn handle_token_limit_error(
        &self,
        error: &TokenLimitError,
        messages: &[ChatMessage],
        execution_id: Option<&str>,
    ) -> RecoveryOutcome {
        let execution_id = execution_id
            .map(str::to_string)
            .unwrap_or_else(new_execution_id);
        let recovery_count = self.next_recovery_count(&execution_id).await;

        tracing::warn!(
            execution_id = %execution_id,
            recovery_count,
            tokens_requested = error.tokens_requested,
            max_tokens = error.max_tokens,
            overflow = error.overflow(),
            messages = messages.len(),
            "token limit exceeded, starting context recovery"
        );

        // ── original phase ──────────────────────────────────────────────
        let mut original = ExecutionTrace::new(
            &execution_id,
            TracePhase::Original,
            recovery_count - 1,
            messages.to_vec(),
            TokenUsage {
                estimated: estimate_messages_tokens(messages),
                actual: (error.tokens_requested > 0).then_some(error.tokens_requested),
            },
        );
        original.error = Some(error.clone());
        self.store.put_detached(original);

        // ── extraction & summarization ──────────────────────────────────
        let original_user_query = extract_original_query(messages);
        let tool_results = extract_tool_results(messages);
        let progress_summary = summarize_progress(messages, &tool_results, &execution_id);

        // ── compression ─────────────────────────────────────────────────
        let split = messages.len().saturating_sub(TAIL_SIZE);
        let (older, tail) = messages.split_at(split);
        let compressed_context = self.compressor.compress(older).await;

        // ── reconstruction ──────────────────────────────────────────────
        let mut data = RecoveryData {
            original_user_query,
            progress_summary,
            tail_messages: tail.to_vec(),
            compressed_context,
            tool_results,
            execution_id: execution_id.clone(),
            recovery_count,
        };
        let first = reconstruct_context(&data);
        let Reconstruction {
            messages: rebuilt,
            dropped,
        } = match TokenBudget::below(error.tokens_requested) {
            Some(budget) => fit_to_budget(&mut data, first, budget),
            None => first,
        };
        let estimated_tokens = estimate_messages_tokens(&rebuilt);

        // ── recovery phase ──────────────────────────────────────────────
        let mut trace = ExecutionTrace::new(
            &execution_id,
            TracePhase::Recovery,
            recovery_count,
            rebuilt.clone(),
            TokenUsage {
                estimated: estimated_tokens,
                actual: None,
            },
        );
        trace.progress_summary = Some(data.progress_summary);
        trace.error = Some(error.clone());

        let trace_persisted = match self.store.put(&trace).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    execution_id = %execution_id,
                    error = %e,
                    "failed to persist recovery trace"
                );
                false
            }
        };

        tracing::info!(
            execution_id = %execution_id,
            recovery_count,
            before = messages.len(),
            after = rebuilt.len(),
            dropped = dropped.len(),
            estimated_tokens,
            "context recovery complete"
        );

        RecoveryOutcome {
            messages: rebuilt,
            execution_id,
            recovery_count,
            dropped,
            estimated_tokens,
            trace_persisted,
        }
    }

    /// Record a finished execution: a `completion` trace and the final result.
    pub async fn complete_execution<R: Serialize>(
        &self,
        execution_id: &str,
        task_type: &str,
        results: &R,
        messages: &[ChatMessage],
    ) -> Result<ExecutionResult, RecoveryError> {
        let results = serde_json::to_value(results)?;
        let recovery_count = self.current_recovery_count(execution_id).await;

        let mut trace = ExecutionTrace::new(
            execution_id,
            TracePhase::Completion,
            recovery_count,
            messages.to_vec(),
            TokenUsage {
                estimated: estimate_messages_tokens(messages),
                actual: None,
            },
        );
        trace.results = Some(results.clone());
        self.store.put(&trace).await?;

        let record = self
            .store
            .store_execution_result(execution_id, task_type, &results)
            .await?;

        if let Ok(mut counters) = self.counters.lock() {
            counters.remove(execution_id);
        }
        tracing::info!(execution_id, task_type, recovery_count, "execution completed");
        Ok(record)
    }

    /// Recoveries so far: the larger of this process's count and the store's.
    async fn current_recovery_count(&self, execution_id: &str) -> u32 {
        let persisted = match self.store.count_recovery_traces(execution_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(execution_id, error = %e, "could not read recovery count");
                0
            }
        };
        let in_memory = self
            .counters
            .lock()
            .map(|c| c.get(execution_id).copied().unwrap_or(0))
            .unwrap_or(0);
        persisted.max(in_memory)
    }

    async fn next_recovery_count(&self, execution_id: &str) -> u32 {
        let persisted = match self.store.count_recovery_traces(execution_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(execution_id, error = %e, "could not read recovery count");
                0
            }
        };
        match self.counters.lock() {
            Ok(mut counters) => {
                let entry = counters.entry(execution_id.to_string()).or_insert(0);
                *entry = (*entry).max(persisted) + 1;
                *entry
            }
            Err(_) => persisted + 1,
        }
    }
}

/// Shrink a reconstruction until it estimates below `budget`: first without
/// the tail, then with the user query clipped to whatever room is left.
fn fit_to_budget(data: &mut RecoveryData, first: Reconstruction, budget: TokenBudget) -> Reconstruction {
    if budget.admits(&first.messages) {
        return first;
    }
    tracing::warn!(
        execution_id = %data.execution_id,
        estimated_tokens = estimate_messages_tokens(&first.messages),
        tokens_requested = budget.limit(),
        "rebuilt context not smaller than failed request, dropping tail"
    );
    data.tail_messages.clear();
    let without_tail = reconstruct_context(data);
    if budget.admits(&without_tail.messages) {
        return without_tail;
    }

    let query = std::mem::take(&mut data.original_user_query);
    let allowance = budget.headroom(&reconstruct_context(data).messages);
    data.original_user_query = clip_to_tokens(&query, allowance, CLIPPED_QUERY_MARKER);
    tracing::warn!(
        execution_id = %data.execution_id,
        query_chars = query.len(),
        kept_chars = data.original_user_query.len(),
        "user query clipped to fit below failed request"
    );

    let clipped = reconstruct_context(data);
    if !budget.admits(&clipped.messages) {
        tracing::error!(
            execution_id = %data.execution_id,
            estimated_tokens = estimate_messages_tokens(&clipped.messages),
            tokens_requested = budget.limit(),
            "rebuilt context still not smaller than failed request"
        );
    }
    clipped
}

/// Fresh execution id: `exec_<uuid>`.
pub fn new_execution_id() -> String {
    format!("exec_{}", uuid::Uuid::new_v4())
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::errors::InferenceError;
    use crate::inference::types::{ChatOptions, ChatResponse, ResponseMessage, Role, ToolCallResponse};
    use crate::recovery::validator::is_protocol_valid;
    use async_trait::async_trait;
    use serde_json::json;

    struct MockClient;

    #[async_trait]
    impl ChatClient for MockClient {
        async fn send_chat(
            &self,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<ChatResponse, InferenceError> {
            Ok(ChatResponse {
                message: ResponseMessage {
                    content: Some("Visited two pages, collected titles.".to_string()),
                },
                ..ChatResponse::default()
            })
        }
    }

    async fn orchestrator() -> RecoveryOrchestrator {
        let store = TraceStore::open_in_memory().await.unwrap();
        RecoveryOrchestrator::new(store, Arc::new(MockClient), CompressionConfig::default())
    }

    fn limit_error() -> TokenLimitError {
        TokenLimitError::new("context length exceeded", 9_000, 8_000, 8_500, 500)
    }

    fn conversation() -> Vec<ChatMessage> {
        let mut msgs = vec![
            ChatMessage::system("You are a browsing agent."),
            ChatMessage::user("Collect the titles of the first two pages"),
        ];
        for i in 0..3 {
            let id = format!("call_{i}");
            msgs.push(ChatMessage::assistant_with_tool_calls(
                None,
                vec![ToolCallResponse::function(
                    &id,
                    "browser_navigate",
                    format!(r#"{{"url": "https://example.com/{i}"}}"#),
                )],
            ));
            msgs.push(ChatMessage::tool_result(&id, format!("- Page Title: Page {i}")));
        }
        msgs
    }

    #[tokio::test]
    async fn test_generates_execution_id_and_persists_traces() {
        let orch = orchestrator().await;
        let outcome = orch
            .handle_token_limit_error(&limit_error(), &conversation(), None)
            .await;

        assert!(outcome.execution_id.starts_with("exec_"));
        assert_eq!(outcome.recovery_count, 1);
        assert!(outcome.trace_persisted);
        assert!(is_protocol_valid(&outcome.messages));
        assert_eq!(outcome.messages[0].role, Role::System);
        assert_eq!(
            outcome.messages[1].content.as_deref(),
            Some("Collect the titles of the first two pages")
        );

        let recoveries = orch
            .store()
            .get_traces_by_phase(TracePhase::Recovery, 10)
            .await
            .unwrap();
        assert_eq!(recoveries.len(), 1);
        assert_eq!(recoveries[0].messages.len(), outcome.messages.len());
        assert_eq!(recoveries[0].messages[0], outcome.messages[0]);
        assert!(recoveries[0].progress_summary.is_some());
    }

    #[tokio::test]
    async fn test_recovery_count_increments_per_execution() {
        let orch = orchestrator().await;
        let msgs = conversation();
        let first = orch
            .handle_token_limit_error(&limit_error(), &msgs, Some("exec_a"))
            .await;
        let second = orch
            .handle_token_limit_error(&limit_error(), &first.messages, Some("exec_a"))
            .await;
        let other = orch
            .handle_token_limit_error(&limit_error(), &msgs, Some("exec_b"))
            .await;

        assert_eq!(first.recovery_count, 1);
        assert_eq!(second.recovery_count, 2);
        assert_eq!(other.recovery_count, 1);
    }

    #[tokio::test]
    async fn test_recovery_count_survives_new_orchestrator() {
        let store = TraceStore::open_in_memory().await.unwrap();
        let first = RecoveryOrchestrator::new(store.clone(), Arc::new(MockClient), CompressionConfig::default());
        first
            .handle_token_limit_error(&limit_error(), &conversation(), Some("exec_a"))
            .await;

        let second = RecoveryOrchestrator::new(store, Arc::new(MockClient), CompressionConfig::default());
        let outcome = second
            .handle_token_limit_error(&limit_error(), &conversation(), Some("exec_a"))
            .await;
        assert_eq!(outcome.recovery_count, 2);
    }

    #[tokio::test]
    async fn test_closed_store_still_returns_messages() {
        let orch = orchestrator().await;
        orch.store().close().await.unwrap();

        let outcome = orch
            .handle_token_limit_error(&limit_error(), &conversation(), Some("exec_c"))
            .await;
        assert!(!outcome.trace_persisted);
        assert_eq!(outcome.recovery_count, 1);
        assert!(outcome.messages.len() >= 3);
    }

    #[tokio::test]
    async fn test_huge_tail_is_dropped_to_stay_below_limit() {
        let orch = orchestrator().await;
        let mut msgs = vec![ChatMessage::user("Summarize these documents")];
        for i in 0..2 {
            let id = format!("read_{i}");
            msgs.push(ChatMessage::assistant_with_tool_calls(
                None,
                vec![ToolCallResponse::function(&id, "read_file", "{}")],
            ));
            msgs.push(ChatMessage::tool_result(&id, "z".repeat(7_900)));
        }
        let error = TokenLimitError::new("too long", 3_000, 2_048, 3_000, 0);

        let outcome = orch.handle_token_limit_error(&error, &msgs, None).await;
        assert_eq!(outcome.messages.len(), 3);
        assert!(outcome.estimated_tokens < 3_000);
    }

    /// A pasted ~30k-char document as the first user message, then three
    /// answered `read_file` calls.
    fn pasted_document_conversation() -> (String, Vec<ChatMessage>) {
        let query = format!(
            "Review this contract and list every deadline:\n{}",
            "clause text ".repeat(2_500)
        );
        let mut msgs = vec![
            ChatMessage::system("You are a file assistant."),
            ChatMessage::user(query.clone()),
        ];
        for i in 0..3 {
            let id = format!("read_{i}");
            msgs.push(ChatMessage::assistant_with_tool_calls(
                None,
                vec![ToolCallResponse::function(&id, "read_file", "{}")],
            ));
            msgs.push(ChatMessage::tool_result(&id, "z".repeat(1_500)));
        }
        (query, msgs)
    }

    #[tokio::test]
    async fn test_long_first_message_does_not_grow_context() {
        let orch = orchestrator().await;
        let (query, msgs) = pasted_document_conversation();
        let requested = estimate_messages_tokens(&msgs) + 500;
        let error = TokenLimitError::new("too long", requested, requested - 1_000, requested, 0);

        let outcome = orch.handle_token_limit_error(&error, &msgs, None).await;

        assert!(
            outcome.estimated_tokens < requested,
            "{} >= {requested}",
            outcome.estimated_tokens
        );
        assert_eq!(outcome.messages[1].content.as_deref(), Some(query.as_str()));
        let system = outcome.messages[0].content.as_deref().unwrap();
        assert!(!system.contains(&query[..2_000]));
        assert!(is_protocol_valid(&outcome.messages));
    }

    #[tokio::test]
    async fn test_query_clipped_when_it_alone_exceeds_limit() {
        let orch = orchestrator().await;
        let (query, msgs) = pasted_document_conversation();
        let error = TokenLimitError::new("too long", 6_000, 4_096, 6_000, 0);

        let outcome = orch.handle_token_limit_error(&error, &msgs, None).await;

        assert!(outcome.estimated_tokens < 6_000, "estimated {}", outcome.estimated_tokens);
        assert_eq!(outcome.messages.len(), 3);
        let user = outcome.messages[1].content.as_deref().unwrap();
        assert!(user.ends_with(CLIPPED_QUERY_MARKER));
        assert!(query.starts_with(user.trim_end_matches(CLIPPED_QUERY_MARKER)));
        assert!(user.len() > 10_000, "kept only {} bytes", user.len());
    }

    #[tokio::test]
    async fn test_complete_execution_writes_result_and_trace() {
        let orch = orchestrator().await;
        let outcome = orch
            .handle_token_limit_error(&limit_error(), &conversation(), Some("exec_d"))
            .await;

        let record = orch
            .complete_execution(
                "exec_d",
                "browse",
                &json!({"titles": ["Page 0", "Page 1"]}),
                &outcome.messages,
            )
            .await
            .unwrap();
        assert_eq!(record.execution_id, "exec_d");

        let stored = orch.store().get_execution_result("exec_d").await.unwrap().unwrap();
        assert_eq!(stored.results["titles"][1], "Page 1");

        let completion = orch
            .store()
            .get_traces_by_phase(TracePhase::Completion, 1)
            .await
            .unwrap();
        assert_eq!(completion[0].recovery_count, 1);
        assert!(completion[0].results.is_some());
    }
}
