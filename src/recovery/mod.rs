//! Recovery: token-limit recovery and context reconstruction.
//!
//! Submodules:
//! - `validator`: Tool-call pairing invariant, enforced by dropping messages
//! - `tokens`: Heuristic token estimation for sizing decisions
//! - `progress`: Structured progress summary from tool results
//! - `compressor`: LLM-backed history compression with a deterministic fallback
//! - `reconstructor`: Rebuilds a short, protocol-valid message list
//! - `trace_store`: SQLite persistence for execution traces and results
//! - `orchestrator`: Entry point tying the pipeline together per execution id
//! - `types`: Shared types across the recovery engine
//! - `errors`: Recovery-level error types

pub mod compressor;
pub mod errors;
pub mod orchestrator;
pub mod progress;
pub mod reconstructor;
pub mod tokens;
pub mod trace_store;
pub mod types;
pub mod validator;

// Re-exports for convenience
pub use compressor::ContextCompressor;
pub use errors::RecoveryError;
pub use orchestrator::{RecoveryOrchestrator, RecoveryOutcome};
pub use reconstructor::{reconstruct_context, Reconstruction};
pub use trace_store::TraceStore;
pub use types::{
    DropReason, DroppedMessage, ExecutionResult, ExecutionTrace, ProgressSummary, RecoveryData,
    ToolInvocation, ToolResult, TracePhase, ValidationOutcome,
};
pub use validator::{is_protocol_valid, validate_tool_call_sequence};
