//! Inference: chat wire types and the chat-completion collaborator.
//!
//! - `types`: OpenAI-compatible message, request and response types
//! - `client`: `ChatClient` trait and the HTTP implementation
//! - `errors`: Transport errors and the `TokenLimitError` that triggers recovery

pub mod client;
pub mod errors;
pub mod types;

// Re-exports for convenience
pub use client::{ChatClient, HttpChatClient};
pub use errors::{InferenceError, TokenLimitError};
pub use types::{ChatMessage, ChatOptions, ChatResponse, Role, ToolCallResponse};
