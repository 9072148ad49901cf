use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod remote;
pub mod retry;
pub mod structured;

/// Core trait for LLM providers
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a chat completion for the given messages
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Cheap liveness probe; callers check this before submitting work
    async fn health_check(&self) -> bool;

    /// Model name requests are sent to
    fn model(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Request structure for LLM generation
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
    /// Ask the backend to constrain output to a JSON object
    pub json_mode: bool,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("could not connect to LLM backend: {0}")]
    Connect(String),
    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),
    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to decode LLM response: {0}")]
    Decode(String),
    #[error("LLM response has no choices")]
    Empty,
    #[error("LLM HTTP request failed: {0}")]
    Request(String),
}

impl LlmError {
    /// Connection and timeout failures are infrastructure problems worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Connect(_) | LlmError::Timeout(_))
    }
}

/// Helper to extract JSON from text that might contain markdown backticks or preamble
pub fn extract_json_from_text(text: &str) -> Option<String> {
    // Content between ```json and ```
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // Content between ``` and ```
    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // First '{' to last '}'
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return Some(text[start..=end].to_string());
        }
    }

    None
}
