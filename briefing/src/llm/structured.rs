//! Structured (JSON-only) and plain chat calls on top of an `LlmProvider`.

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use super::retry::{Retry, RetryPolicy};
use super::{extract_json_from_text, ChatMessage, LlmError, LlmProvider, LlmRequest, LlmResponse};

/// Appended to every structured-output system prompt
pub const JSON_ONLY_SUFFIX: &str = "\n\nRespond with valid JSON only.";

#[derive(Debug, Error)]
pub enum SummarizeError {
    /// Backend unreachable or timing out on every attempt
    #[error("LLM backend unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: LlmError },
    /// The model answered, but not with a JSON object. Never retried.
    #[error("LLM returned malformed JSON: {0}")]
    Malformed(String),
    /// Any other failure (API error, undecodable envelope, empty reply)
    #[error(transparent)]
    Failed(LlmError),
}

impl From<Retry<LlmError>> for SummarizeError {
    fn from(r: Retry<LlmError>) -> Self {
        match r {
            Retry::Permanent(e) => SummarizeError::Failed(e),
            Retry::Exhausted { attempts, last } => SummarizeError::Unavailable { attempts, last },
        }
    }
}

pub struct Summarizer {
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn LlmProvider>, retry: RetryPolicy) -> Self {
        Self {
            provider,
            retry,
            max_tokens: None,
            temperature: None,
        }
    }

    /// Override the provider's token budget and temperature for every call.
    pub fn with_sampling(mut self, max_tokens: usize, temperature: f32) -> Self {
        self.max_tokens = Some(max_tokens);
        self.temperature = Some(temperature);
        self
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }

    /// Ask for a JSON object. Connection/timeout failures are retried per the policy;
    /// a reply that does not parse as a JSON object fails immediately.
    pub async fn structured_output(
        &self,
        system_prompt: &str,
        content: &str,
    ) -> Result<Value, SummarizeError> {
        let request = LlmRequest {
            messages: vec![
                ChatMessage::system(format!("{}{}", system_prompt, JSON_ONLY_SUFFIX)),
                ChatMessage::user(content),
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            timeout_seconds: None,
            json_mode: true,
        };

        let response = self.send(request).await?;
        let value = parse_json_object(&response.content).map_err(|e| {
            error!(error = %e, "LLM returned invalid JSON");
            e
        })?;
        info!(
            model = %response.model,
            tokens = response.usage.total_tokens,
            "structured output received"
        );
        Ok(value)
    }

    /// Plain chat completion over a conversation history.
    pub async fn chat(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        temperature: Option<f32>,
    ) -> Result<String, SummarizeError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend_from_slice(history);

        let request = LlmRequest {
            messages,
            max_tokens: self.max_tokens,
            temperature: temperature.or(self.temperature),
            timeout_seconds: None,
            json_mode: false,
        };

        Ok(self.send(request).await?.content)
    }

    async fn send(&self, request: LlmRequest) -> Result<LlmResponse, SummarizeError> {
        self.retry
            .run(|| self.provider.generate(request.clone()))
            .await
            .map_err(|r| {
                let err = SummarizeError::from(r);
                if let SummarizeError::Failed(e) = &err {
                    error!(error = %e, "unexpected LLM error");
                }
                err
            })
    }
}

/// Parse a model reply as a JSON object, tolerating a surrounding code fence.
pub fn parse_json_object(text: &str) -> Result<Value, SummarizeError> {
    // A bare reply wins; string values may themselves contain fences or braces.
    let value: Value = match serde_json::from_str(text.trim()) {
        Ok(v) => v,
        Err(direct) => {
            let candidate = extract_json_from_text(text)
                .ok_or_else(|| SummarizeError::Malformed(direct.to_string()))?;
            serde_json::from_str(&candidate).map_err(|e| SummarizeError::Malformed(e.to_string()))?
        }
    };
    if !value.is_object() {
        return Err(SummarizeError::Malformed(format!(
            "expected a JSON object, got {}",
            json_kind(&value)
        )));
    }
    Ok(value)
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
