//! Language-model collaborator
//!
//! The orchestrator talks to models only through [`ModelProvider`]: an ordered
//! list of chat messages in, one completion out.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::types::Message;

/// Sampling options for a completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Sampling temperature (0.0 - 2.0)
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: Some(0.0),
            max_tokens: Some(2048),
            stop_sequences: None,
        }
    }
}

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<think>([\s\S]*?)</think>").expect("valid think regex"))
}

/// Split `<think>...</think>` reasoning from the visible answer.
///
/// Returns `(reasoning, content)`. Without tags the whole response is content.
///
/// ```
/// use query_pilot::agent::model::parse_thinking_tokens;
///
/// let (reasoning, content) = parse_thinking_tokens("<think>check MAX</think>```sql\nSELECT 1\n```");
/// assert_eq!(reasoning.as_deref(), Some("check MAX"));
/// assert_eq!(content, "```sql\nSELECT 1\n```");
/// ```
pub fn parse_thinking_tokens(response: &str) -> (Option<String>, String) {
    let reasoning = think_re()
        .captures(response)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());

    let content = match response.rfind("</think>") {
        Some(end) => response[end + "</think>".len()..].trim().to_string(),
        None => response.to_string(),
    };
    (reasoning, content)
}

/// One completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Visible answer, reasoning tags removed
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

impl ModelResponse {
    /// Build a response from raw model text, splitting out reasoning.
    pub fn from_raw(raw: &str, model: impl Into<String>) -> Self {
        let (reasoning, content) = parse_thinking_tokens(raw);
        Self {
            content,
            reasoning,
            model: model.into(),
            usage: None,
            finish_reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub name: String,
    pub supported_models: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Mock,
    #[cfg(feature = "openai")]
    OpenAI,
}

impl ProviderKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mock" => Some(ProviderKind::Mock),
            #[cfg(feature = "openai")]
            "openai" => Some(ProviderKind::OpenAI),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Mock => "mock",
            #[cfg(feature = "openai")]
            ProviderKind::OpenAI => "openai",
        }
    }
}

/// Core trait that all model providers implement
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Complete a chat transcript
    async fn complete(&self, messages: &[Message], config: &GenerationConfig) -> Result<ModelResponse>;

    fn metadata(&self) -> ProviderMetadata;

    fn kind(&self) -> ProviderKind;
}
