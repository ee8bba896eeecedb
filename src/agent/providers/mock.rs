//! Mock model provider
//!
//! Replays scripted completions in order and records every transcript it is
//! asked to complete.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agent::model::{
    GenerationConfig, ModelProvider, ModelResponse, ProviderKind, ProviderMetadata, TokenUsage,
};
use crate::types::Message;

/// Scripted provider for tests and offline demos
#[derive(Debug, Clone)]
pub struct MockProvider {
    /// Canned responses, cycled when `cycle` is set
    responses: Vec<String>,
    current_index: Arc<Mutex<usize>>,
    requests: Arc<Mutex<Vec<Vec<Message>>>>,
    model_name: String,
    cycle: bool,
    delay: Option<Duration>,
}

impl MockProvider {
    /// A provider that always answers with `response`
    pub fn new(response: impl Into<String>) -> Self {
        Self::with_responses(vec![response.into()]).cycling()
    }

    /// A provider that answers with `responses` in order, then errors
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: responses.into_iter().map(Into::into).collect(),
            current_index: Arc::new(Mutex::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            model_name: "mock-model".to_string(),
            cycle: false,
            delay: None,
        }
    }

    /// Start over from the first response once the script is exhausted
    pub fn cycling(mut self) -> Self {
        self.cycle = true;
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    /// Sleep before answering, for timeout and cancellation tests
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every transcript received so far
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    fn next_response(&self) -> Result<String> {
        let mut index = self
            .current_index
            .lock()
            .map_err(|_| anyhow!("mock provider state poisoned"))?;
        if self.responses.is_empty() {
            return Err(anyhow!("mock provider has no scripted responses"));
        }
        let slot = if self.cycle {
            *index % self.responses.len()
        } else {
            *index
        };
        let response = self
            .responses
            .get(slot)
            .cloned()
            .ok_or_else(|| anyhow!("mock provider script exhausted after {} calls", *index))?;
        *index += 1;
        Ok(response)
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new("This is a mock response from the test provider.")
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn complete(&self, messages: &[Message], _config: &GenerationConfig) -> Result<ModelResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let raw = self.next_response()?;
        let mut response = ModelResponse::from_raw(&raw, self.model_name.clone());
        let prompt_tokens = messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u32)
            .sum();
        let completion_tokens = raw.split_whitespace().count() as u32;
        response.usage = Some(TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        });
        response.finish_reason = Some("stop".to_string());
        Ok(response)
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: "Mock Provider".to_string(),
            supported_models: vec![self.model_name.clone()],
        }
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }
}
