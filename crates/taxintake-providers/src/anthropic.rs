//! Anthropic Messages API backend

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use taxintake_core::{Completion, CompletionError, CompletionService};

use crate::DEFAULT_TEMPERATURE;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    pub name: String,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    http_client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: "Anthropic".to_string(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: 1024,
            http_client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if let Ok(client) = reqwest::Client::builder().timeout(timeout).build() {
            self.http_client = client;
        }
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn build_body(&self, system_prompt: &str, user_prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "system": system_prompt,
            "messages": [
                { "role": "user", "content": user_prompt }
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

impl MessagesResponse {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.block_type == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[async_trait]
impl CompletionService for AnthropicClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, CompletionError> {
        let response = self
            .http_client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&self.build_body(system_prompt, user_prompt))
            .send()
            .await
            .map_err(|e| CompletionError::Provider(format!("{}: request failed: {}", self.name, e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(CompletionError::Provider(format!(
                "{} API error ({}): {}",
                self.name, status, error_text
            )));
        }

        let parsed: MessagesResponse = response.json().await.map_err(|e| {
            CompletionError::Provider(format!("{}: unreadable response: {}", self.name, e))
        })?;

        let content = parsed.text();
        if content.trim().is_empty() {
            return Err(CompletionError::Provider(format!(
                "{} returned no text content",
                self.name
            )));
        }

        let tokens = parsed
            .usage
            .map(|u| u.input_tokens + u.output_tokens)
            .unwrap_or(0);

        Ok(Completion {
            provider: self.name.clone(),
            content,
            tokens,
        })
    }
}
