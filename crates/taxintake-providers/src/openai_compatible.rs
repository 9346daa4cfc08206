//! Chat Completions backend for OpenAI and every API that copies its shape
//! (OpenRouter, Groq, Ollama, vLLM, LM Studio).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use taxintake_core::{Completion, CompletionError, CompletionService};

use crate::DEFAULT_TEMPERATURE;

#[derive(Debug, Clone)]
pub struct OpenAICompatibleClient {
    pub name: String,
    api_key: Option<String>,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    json_mode: bool,
    headers: HashMap<String, String>,
    http_client: reqwest::Client,
}

impl OpenAICompatibleClient {
    pub fn new(
        name: impl Into<String>,
        api_key: Option<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: 1024,
            json_mode: false,
            headers: HashMap::new(),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Ask for `response_format: json_object`. Not every compatible server
    /// honours it, so it stays off unless configured.
    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Per-request HTTP timeout; the engine applies its own on top
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if let Ok(client) = reqwest::Client::builder().timeout(timeout).build() {
            self.http_client = client;
        }
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_request(&self, system_prompt: &str, user_prompt: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
            response_format: self.json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    total_tokens: Option<u32>,
}

#[async_trait]
impl CompletionService for OpenAICompatibleClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, CompletionError> {
        let request = self.build_request(system_prompt, user_prompt);

        let mut builder = self
            .http_client
            .post(self.endpoint())
            .header("Content-Type", "application/json");

        if let Some(api_key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", api_key));
        }

        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }

        let response = builder.json(&request).send().await.map_err(|e| {
            CompletionError::Provider(format!("{}: request failed: {}", self.name, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(CompletionError::Provider(format!(
                "{} API error ({}): {}",
                self.name, status, error_text
            )));
        }

        let completion: ChatCompletionResponse = response.json().await.map_err(|e| {
            CompletionError::Provider(format!("{}: unreadable response: {}", self.name, e))
        })?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(CompletionError::Provider(format!(
                "{} returned an empty completion",
                self.name
            )));
        }

        let tokens = completion
            .usage
            .as_ref()
            .and_then(|u| u.total_tokens)
            .unwrap_or(0);

        Ok(Completion {
            provider: self.name.clone(),
            content,
            tokens,
        })
    }
}
