use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use taxintake_core::{Completion, CompletionError, CompletionService};

use crate::anthropic::AnthropicClient;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics};
use crate::openai_compatible::OpenAICompatibleClient;

pub const CONFIG_ENV: &str = "TAXINTAKE_LLM_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "taxintake_llm.json";

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_OPENROUTER_MODEL: &str = "openai/gpt-4o-mini";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-haiku-latest";

#[derive(Debug, Deserialize)]
pub struct ProviderRouterConfig {
    pub default: Option<String>,
    pub fallbacks: Option<Vec<String>>,
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    #[serde(rename = "openai")]
    OpenAI {
        api_key: Option<String>,
        api_key_env: Option<String>,
        model: Option<String>,
        base_url: Option<String>,
        temperature: Option<f64>,
        max_tokens: Option<u32>,
        json_mode: Option<bool>,
    },
    #[serde(rename = "openrouter")]
    OpenRouter {
        api_key: Option<String>,
        api_key_env: Option<String>,
        model: Option<String>,
        temperature: Option<f64>,
        max_tokens: Option<u32>,
    },
    Anthropic {
        api_key: Option<String>,
        api_key_env: Option<String>,
        model: Option<String>,
        base_url: Option<String>,
        temperature: Option<f64>,
        max_tokens: Option<u32>,
    },
    /// Any server speaking the Chat Completions protocol (Ollama, Groq, vLLM)
    #[serde(rename = "openai_compatible")]
    OpenAICompatible {
        name: Option<String>,
        api_key: Option<String>,
        api_key_env: Option<String>,
        base_url: String,
        model: String,
        temperature: Option<f64>,
        max_tokens: Option<u32>,
        json_mode: Option<bool>,
        headers: Option<HashMap<String, String>>,
    },
}

#[derive(Debug)]
struct ProviderEntry {
    name: String,
    client: Arc<dyn CompletionService>,
    breaker: CircuitBreaker,
}

/// Ordered fallback across completion backends, each behind a circuit breaker
#[derive(Debug)]
pub struct ProviderRouter {
    providers: Vec<ProviderEntry>,
}

impl ProviderRouter {
    /// Config file if one is present, otherwise whatever the environment offers
    pub fn from_env() -> Result<Self> {
        if let Some(config) = Self::load_config_from_file()? {
            return Self::from_config(config);
        }

        Self::from_env_fallback()
    }

    pub fn from_config(config: ProviderRouterConfig) -> Result<Self> {
        let mut clients = Vec::new();
        let mut seen = HashSet::new();

        let mut order = Vec::new();
        if let Some(default) = config.default {
            order.push(default);
        }
        if let Some(fallbacks) = config.fallbacks {
            order.extend(fallbacks);
        }
        if order.is_empty() {
            let mut names: Vec<_> = config.providers.keys().cloned().collect();
            names.sort();
            order.extend(names);
        }

        for name in order {
            if seen.contains(&name) {
                continue;
            }
            let Some(provider) = config.providers.get(&name) else {
                tracing::warn!("Provider '{}' is listed but not configured, skipping", name);
                continue;
            };
            match Self::build_provider(provider) {
                Ok(client) => {
                    clients.push((name.clone(), client));
                    seen.insert(name);
                }
                Err(error) => {
                    tracing::warn!("Provider '{}' unavailable: {:#}", name, error);
                }
            }
        }

        if clients.is_empty() {
            anyhow::bail!("No valid completion providers configured.");
        }

        Ok(Self::from_services(clients))
    }

    /// Route over already-built services, in the given order
    pub fn from_services(services: Vec<(String, Arc<dyn CompletionService>)>) -> Self {
        Self::from_services_with_breaker(services, CircuitBreakerConfig::default())
    }

    pub fn from_services_with_breaker(
        services: Vec<(String, Arc<dyn CompletionService>)>,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        let providers = services
            .into_iter()
            .map(|(name, client)| ProviderEntry {
                breaker: CircuitBreaker::new(name.clone(), breaker.clone()),
                name,
                client,
            })
            .collect();
        Self { providers }
    }

    fn from_env_fallback() -> Result<Self> {
        let mut clients = Vec::new();
        let mut seen = HashSet::new();

        let mut order = Vec::new();
        if let Ok(preferred) = std::env::var("TAXINTAKE_LLM_PROVIDER") {
            order.push(preferred.to_lowercase());
        }
        order.extend(
            ["openai", "openrouter", "anthropic", "openai_compatible"]
                .iter()
                .map(|s| s.to_string()),
        );

        for name in order {
            if seen.contains(&name) {
                continue;
            }
            if let Some(client) = Self::build_provider_from_env(&name) {
                clients.push((name.clone(), client));
                seen.insert(name);
            }
        }

        if clients.is_empty() {
            anyhow::bail!(
                "No completion providers found. Set OPENAI_API_KEY, OPENROUTER_API_KEY, ANTHROPIC_API_KEY, or TAXINTAKE_LLM_BASE_URL + TAXINTAKE_LLM_MODEL."
            );
        }

        Ok(Self::from_services(clients))
    }

    /// Read the JSON config named by `TAXINTAKE_LLM_CONFIG`, or the default
    /// file in the working directory when it exists
    pub fn load_config_from_file() -> Result<Option<ProviderRouterConfig>> {
        let path = match std::env::var(CONFIG_ENV) {
            Ok(path) => PathBuf::from(path),
            Err(_) => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if !path.exists() {
            return Ok(None);
        }

        Self::read_config(&path).map(Some)
    }

    pub fn read_config(path: &Path) -> Result<ProviderRouterConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read provider config at {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid provider config JSON at {:?}", path))
    }

    fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn CompletionService>> {
        let client: Arc<dyn CompletionService> = match config {
            ProviderConfig::OpenAI {
                api_key,
                api_key_env,
                model,
                base_url,
                temperature,
                max_tokens,
                json_mode,
            } => {
                let api_key = resolve_api_key(api_key, api_key_env, "OPENAI_API_KEY")?;
                let mut client = OpenAICompatibleClient::new(
                    "OpenAI",
                    Some(api_key),
                    base_url.clone().unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
                    model.clone().unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
                )
                .with_json_mode(json_mode.unwrap_or(true));
                if let Some(value) = *temperature {
                    client = client.with_temperature(value);
                }
                if let Some(value) = *max_tokens {
                    client = client.with_max_tokens(value);
                }
                Arc::new(client)
            }
            ProviderConfig::OpenRouter {
                api_key,
                api_key_env,
                model,
                temperature,
                max_tokens,
            } => {
                let api_key = resolve_api_key(api_key, api_key_env, "OPENROUTER_API_KEY")?;
                let model = model
                    .clone()
                    .or_else(|| std::env::var("OPENROUTER_MODEL").ok())
                    .unwrap_or_else(|| DEFAULT_OPENROUTER_MODEL.to_string());
                let mut client = OpenAICompatibleClient::new(
                    "OpenRouter",
                    Some(api_key),
                    OPENROUTER_BASE_URL,
                    model.trim().trim_matches('"'),
                )
                .with_header("X-Title", "taxintake");
                if let Some(value) = *temperature {
                    client = client.with_temperature(value);
                }
                if let Some(value) = *max_tokens {
                    client = client.with_max_tokens(value);
                }
                Arc::new(client)
            }
            ProviderConfig::Anthropic {
                api_key,
                api_key_env,
                model,
                base_url,
                temperature,
                max_tokens,
            } => {
                let api_key = resolve_api_key(api_key, api_key_env, "ANTHROPIC_API_KEY")?;
                let mut client = AnthropicClient::new(
                    api_key,
                    model.clone().unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
                );
                if let Some(url) = base_url {
                    client = client.with_base_url(url.clone());
                }
                if let Some(value) = *temperature {
                    client = client.with_temperature(value);
                }
                if let Some(value) = *max_tokens {
                    client = client.with_max_tokens(value);
                }
                Arc::new(client)
            }
            ProviderConfig::OpenAICompatible {
                name,
                api_key,
                api_key_env,
                base_url,
                model,
                temperature,
                max_tokens,
                json_mode,
                headers,
            } => {
                let api_key =
                    resolve_api_key_optional(api_key, api_key_env, "TAXINTAKE_LLM_API_KEY");
                let display_name = name
                    .clone()
                    .unwrap_or_else(|| "OpenAI-Compatible".to_string());
                let mut client =
                    OpenAICompatibleClient::new(display_name, api_key, base_url.clone(), model.clone())
                        .with_json_mode(json_mode.unwrap_or(false));
                if let Some(value) = *temperature {
                    client = client.with_temperature(value);
                }
                if let Some(value) = *max_tokens {
                    client = client.with_max_tokens(value);
                }
                if let Some(extra_headers) = headers {
                    for (key, value) in extra_headers {
                        client = client.with_header(key.clone(), value.clone());
                    }
                }
                Arc::new(client)
            }
        };

        Ok(client)
    }

    fn build_provider_from_env(name: &str) -> Option<Arc<dyn CompletionService>> {
        match name {
            "openai" => {
                let api_key = std::env::var("OPENAI_API_KEY").ok()?;
                let model = std::env::var("OPENAI_MODEL")
                    .unwrap_or_else(|_| DEFAULT_OPENAI_MODEL.to_string());
                let base_url = std::env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| OPENAI_BASE_URL.to_string());
                Some(Arc::new(
                    OpenAICompatibleClient::new("OpenAI", Some(api_key), base_url, model)
                        .with_json_mode(true),
                ))
            }
            "openrouter" => {
                let api_key = std::env::var("OPENROUTER_API_KEY").ok()?;
                let model = std::env::var("OPENROUTER_MODEL")
                    .unwrap_or_else(|_| DEFAULT_OPENROUTER_MODEL.to_string());
                Some(Arc::new(
                    OpenAICompatibleClient::new("OpenRouter", Some(api_key), OPENROUTER_BASE_URL, model)
                        .with_header("X-Title", "taxintake"),
                ))
            }
            "anthropic" => {
                let api_key = std::env::var("ANTHROPIC_API_KEY").ok()?;
                let model = std::env::var("ANTHROPIC_MODEL")
                    .unwrap_or_else(|_| DEFAULT_ANTHROPIC_MODEL.to_string());
                Some(Arc::new(AnthropicClient::new(api_key, model)))
            }
            "openai_compatible" => {
                let base_url = std::env::var("TAXINTAKE_LLM_BASE_URL").ok()?;
                let model = std::env::var("TAXINTAKE_LLM_MODEL").ok()?;
                let name = std::env::var("TAXINTAKE_LLM_NAME")
                    .unwrap_or_else(|_| "OpenAI-Compatible".to_string());
                let api_key = std::env::var("TAXINTAKE_LLM_API_KEY").ok();
                Some(Arc::new(OpenAICompatibleClient::new(
                    name, api_key, base_url, model,
                )))
            }
            _ => None,
        }
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name.as_str()).collect()
    }

    pub async fn breaker_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let mut metrics = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            metrics.push(provider.breaker.metrics().await);
        }
        metrics
    }
}

fn resolve_api_key(
    explicit: &Option<String>,
    env_hint: &Option<String>,
    default_env: &str,
) -> Result<String> {
    resolve_api_key_optional(explicit, env_hint, default_env)
        .with_context(|| format!("Missing required API key env var {}", default_env))
}

fn resolve_api_key_optional(
    explicit: &Option<String>,
    env_hint: &Option<String>,
    default_env: &str,
) -> Option<String> {
    if let Some(value) = explicit.clone() {
        return Some(value);
    }
    if let Some(env_name) = env_hint {
        if let Ok(value) = std::env::var(env_name) {
            return Some(value);
        }
    }
    std::env::var(default_env).ok()
}

#[async_trait]
impl CompletionService for ProviderRouter {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, CompletionError> {
        let mut errors = Vec::new();
        let mut all_open = true;

        for provider in &self.providers {
            if let Err(err) = provider.breaker.can_execute().await {
                tracing::debug!("Skipping {}: {}", provider.name, err);
                errors.push(format!("{}: {}", provider.name, err));
                continue;
            }
            all_open = false;

            match provider.client.complete(system_prompt, user_prompt).await {
                Ok(completion) => {
                    provider.breaker.record_success().await;
                    return Ok(completion);
                }
                Err(err) => {
                    tracing::warn!("Provider {} failed: {}", provider.name, err);
                    provider.breaker.record_failure().await;
                    errors.push(format!("{}: {}", provider.name, err));
                }
            }
        }

        if all_open && !self.providers.is_empty() {
            return Err(CompletionError::CircuitOpen(
                self.provider_names().join(", "),
            ));
        }

        Err(CompletionError::Provider(format!(
            "All completion providers failed:\n{}",
            errors.join("\n")
        )))
    }
}
