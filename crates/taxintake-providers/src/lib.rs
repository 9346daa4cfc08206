//! Completion service backends for the tax intake engine
//!
//! Every backend implements [`taxintake_core::CompletionService`]. The
//! [`ProviderRouter`] chains them with ordered fallback and a circuit breaker
//! per provider, and is what the CLI hands to the engine.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations)]

pub mod anthropic;
pub mod circuit_breaker;
pub mod openai_compatible;
pub mod router;

pub use anthropic::AnthropicClient;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use openai_compatible::OpenAICompatibleClient;
pub use router::{ProviderConfig, ProviderRouter, ProviderRouterConfig};

/// Sampling temperature unless a provider config overrides it
pub const DEFAULT_TEMPERATURE: f64 = 0.1;
