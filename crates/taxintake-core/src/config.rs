//! Engine configuration
//!
//! Thresholds are product tuning, so they live here instead of in control flow.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{IntakeError, Result};

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of recent messages passed to the completion service
    pub history_window: usize,

    /// Questions that must be asked before delegated skipping engages
    pub min_questions_before_skipping: usize,

    /// Phase transition thresholds
    pub thresholds: TransitionThresholds,

    /// Completion call resilience
    pub completion: CompletionSettings,

    /// Delegated behaviours that call the completion service
    pub features: FeatureFlags,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_window: 10,
            min_questions_before_skipping: 5,
            thresholds: TransitionThresholds::default(),
            completion: CompletionSettings::default(),
            features: FeatureFlags::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tag and message thresholds
    pub fn with_thresholds(mut self, min_tags: usize, min_messages: usize) -> Self {
        self.thresholds.min_tags = min_tags;
        self.thresholds.min_messages = min_messages;
        self
    }

    /// Set the hard message cap
    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.thresholds.max_messages = max;
        self
    }

    pub fn with_features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    pub fn with_completion(mut self, completion: CompletionSettings) -> Self {
        self.completion = completion;
        self
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        if t.max_messages == 0 {
            return Err(IntakeError::InvalidConfig(
                "max_messages must be greater than zero".to_string(),
            ));
        }
        if t.min_messages > t.max_messages {
            return Err(IntakeError::InvalidConfig(format!(
                "min_messages ({}) exceeds max_messages ({})",
                t.min_messages, t.max_messages
            )));
        }
        if self.completion.max_retries == 0 {
            return Err(IntakeError::InvalidConfig(
                "completion.max_retries must be at least 1".to_string(),
            ));
        }
        if self.completion.timeout_secs == 0 {
            return Err(IntakeError::InvalidConfig(
                "completion.timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML or JSON file, chosen by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = if is_toml(path) {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_toml(path) {
            toml::to_string_pretty(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `TAXINTAKE_*` environment overrides
    pub fn apply_env(mut self) -> Result<Self> {
        if let Some(v) = env_number("TAXINTAKE_MIN_TAGS")? {
            self.thresholds.min_tags = v;
        }
        if let Some(v) = env_number("TAXINTAKE_MIN_MESSAGES")? {
            self.thresholds.min_messages = v;
        }
        if let Some(v) = env_number("TAXINTAKE_MAX_MESSAGES")? {
            self.thresholds.max_messages = v;
        }
        if let Some(v) = env_number("TAXINTAKE_TIMEOUT_SECS")? {
            self.completion.timeout_secs = v as u64;
        }
        if let Some(v) = env_number("TAXINTAKE_MAX_RETRIES")? {
            self.completion.max_retries = v as u32;
        }
        self.validate()?;
        Ok(self)
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("toml")
}

fn env_number(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| IntakeError::InvalidConfig(format!("{key} is not a number: {raw}"))),
        Err(_) => Ok(None),
    }
}

/// Gates for leaving the intake phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionThresholds {
    /// Minimum assigned tags for a sufficiency transition
    pub min_tags: usize,

    /// Minimum conversation length (messages) for a sufficiency transition
    pub min_messages: usize,

    /// Hard cap on conversation length; forces a transition
    pub max_messages: usize,
}

impl Default for TransitionThresholds {
    fn default() -> Self {
        Self {
            min_tags: 6,
            min_messages: 24,
            max_messages: 80,
        }
    }
}

/// Retry and timeout settings for completion calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionSettings {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            timeout_secs: 30,
        }
    }
}

impl CompletionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Backoff before retry number `attempt` (1-based), doubling and capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

/// Toggles for behaviours delegated to the completion service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub delegated_tag_assignment: bool,
    pub delegated_selection: bool,
    pub delegated_skipping: bool,
    pub broad_extraction: bool,
    pub correction_handling: bool,
    pub narrative_synthesis: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            delegated_tag_assignment: true,
            delegated_selection: false,
            delegated_skipping: true,
            broad_extraction: true,
            correction_handling: true,
            narrative_synthesis: true,
        }
    }
}

impl FeatureFlags {
    /// Every delegated behaviour off; the engine runs on rules alone
    pub fn offline() -> Self {
        Self {
            delegated_tag_assignment: false,
            delegated_selection: false,
            delegated_skipping: false,
            broad_extraction: false,
            correction_handling: false,
            narrative_synthesis: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.thresholds.min_tags, 6);
        assert_eq!(config.thresholds.min_messages, 24);
        assert!(config.thresholds.max_messages > config.thresholds.min_messages);
        assert_eq!(config.history_window, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_thresholds(2, 4)
            .with_max_messages(12)
            .with_features(FeatureFlags::offline());

        assert_eq!(config.thresholds.min_tags, 2);
        assert_eq!(config.thresholds.min_messages, 4);
        assert_eq!(config.thresholds.max_messages, 12);
        assert!(!config.features.broad_extraction);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let config = EngineConfig::new().with_thresholds(1, 50).with_max_messages(10);
        assert!(matches!(config.validate(), Err(IntakeError::InvalidConfig(_))));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let settings = CompletionSettings {
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            ..Default::default()
        };
        assert_eq!(settings.backoff(1), Duration::from_millis(100));
        assert_eq!(settings.backoff(2), Duration::from_millis(200));
        assert_eq!(settings.backoff(3), Duration::from_millis(350));
        assert_eq!(settings.backoff(30), Duration::from_millis(350));
    }

    #[test]
    fn test_file_round_trip_toml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new().with_thresholds(3, 10);

        let toml_path = dir.path().join("engine.toml");
        config.to_file(&toml_path).unwrap();
        let loaded = EngineConfig::from_file(&toml_path).unwrap();
        assert_eq!(loaded.thresholds.min_tags, 3);

        let json_path = dir.path().join("engine.json");
        config.to_file(&json_path).unwrap();
        let loaded = EngineConfig::from_file(&json_path).unwrap();
        assert_eq!(loaded.thresholds.min_messages, 10);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[thresholds]\nmin_tags = 2\n").unwrap();

        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.thresholds.min_tags, 2);
        assert_eq!(loaded.thresholds.min_messages, 24);
        assert!(loaded.features.broad_extraction);
    }
}
