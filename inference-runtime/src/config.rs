//! Configuration for the inference runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File, Source};
use serde::Deserialize;

use crate::engine::ModelKind;

/// Largest pool a single model may request.
pub const MAX_CONTEXTS: usize = 10;

/// Main configuration structure for the runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Text and vision model, if one is configured.
    #[serde(default)]
    pub language: Option<ModelConfig>,
    /// Image generation model, if one is configured.
    #[serde(default)]
    pub image: Option<ModelConfig>,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One model served by one context pool.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Path to the model file. Relative paths resolve against `models_dir`.
    pub model_path: String,
    #[serde(default)]
    pub models_dir: Option<String>,
    #[serde(default)]
    pub kind: ModelKind,
    /// Pool capacity: how many native calls may run at once.
    #[serde(default = "default_num_contexts", alias = "max_concurrent")]
    pub num_contexts: usize,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,
    /// Defaults depend on `kind` when unset.
    #[serde(default)]
    pub generation_timeout_seconds: Option<u64>,
    /// How long closing the pool waits for in-flight calls.
    #[serde(default = "default_close_grace")]
    pub close_grace_seconds: u64,
    #[serde(default = "default_true")]
    pub startup_self_test_enabled: bool,
    #[serde(default = "default_self_test_timeout")]
    pub startup_self_test_timeout: u64,
    /// Expected SHA-256 of the model file, hex encoded. Checked on load.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl ModelConfig {
    /// Config for `model_path` with every other field at its default.
    pub fn new(model_path: impl Into<String>, kind: ModelKind) -> Self {
        Self {
            model_path: model_path.into(),
            models_dir: None,
            kind,
            num_contexts: default_num_contexts(),
            acquire_timeout_seconds: default_acquire_timeout(),
            generation_timeout_seconds: None,
            close_grace_seconds: default_close_grace(),
            startup_self_test_enabled: true,
            startup_self_test_timeout: default_self_test_timeout(),
            sha256: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.model_path.trim().is_empty() {
            return Err("model_path must not be empty".to_string());
        }
        if self.num_contexts < 1 || self.num_contexts > MAX_CONTEXTS {
            return Err(format!(
                "num_contexts must be between 1 and {}, got {}",
                MAX_CONTEXTS, self.num_contexts
            ));
        }
        if self.acquire_timeout_seconds < 1 {
            return Err("acquire_timeout_seconds must be at least 1".to_string());
        }
        if self.generation_timeout_seconds == Some(0) {
            return Err("generation_timeout_seconds must be at least 1".to_string());
        }
        if self.startup_self_test_enabled && self.startup_self_test_timeout < 1 {
            return Err("startup_self_test_timeout must be at least 1".to_string());
        }
        if let Some(ref digest) = self.sha256 {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err("sha256 must be 64 hex characters".to_string());
            }
        }
        Ok(())
    }

    /// Model path with `models_dir` applied to relative paths.
    pub fn resolved_model_path(&self) -> PathBuf {
        let path = Path::new(&self.model_path);
        match &self.models_dir {
            Some(dir) if path.is_relative() => Path::new(dir).join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn generation_timeout(&self) -> Duration {
        let secs = self.generation_timeout_seconds.unwrap_or(match self.kind {
            ModelKind::Language => default_text_generation_timeout(),
            ModelKind::Diffusion => default_image_generation_timeout(),
        });
        Duration::from_secs(secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_seconds)
    }

    pub fn self_test_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_self_test_timeout)
    }
}

/// Retry and escalation policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Consecutive retryable failures that trigger a context reset. 0 disables.
    #[serde(default = "default_context_reset_threshold")]
    pub context_reset_threshold: u32,
    /// Context resets without a success that trigger a model reload. 0 disables.
    #[serde(default = "default_model_reload_threshold")]
    pub model_reload_threshold: u32,
    /// Reject requests after recovery runs out instead of retrying forever.
    #[serde(default = "default_true")]
    pub degraded_mode_enabled: bool,
    /// Reloads without a success after which a request that still fails
    /// puts the manager in degraded mode. 0 disables.
    #[serde(default = "default_max_model_reloads")]
    pub max_model_reloads: u32,
    /// How often the background task tries to leave degraded mode.
    #[serde(default = "default_degraded_recovery_interval")]
    pub degraded_recovery_interval_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            context_reset_threshold: default_context_reset_threshold(),
            model_reload_threshold: default_model_reload_threshold(),
            degraded_mode_enabled: true,
            max_model_reloads: default_max_model_reloads(),
            degraded_recovery_interval_secs: default_degraded_recovery_interval(),
        }
    }
}

impl RecoveryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn degraded_recovery_interval(&self) -> Duration {
        Duration::from_secs(self.degraded_recovery_interval_secs.max(1))
    }
}

/// Thresholds for the health snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Failure rate at or above which the engine is not healthy.
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,
    /// Requests needed before the failure rate counts.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
    /// Free GPU memory below this is reported as an issue.
    #[serde(default = "default_min_free_vram")]
    pub min_free_vram_bytes: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_failure_rate: default_max_failure_rate(),
            min_samples: default_min_samples(),
            min_free_vram_bytes: default_min_free_vram(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_num_contexts() -> usize {
    2
}
fn default_acquire_timeout() -> u64 {
    30
}
fn default_text_generation_timeout() -> u64 {
    60
}
fn default_image_generation_timeout() -> u64 {
    120
}
fn default_close_grace() -> u64 {
    5
}
fn default_true() -> bool {
    true
}
fn default_self_test_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_context_reset_threshold() -> u32 {
    3
}
fn default_model_reload_threshold() -> u32 {
    2
}
fn default_max_model_reloads() -> u32 {
    2
}
fn default_degraded_recovery_interval() -> u64 {
    60
}
fn default_max_failure_rate() -> f64 {
    0.1
}
fn default_min_samples() -> u64 {
    10
}
fn default_min_free_vram() -> u64 {
    1024 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (RUNTIME__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(File::with_name("config").required(false))
    }

    /// Like [`Config::load`], reading an explicit file instead of `config.toml`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with(File::from(path).required(true))
    }

    fn load_with<S>(file: S) -> Result<Self, ConfigError>
    where
        S: Source + Send + Sync + 'static,
    {
        let config = ConfigLoader::builder()
            // Set defaults
            .set_default("logging.level", default_log_level())?
            .set_default("recovery.max_retries", default_max_retries() as i64)?
            // Load from file
            .add_source(file)
            // Override with environment variables (RUNTIME__SECTION__KEY format)
            .add_source(
                Environment::with_prefix("RUNTIME")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        for (section, model) in config.models() {
            model
                .validate()
                .map_err(|e| ConfigError::Message(format!("[{}] {}", section, e)))?;
        }
        Ok(config)
    }

    /// Configured models with their section names.
    pub fn models(&self) -> Vec<(&'static str, &ModelConfig)> {
        let mut models = Vec::new();
        if let Some(ref language) = self.language {
            models.push(("language", language));
        }
        if let Some(ref image) = self.image {
            models.push(("image", image));
        }
        models
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn parse(toml: &str) -> Result<Config, ConfigError> {
        Config::load_with(File::from_str(toml, FileFormat::Toml))
    }

    #[test]
    fn test_default_recovery_config() {
        let recovery = RecoveryConfig::default();
        assert_eq!(recovery.max_retries, 3);
        assert_eq!(recovery.initial_backoff(), Duration::from_millis(500));
        assert_eq!(recovery.max_backoff(), Duration::from_secs(10));
        assert_eq!(recovery.backoff_multiplier, 2.0);
        assert_eq!(recovery.context_reset_threshold, 3);
        assert_eq!(recovery.model_reload_threshold, 2);
        assert!(recovery.degraded_mode_enabled);
        assert_eq!(recovery.max_model_reloads, 2);
        assert_eq!(recovery.degraded_recovery_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_default_health_config() {
        let health = HealthConfig::default();
        assert_eq!(health.max_failure_rate, 0.1);
        assert_eq!(health.min_samples, 10);
        assert_eq!(health.min_free_vram_bytes, 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_model_sections() {
        let config = parse(
            r#"
            [language]
            model_path = "qwen2-vl-7b.gguf"
            models_dir = "/models"
            num_contexts = 3

            [image]
            model_path = "/models/sd-turbo.safetensors"
            kind = "diffusion"
            max_concurrent = 1
            startup_self_test_enabled = false

            [recovery]
            max_retries = 5
            "#,
        )
        .unwrap();

        let language = config.language.as_ref().unwrap();
        assert_eq!(language.num_contexts, 3);
        assert_eq!(language.kind, ModelKind::Language);
        assert_eq!(
            language.resolved_model_path(),
            PathBuf::from("/models/qwen2-vl-7b.gguf")
        );
        assert_eq!(language.generation_timeout(), Duration::from_secs(60));
        assert!(language.startup_self_test_enabled);

        let image = config.image.as_ref().unwrap();
        assert_eq!(image.num_contexts, 1);
        assert_eq!(image.generation_timeout(), Duration::from_secs(120));
        assert!(!image.startup_self_test_enabled);

        assert_eq!(config.recovery.max_retries, 5);
        assert_eq!(config.recovery.context_reset_threshold, 3);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.models().len(), 2);
    }

    #[test]
    fn test_empty_config_has_no_models() {
        let config = parse("").unwrap();
        assert!(config.models().is_empty());
        assert_eq!(config.recovery.max_retries, 3);
    }

    #[test]
    fn test_invalid_capacity_rejected() {
        let result = parse(
            r#"
            [language]
            model_path = "model.gguf"
            num_contexts = 11
            "#,
        );
        match result {
            Err(e) => assert!(e.to_string().contains("num_contexts")),
            Ok(_) => panic!("Expected validation error"),
        }
    }

    #[test]
    fn test_absolute_path_ignores_models_dir() {
        let mut model = ModelConfig::new("/srv/model.gguf", ModelKind::Language);
        model.models_dir = Some("/models".to_string());
        assert_eq!(model.resolved_model_path(), PathBuf::from("/srv/model.gguf"));
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut model = ModelConfig::new("model.gguf", ModelKind::Language);
        assert!(model.validate().is_ok());
        model.acquire_timeout_seconds = 0;
        assert!(model.validate().is_err());

        let mut model = ModelConfig::new("model.gguf", ModelKind::Language);
        model.generation_timeout_seconds = Some(0);
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_validate_checks_sha256_shape() {
        let mut model = ModelConfig::new("model.gguf", ModelKind::Language);
        model.sha256 = Some("abc123".to_string());
        assert!(model.validate().is_err());

        model.sha256 = Some("A".repeat(64));
        assert!(model.validate().is_ok());

        model.sha256 = Some("g".repeat(64));
        assert!(model.validate().is_err());
    }
}
