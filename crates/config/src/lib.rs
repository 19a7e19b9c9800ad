//! Environment-driven configuration for the Shrimp core.
//!
//! Shrimp's external surface is defined purely through environment
//! variables — there is no on-disk config file to load or save.
//! `AppConfig::load()` reads the
//! process environment once; call `dotenvy::dotenv().ok()` before it in a
//! binary's `main` if a local `.env` should be picked up.

use std::env;

use serde::{Deserialize, Serialize};

/// LLM provider connectivity — `OPENAI_API_KEY`, `OPENAI_BASE_URL`,
/// `OPENAI_MODEL`, `OPENAI_ALLOWED_MODELS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Required only once an LLM call is actually attempted, not at load time.
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: String,
    pub allowed_models: Vec<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            default_model: "gpt-4.1-mini".to_string(),
            allowed_models: vec!["gpt-4.1-mini".to_string()],
        }
    }
}

/// Shell session pool tunables — `SHRIMP_MAX_SESSIONS`,
/// `SHRIMP_COMMAND_TIMEOUT_MS`, `SHRIMP_MAX_OUTPUT_CHARS`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShellConfig {
    pub max_sessions: usize,
    pub command_timeout_ms: u64,
    pub max_output_chars: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            max_sessions: 8,
            command_timeout_ms: 30_000,
            max_output_chars: 20_000,
        }
    }
}

impl ShellConfig {
    /// Retained-tail cap per stream: `2 × max_output_chars`, floored at 2,000
    /// chars.
    pub fn retained_tail_cap(&self) -> usize {
        (self.max_output_chars * 2).max(2_000)
    }
}

/// Storage surface — `SHRIMP_DB_PATH`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "data/shrimp.db".to_string(),
        }
    }
}

/// Logging surface — `RUST_LOG` is read directly by `tracing_subscriber`'s
/// `EnvFilter`; `SHRIMP_LOG_DIR` additionally mirrors to a rolling file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub shell: ShellConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
    pub telegram: TelegramConfig,
}

impl AppConfig {
    /// Read configuration from the process environment. Never fails — every
    /// field has a sane default; `api_key`/`bot_token` being absent is only
    /// surfaced as an error at the point a network call actually needs them.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Ok(v) = env::var("OPENAI_API_KEY") {
            if !v.is_empty() {
                config.llm.api_key = Some(v);
            }
        }
        if let Ok(v) = env::var("OPENAI_BASE_URL") {
            if !v.is_empty() {
                config.llm.base_url = Some(v);
            }
        }
        if let Ok(v) = env::var("OPENAI_MODEL") {
            if !v.is_empty() {
                config.llm.default_model = v;
            }
        }
        if let Ok(v) = env::var("OPENAI_ALLOWED_MODELS") {
            let models: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !models.is_empty() {
                config.llm.allowed_models = models;
            }
        }
        // The default model is always allowed even if the operator forgot to
        // list it explicitly — otherwise every unconfigured deployment would
        // reject its own default.
        if !config
            .llm
            .allowed_models
            .iter()
            .any(|m| m == &config.llm.default_model)
        {
            config.llm.allowed_models.push(config.llm.default_model.clone());
        }

        if let Ok(v) = env::var("SHRIMP_DB_PATH") {
            if !v.is_empty() {
                config.storage.db_path = v;
            }
        }
        if let Ok(v) = env::var("SHRIMP_MAX_SESSIONS") {
            if let Ok(n) = v.parse() {
                config.shell.max_sessions = n;
            }
        }
        if let Ok(v) = env::var("SHRIMP_COMMAND_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                config.shell.command_timeout_ms = n;
            }
        }
        if let Ok(v) = env::var("SHRIMP_MAX_OUTPUT_CHARS") {
            if let Ok(n) = v.parse() {
                config.shell.max_output_chars = n;
            }
        }
        if let Ok(v) = env::var("SHRIMP_LOG_DIR") {
            if !v.is_empty() {
                config.telemetry.log_dir = Some(v);
            }
        }
        if let Ok(v) = env::var("TELEGRAM_BOT_TOKEN") {
            if !v.is_empty() {
                config.telegram.bot_token = Some(v);
            }
        }

        config
    }

    /// Resolve the effective model for a turn request: the requested model if
    /// it is in the allow-list, otherwise the configured default.
    pub fn resolve_model(&self, requested: Option<&str>) -> String {
        match requested {
            Some(m) if self.llm.allowed_models.iter().any(|a| a == m) => m.to_string(),
            _ => self.llm.default_model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "OPENAI_API_KEY",
            "OPENAI_BASE_URL",
            "OPENAI_MODEL",
            "OPENAI_ALLOWED_MODELS",
            "SHRIMP_DB_PATH",
            "SHRIMP_MAX_SESSIONS",
            "SHRIMP_COMMAND_TIMEOUT_MS",
            "SHRIMP_MAX_OUTPUT_CHARS",
            "SHRIMP_LOG_DIR",
            "TELEGRAM_BOT_TOKEN",
        ] {
            unsafe { env::remove_var(key) };
        }
    }

    #[test]
    #[serial]
    fn defaults_when_unset() {
        clear_env();
        let config = AppConfig::load();
        assert_eq!(config.llm.default_model, "gpt-4.1-mini");
        assert_eq!(config.shell.max_sessions, 8);
        assert_eq!(config.shell.command_timeout_ms, 30_000);
        assert!(config.llm.api_key.is_none());
    }

    #[test]
    #[serial]
    fn resolve_model_falls_back_to_default_for_unknown() {
        clear_env();
        unsafe { env::set_var("OPENAI_ALLOWED_MODELS", "gpt-4.1-mini,gpt-4o") };
        let config = AppConfig::load();
        assert_eq!(config.resolve_model(Some("gpt-4o")), "gpt-4o");
        assert_eq!(config.resolve_model(Some("not-a-model")), "gpt-4.1-mini");
        assert_eq!(config.resolve_model(None), "gpt-4.1-mini");
        clear_env();
    }

    #[test]
    fn retained_tail_cap_floors_at_2000() {
        let mut shell = ShellConfig::default();
        shell.max_output_chars = 100;
        assert_eq!(shell.retained_tail_cap(), 2_000);
        shell.max_output_chars = 20_000;
        assert_eq!(shell.retained_tail_cap(), 40_000);
    }
}
