use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CryptoflowError, Result};

/// Top-level cryptoflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Reasoning loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Observations longer than this are truncated before going back to the model.
    #[serde(default = "default_max_observation_chars")]
    pub max_observation_chars: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tool_timeout_secs: default_tool_timeout(),
            max_observation_chars: default_max_observation_chars(),
            system_prompt: None,
        }
    }
}

fn default_max_iterations() -> usize { 10 }
fn default_tool_timeout() -> u64 { 30 }
fn default_max_observation_chars() -> usize { 4_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Forward text chunks to subscribers as they arrive.
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            streaming: false,
            extra_headers: HashMap::new(),
            retry: None,
        }
    }
}

impl ModelConfig {
    /// Same model, different sampling temperature.
    pub fn with_temperature(&self, temperature: f32) -> Self {
        Self {
            temperature,
            ..self.clone()
        }
    }
}

fn default_provider() -> String { "gemini".to_string() }
fn default_model_id() -> String { "gemini-2.5-flash".to_string() }
fn default_max_tokens() -> u32 { 2000 }
fn default_temperature() -> f32 { 0.7 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Market analysis workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// How many times a node may run again within one run (0 = never).
    #[serde(default)]
    pub max_revisits: usize,
    #[serde(default = "default_notification_channel")]
    pub notification_channel: String,
    #[serde(default = "default_decision_temperature")]
    pub decision_temperature: f32,
    #[serde(default = "default_news_limit")]
    pub news_limit: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_revisits: 0,
            notification_channel: default_notification_channel(),
            decision_temperature: default_decision_temperature(),
            news_limit: default_news_limit(),
        }
    }
}

fn default_notification_channel() -> String { "console".to_string() }
fn default_decision_temperature() -> f32 { 0.3 }
fn default_news_limit() -> u64 { 5 }

/// Credentials and endpoints for the built-in tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub coingecko_api_key: Option<String>,
    #[serde(default)]
    pub tavily_api_key: Option<String>,
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
    #[serde(default)]
    pub discord_webhook_url: Option<String>,
    /// File the `log` notification channel appends to.
    #[serde(default)]
    pub notification_log: Option<String>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CryptoflowError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse TOML text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| CryptoflowError::Config(e.to_string()))
    }

    /// Load the file if it exists, otherwise start from defaults.
    /// Environment overrides are applied in both cases.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            debug!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Fill unset values from the environment.
    ///
    /// `CRYPTOFLOW_PROVIDER` and `CRYPTOFLOW_MODEL` always win; credentials are
    /// only taken from the environment when the file left them empty.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(provider) = env("CRYPTOFLOW_PROVIDER") {
            self.model.provider = provider;
        }
        if let Some(model) = env("CRYPTOFLOW_MODEL") {
            self.model.model_id = model;
        }
        if self.model.api_key.is_none() {
            let var = match self.model.provider.as_str() {
                "anthropic" | "claude" => "ANTHROPIC_API_KEY",
                "gemini" | "google" => "GEMINI_API_KEY",
                _ => "OPENAI_API_KEY",
            };
            self.model.api_key = env(var);
        }

        let tools = &mut self.tools;
        fill(&mut tools.coingecko_api_key, env("COINGECKO_API_KEY"));
        fill(&mut tools.tavily_api_key, env("TAVILY_API_KEY"));
        fill(&mut tools.slack_webhook_url, env("SLACK_WEBHOOK_URL"));
        fill(&mut tools.discord_webhook_url, env("DISCORD_WEBHOOK_URL"));
    }

    /// Copy safe to print: API keys, webhook URLs and header values are masked.
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        for model in std::iter::once(&mut out.model).chain(out.fallback_models.iter_mut()) {
            mask(&mut model.api_key);
            for value in model.extra_headers.values_mut() {
                *value = REDACTED.to_string();
            }
        }
        let tools = &mut out.tools;
        mask(&mut tools.coingecko_api_key);
        mask(&mut tools.tavily_api_key);
        mask(&mut tools.slack_webhook_url);
        mask(&mut tools.discord_webhook_url);
        out
    }
}

const REDACTED: &str = "***";

fn mask(slot: &mut Option<String>) {
    if slot.is_some() {
        *slot = Some(REDACTED.to_string());
    }
}

fn fill(slot: &mut Option<String>, value: Option<String>) {
    if slot.is_none() {
        *slot = value.filter(|v| !v.is_empty());
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
