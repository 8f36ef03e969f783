pub mod providers;
pub mod retry;
pub mod streaming;

use cryptoflow_core::config::AppConfig;
use cryptoflow_core::config::ModelConfig;
use cryptoflow_core::error::{CryptoflowError, Result};
use cryptoflow_core::traits::LlmClient;

pub use providers::{AnthropicClient, GeminiClient, OpenAiClient};
pub use retry::RetryingClient;

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Ok(Box::new(AnthropicClient::new())),
        "gemini" | "google" => Ok(Box::new(GeminiClient::new())),
        // OpenAI-compatible servers share one wire format
        "openai" | "ollama" | "groq" | "openrouter" | "vllm" | "lmstudio" => {
            Ok(Box::new(OpenAiClient::new()))
        }
        other => Err(CryptoflowError::UnsupportedProvider(other.to_string())),
    }
}

/// Primary client wrapped with retries and the configured fallback models.
pub fn build_client(config: &AppConfig) -> Result<Box<dyn LlmClient>> {
    let primary = create_client(&config.model)?;
    let fallbacks = config
        .fallback_models
        .iter()
        .map(|fb| Ok((fb.clone(), create_client(fb)?)))
        .collect::<Result<Vec<_>>>()?;

    let retry = config.model.retry.clone().unwrap_or_default();
    Ok(Box::new(RetryingClient::new(primary, fallbacks, retry)))
}
