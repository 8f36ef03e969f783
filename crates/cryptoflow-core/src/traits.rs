use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// Streaming chat client for one provider.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// A named capability with a declared argument schema.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in `Action:` lines).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with already validated arguments.
    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }

    /// Whether invoking the tool has effects outside the process (messages sent, orders placed).
    fn has_side_effects(&self) -> bool {
        false
    }
}

/// Text collected from one model call.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub stop_reason: Option<StopReason>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Drive a model stream to completion.
///
/// `on_delta` sees every text chunk as it arrives; callers that do not stream
/// output pass a no-op.
pub async fn generate(
    llm: &dyn LlmClient,
    config: &ModelConfig,
    messages: Vec<ChatMessage>,
    mut on_delta: impl FnMut(&str),
) -> Result<Generation> {
    let mut stream = llm.chat_stream(config, messages).await?;
    let mut out = Generation::default();

    while let Some(delta) = stream.next().await {
        match delta? {
            StreamDelta::TextDelta(text) => {
                on_delta(&text);
                out.text.push_str(&text);
            }
            StreamDelta::Stop(reason) => out.stop_reason = Some(reason),
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => {
                out.input_tokens += input_tokens;
                out.output_tokens += output_tokens;
            }
        }
    }

    Ok(out)
}
