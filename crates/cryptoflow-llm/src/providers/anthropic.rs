use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cryptoflow_core::config::ModelConfig;
use cryptoflow_core::error::{CryptoflowError, Result};
use cryptoflow_core::traits::LlmClient;
use cryptoflow_core::types::*;

use super::openai::check_status;
use crate::streaming::{SseEvent, SseStream};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
}

impl AnthropicClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum SseData {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageInfo },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: DeltaInfo },
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: MessageDeltaInfo,
        #[serde(default)]
        usage: Option<UsageInfo>,
    },
    #[serde(rename = "error")]
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct MessageInfo {
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum DeltaInfo {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct MessageDeltaInfo {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

/// System text goes in the top-level `system` field; consecutive system
/// messages are joined.
fn convert_messages(messages: Vec<ChatMessage>) -> (Option<String>, Vec<ApiMessage>) {
    let mut system: Option<String> = None;
    let mut api_msgs = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => match &mut system {
                Some(s) => {
                    s.push_str("\n\n");
                    s.push_str(&msg.content);
                }
                None => system = Some(msg.content),
            },
            Role::User => api_msgs.push(ApiMessage {
                role: "user",
                content: msg.content,
            }),
            Role::Assistant => api_msgs.push(ApiMessage {
                role: "assistant",
                content: msg.content,
            }),
        }
    }

    (system, api_msgs)
}

fn parse_sse_to_delta(event: SseEvent) -> Option<Result<StreamDelta>> {
    let data: SseData = match serde_json::from_str(&event.data) {
        Ok(data) => data,
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse SSE data");
            return None;
        }
    };

    match data {
        SseData::MessageStart { message } => message.usage.map(|usage| {
            Ok(StreamDelta::Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            })
        }),
        SseData::ContentBlockDelta {
            delta: DeltaInfo::TextDelta { text },
        } => Some(Ok(StreamDelta::TextDelta(text))),
        SseData::ContentBlockDelta { .. } => None,
        SseData::MessageDelta { delta, usage } => {
            if let Some(usage) = usage {
                debug!(output_tokens = usage.output_tokens, "Token usage");
            }
            let stop = match delta.stop_reason.as_deref() {
                Some("end_turn") => StopReason::EndTurn,
                Some("max_tokens") => StopReason::MaxTokens,
                Some("stop_sequence") => StopReason::StopSequence,
                _ => return None,
            };
            Some(Ok(StreamDelta::Stop(stop)))
        }
        SseData::Error { error } => Some(Err(CryptoflowError::LlmStream(error.message))),
        SseData::Other => None,
    }
}

impl LlmClient for AnthropicClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();

        Box::pin(async move {
            let api_key = config
                .api_key
                .as_deref()
                .ok_or_else(|| CryptoflowError::Config("Anthropic API key not set".into()))?;
            let base_url = config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);

            let (system, api_messages) = convert_messages(messages);
            let body = AnthropicRequest {
                model: config.model_id.clone(),
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                messages: api_messages,
                system,
                stream: true,
            };

            debug!(model = %config.model_id, "Anthropic chat request");
            let mut req = self
                .http
                .post(base_url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body);
            for (k, v) in &config.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let response = req
                .send()
                .await
                .map_err(|e| CryptoflowError::LlmRequest(e.to_string()))?;
            let response = check_status(response).await?;

            let delta_stream =
                SseStream::new(response.bytes_stream()).filter_map(|event| async move {
                    match event {
                        Ok(event) => parse_sse_to_delta(event),
                        Err(e) => Some(Err(e)),
                    }
                });

            Ok(Box::pin(delta_stream) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}
