use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cryptoflow_core::config::ModelConfig;
use cryptoflow_core::error::{CryptoflowError, Result};
use cryptoflow_core::traits::LlmClient;
use cryptoflow_core::types::*;

use crate::streaming::{SseEvent, SseStream};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDeltaContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDeltaContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    messages
        .into_iter()
        .map(|msg| OaiMessage {
            role: match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: msg.content,
        })
        .collect()
}

fn parse_chunk(event: SseEvent) -> Vec<Result<StreamDelta>> {
    if event.is_done() {
        return vec![];
    }

    let chunk: StreamChunk = match serde_json::from_str(&event.data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse OpenAI SSE chunk");
            return vec![];
        }
    };

    let mut deltas = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.and_then(|d| d.content) {
            if !text.is_empty() {
                deltas.push(Ok(StreamDelta::TextDelta(text)));
            }
        }
        if let Some(reason) = choice.finish_reason {
            let stop = match reason.as_str() {
                "length" => StopReason::MaxTokens,
                "stop" => StopReason::EndTurn,
                _ => StopReason::EndTurn,
            };
            deltas.push(Ok(StreamDelta::Stop(stop)));
        }
    }
    if let Some(usage) = chunk.usage {
        deltas.push(Ok(StreamDelta::Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }));
    }
    deltas
}

/// Reasoning models reject a custom temperature.
fn accepts_temperature(model_id: &str) -> bool {
    !(model_id.starts_with("o1") || model_id.starts_with("o3") || model_id.starts_with("o4"))
}

pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    Err(CryptoflowError::LlmRequest(format!("HTTP {}: {}", status, body)))
}

impl LlmClient for OpenAiClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();

        Box::pin(async move {
            let base_url = config.base_url.as_deref().unwrap_or(OPENAI_API_URL);

            let body = ChatRequest {
                model: config.model_id.clone(),
                messages: convert_messages(messages),
                max_tokens: config.max_tokens,
                temperature: if accepts_temperature(&config.model_id) {
                    Some(config.temperature)
                } else {
                    None
                },
                stream: true,
                stream_options: StreamOptions {
                    include_usage: true,
                },
            };

            debug!(model = %config.model_id, url = base_url, "OpenAI chat request");
            let mut req = self.http.post(base_url).json(&body);
            if let Some(api_key) = &config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }
            for (k, v) in &config.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let response = req
                .send()
                .await
                .map_err(|e| CryptoflowError::LlmRequest(e.to_string()))?;
            let response = check_status(response).await?;

            let delta_stream = SseStream::new(response.bytes_stream())
                .map(|event| match event {
                    Ok(event) => futures::stream::iter(parse_chunk(event)),
                    Err(e) => futures::stream::iter(vec![Err(e)]),
                })
                .flatten();

            Ok(Box::pin(delta_stream) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event_type: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_parse_text_chunk() {
        let deltas = parse_chunk(event(
            r#"{"choices":[{"delta":{"content":"Thought: "},"finish_reason":null}]}"#,
        ));
        assert_eq!(deltas.len(), 1);
        assert!(matches!(&deltas[0], Ok(StreamDelta::TextDelta(t)) if t == "Thought: "));
    }

    #[test]
    fn test_parse_finish_and_usage() {
        let deltas = parse_chunk(event(
            r#"{"choices":[{"delta":{},"finish_reason":"length"}],"usage":{"prompt_tokens":12,"completion_tokens":4}}"#,
        ));
        assert!(matches!(deltas[0], Ok(StreamDelta::Stop(StopReason::MaxTokens))));
        assert!(matches!(
            deltas[1],
            Ok(StreamDelta::Usage {
                input_tokens: 12,
                output_tokens: 4
            })
        ));
    }

    #[test]
    fn test_done_and_garbage_are_ignored() {
        assert!(parse_chunk(event("[DONE]")).is_empty());
        assert!(parse_chunk(event("not json")).is_empty());
    }

    #[test]
    fn test_roles_map_to_wire_names() {
        let msgs = convert_messages(vec![
            ChatMessage::system("s"),
            ChatMessage::user("u"),
            ChatMessage::assistant("a"),
        ]);
        let roles: Vec<_> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
    }

    #[test]
    fn test_reasoning_models_skip_temperature() {
        assert!(accepts_temperature("gpt-4o-mini"));
        assert!(!accepts_temperature("o3-mini"));
    }
}
