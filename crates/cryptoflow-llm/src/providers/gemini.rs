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

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini native API client.
pub struct GeminiClient {
    http: Client,
}

impl GeminiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for GeminiClient {
    fn default() -> Self {
        Self::new()
    }
}

// ── Request types ────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Deserialize, Debug)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize, Debug)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

// ── Response types ───────────────────────────────────────────────

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

// ── Conversion ───────────────────────────────────────────────────

fn text_content(role: Option<&str>, text: String) -> GeminiContent {
    GeminiContent {
        role: role.map(str::to_string),
        parts: vec![GeminiPart { text: Some(text) }],
    }
}

fn convert_messages(messages: Vec<ChatMessage>) -> (Option<GeminiContent>, Vec<GeminiContent>) {
    let mut system = None;
    let mut contents = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => system = Some(text_content(None, msg.content)),
            Role::User => contents.push(text_content(Some("user"), msg.content)),
            Role::Assistant => contents.push(text_content(Some("model"), msg.content)),
        }
    }

    (system, contents)
}

/// One chunk may carry text, a finish reason and usage at once.
/// Usage is reported cumulatively, so only the final chunk's counts are kept.
fn parse_gemini_chunk(event: SseEvent) -> Vec<Result<StreamDelta>> {
    let chunk: GeminiStreamChunk = match serde_json::from_str(&event.data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse Gemini SSE chunk");
            return vec![];
        }
    };

    let mut deltas = Vec::new();
    let mut finished = false;
    if let Some(candidate) = chunk.candidates.into_iter().next() {
        if let Some(content) = candidate.content {
            for text in content.parts.into_iter().filter_map(|p| p.text) {
                if !text.is_empty() {
                    deltas.push(Ok(StreamDelta::TextDelta(text)));
                }
            }
        }
        if let Some(reason) = candidate.finish_reason {
            finished = true;
            let stop = match reason.as_str() {
                "MAX_TOKENS" => StopReason::MaxTokens,
                _ => StopReason::EndTurn,
            };
            deltas.push(Ok(StreamDelta::Stop(stop)));
        }
    }
    if let (true, Some(usage)) = (finished, chunk.usage_metadata) {
        deltas.push(Ok(StreamDelta::Usage {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
        }));
    }
    deltas
}

impl LlmClient for GeminiClient {
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
                .ok_or_else(|| CryptoflowError::Config("Gemini: api_key is required".into()))?;
            let base = config.base_url.as_deref().unwrap_or(GEMINI_API_BASE);
            let url = format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                base.trim_end_matches('/'),
                config.model_id
            );

            let (system_instruction, contents) = convert_messages(messages);
            let body = GeminiRequest {
                contents,
                system_instruction,
                generation_config: GenerationConfig {
                    max_output_tokens: config.max_tokens,
                    temperature: config.temperature,
                },
            };

            debug!(model = %config.model_id, "Gemini chat request");
            let response = self
                .http
                .post(&url)
                .header("x-goog-api-key", api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| CryptoflowError::LlmRequest(e.to_string()))?;
            let response = check_status(response).await?;

            let delta_stream = SseStream::new(response.bytes_stream())
                .map(|event| match event {
                    Ok(event) => futures::stream::iter(parse_gemini_chunk(event)),
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
    fn test_assistant_maps_to_model_role() {
        let (system, contents) = convert_messages(vec![
            ChatMessage::system("rules"),
            ChatMessage::user("q"),
            ChatMessage::assistant("a"),
        ]);
        assert!(system.is_some());
        assert_eq!(contents[1].role.as_deref(), Some("model"));
    }

    #[test]
    fn test_text_then_final_chunk_with_usage() {
        let deltas = parse_gemini_chunk(event(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Thought: check"}]}}],"usageMetadata":{"promptTokenCount":5}}"#,
        ));
        assert_eq!(deltas.len(), 1);

        let deltas = parse_gemini_chunk(event(
            r#"{"candidates":[{"content":{"parts":[{"text":" price"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":3}}"#,
        ));
        assert_eq!(deltas.len(), 3);
        assert!(matches!(deltas[1], Ok(StreamDelta::Stop(StopReason::EndTurn))));
        assert!(matches!(
            deltas[2],
            Ok(StreamDelta::Usage {
                input_tokens: 5,
                output_tokens: 3
            })
        ));
    }

    #[test]
    fn test_request_uses_camel_case() {
        let body = GeminiRequest {
            contents: vec![],
            system_instruction: None,
            generation_config: GenerationConfig {
                max_output_tokens: 10,
                temperature: 0.3,
            },
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["generationConfig"]["maxOutputTokens"], 10);
    }
}
