use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use cryptoflow_core::error::{CryptoflowError, Result};
use cryptoflow_core::traits::Tool;
use cryptoflow_core::types::ToolResult;

const TAVILY_API_URL: &str = "https://api.tavily.com/search";

/// Web search through Tavily. Without an API key, or when the API fails,
/// the tool answers with clearly marked placeholder results.
pub struct WebSearchTool {
    api_key: Option<String>,
    base_url: String,
    http: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            base_url: TAVILY_API_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    async fn tavily(&self, api_key: &str, query: &str, max: u64) -> Result<Value> {
        let to_err = |e: reqwest::Error| CryptoflowError::ToolExecution {
            tool: "search".into(),
            message: e.to_string(),
        };
        let body: Value = self
            .http
            .post(&self.base_url)
            .timeout(Duration::from_secs(10))
            .json(&json!({
                "api_key": api_key,
                "query": query,
                "max_results": max,
                "search_depth": "basic",
                "include_answer": true,
            }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(to_err)?
            .json()
            .await
            .map_err(to_err)?;

        let results: Vec<Value> = body["results"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|r| {
                        json!({
                            "title": r["title"].as_str().unwrap_or(""),
                            "url": r["url"].as_str().unwrap_or(""),
                            "content": r["content"].as_str().unwrap_or(""),
                            "score": r["score"].as_f64().unwrap_or(0.0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(json!({
            "query": query,
            "answer": body["answer"].as_str().unwrap_or(""),
            "results": results,
        }))
    }
}

fn placeholder_results(query: &str, max: u64) -> Value {
    let results: Vec<Value> = (0..max)
        .map(|i| {
            json!({
                "title": format!("Result {} for {}", i + 1, query),
                "url": format!("https://example.com/result-{}", i + 1),
                "content": format!("Placeholder content for result {} about {}.", i + 1, query),
                "score": 0.9 - i as f64 * 0.1,
            })
        })
        .collect();
    json!({
        "query": query,
        "answer": format!("No search provider configured; placeholder answer for: {query}"),
        "results": results,
        "_note": "Placeholder results",
    })
}

#[derive(Deserialize)]
struct SearchInput {
    query: String,
    #[serde(default = "default_max_results")]
    max_results: u64,
}

fn default_max_results() -> u64 {
    5
}

impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search the web for current information. Returns relevant results with snippets."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of results (default 5)",
                    "minimum": 1,
                    "maximum": 10
                }
            },
            "required": ["query"]
        })
    }

    fn execute(&self, input: Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: SearchInput = serde_json::from_value(input).map_err(|e| {
                CryptoflowError::ToolValidation {
                    tool: "search".into(),
                    message: e.to_string(),
                }
            })?;

            let Some(api_key) = self.api_key.as_deref() else {
                warn!("TAVILY_API_KEY not set, returning placeholder results");
                return Ok(ToolResult::json(&placeholder_results(&p.query, p.max_results)));
            };

            let out = match self.tavily(api_key, &p.query, p.max_results).await {
                Ok(v) => {
                    info!(query = %p.query, "Search completed");
                    v
                }
                Err(e) => {
                    warn!(error = %e, "Search failed, returning placeholder results");
                    placeholder_results(&p.query, p.max_results)
                }
            };
            Ok(ToolResult::json(&out))
        })
    }
}
