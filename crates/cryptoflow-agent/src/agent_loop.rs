use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cryptoflow_core::config::AppConfig;
use cryptoflow_core::error::{CryptoflowError, Result};
use cryptoflow_core::event::EventBus;
use cryptoflow_core::traits::{generate, LlmClient};
use cryptoflow_core::types::{AgentEvent, RunId, ToolResult};
use cryptoflow_tools::ToolRegistry;

use crate::history::{History, Observation, ToolInvocation, Turn};
use crate::parser;
use crate::prompt::{self, compact_observation};

/// Single-agent Thought / Action / Observation loop.
pub struct ReasoningLoop {
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl ReasoningLoop {
    pub fn new(
        config: AppConfig,
        llm: impl Into<Arc<dyn LlmClient>>,
        tools: Arc<ToolRegistry>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            llm: llm.into(),
            tools,
            event_bus,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Get a cancellation token for this loop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Answer `query`, calling tools as the model asks for them.
    pub async fn run(&self, query: &str) -> Result<String> {
        self.run_with_history(query).await.map(|(answer, _)| answer)
    }

    /// Like [`run`](Self::run), also returning every turn taken.
    pub async fn run_with_history(&self, query: &str) -> Result<(String, History)> {
        let run_id = RunId::new();
        self.event_bus.publish(AgentEvent::RunStarted {
            run_id: run_id.clone(),
            query: query.to_string(),
        });

        let result = self.drive(&run_id, query).await;
        if let Err(e) = &result {
            self.event_bus.publish(AgentEvent::RunError {
                error: e.to_string(),
            });
        }
        result
    }

    async fn drive(&self, run_id: &RunId, query: &str) -> Result<(String, History)> {
        let start = Instant::now();
        let max_iterations = self.config.agent.max_iterations;
        let preamble = self.config.agent.system_prompt.as_deref();
        let tool_defs = self.tools.definitions();
        let streaming = self.config.model.streaming;

        let mut history = History::new(query);
        let mut total_input_tokens = 0u64;
        let mut total_output_tokens = 0u64;

        for turn in 0..max_iterations {
            if self.cancel.is_cancelled() {
                return Err(CryptoflowError::Cancelled);
            }

            debug!(turn, "Starting turn");
            let messages = prompt::messages(preamble, &tool_defs, &history);
            let bus = &self.event_bus;
            let on_delta = |text: &str| {
                if streaming {
                    bus.publish(AgentEvent::TextDelta(text.to_string()));
                }
            };

            let generation = tokio::select! {
                result = generate(self.llm.as_ref(), &self.config.model, messages, on_delta) => result?,
                _ = self.cancel.cancelled() => {
                    return Err(CryptoflowError::Cancelled);
                }
            };
            total_input_tokens += generation.input_tokens;
            total_output_tokens += generation.output_tokens;

            let parsed = parser::parse(&generation.text);
            if !parsed.thought.is_empty() {
                self.event_bus.publish(AgentEvent::Thought {
                    turn,
                    text: parsed.thought.clone(),
                });
            }

            let Some(invocation) = parsed.action else {
                let answer = parsed.final_answer.unwrap_or_default();
                history = history.push(Turn::thinking(parsed.thought).answer(answer.clone()));
                self.event_bus.publish(AgentEvent::TurnComplete { turn });
                self.event_bus.publish(AgentEvent::RunComplete {
                    run_id: run_id.clone(),
                    total_turns: turn + 1,
                    input_tokens: total_input_tokens,
                    output_tokens: total_output_tokens,
                });
                info!(
                    run_id = %run_id,
                    turns = turn + 1,
                    input_tokens = total_input_tokens,
                    output_tokens = total_output_tokens,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Agent run complete"
                );
                return Ok((answer, history));
            };

            if parsed.final_answer.is_some() {
                debug!(turn, tool = %invocation.name, "Response had both an action and a final answer; acting");
            }
            if self.cancel.is_cancelled() {
                return Err(CryptoflowError::Cancelled);
            }

            let observation = self.observe(&invocation).await;
            history = history.push(
                Turn::thinking(parsed.thought)
                    .act(invocation)
                    .observe(observation),
            );
            self.event_bus.publish(AgentEvent::TurnComplete { turn });
        }

        warn!(max_iterations, "No final answer within iteration limit");
        Err(CryptoflowError::Exhausted(max_iterations))
    }

    /// Dispatch one invocation. Every failure becomes an observation.
    async fn observe(&self, invocation: &ToolInvocation) -> Observation {
        let name = invocation.name.as_str();
        let input = invocation.input();
        self.event_bus.publish(AgentEvent::ToolStart {
            name: name.to_string(),
            input: input.clone(),
        });

        let observation = match self.tools.execute(name, input).await {
            Ok(result) => {
                if result.is_error {
                    warn!(tool = %name, "Tool reported an error");
                }
                Observation::from_result(result)
            }
            Err(e @ CryptoflowError::ToolNotFound(_)) => {
                warn!(tool = %name, "Model asked for an unknown tool");
                let mut obs = Observation::from_error(&e);
                obs.content = format!(
                    "{} Available tools: {}",
                    obs.content,
                    self.tools.names().join(", ")
                );
                obs
            }
            Err(e) => {
                error!(tool = %name, error = %e, "Tool execution failed");
                Observation::from_error(&e)
            }
        };

        let observation = Observation {
            content: compact_observation(
                &observation.content,
                self.config.agent.max_observation_chars,
            ),
            ..observation
        };

        self.event_bus.publish(AgentEvent::ToolEnd {
            name: name.to_string(),
            result: ToolResult {
                content: observation.content.clone(),
                is_error: observation.is_error(),
            },
        });
        observation
    }
}
