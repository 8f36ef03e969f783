use serde::Serialize;
use serde_json::{Map, Value};

use cryptoflow_core::error::CryptoflowError;
use cryptoflow_core::types::ToolResult;

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// Arguments as a JSON object, ready for the registry.
    pub fn input(&self) -> Value {
        Value::Object(self.arguments.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObservationKind {
    Success,
    ToolError,
    SchemaValidationError,
    UnknownTool,
}

/// What the loop saw after acting. Failures are data, not faults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub content: String,
    pub kind: ObservationKind,
}

impl Observation {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: ObservationKind::Success,
        }
    }

    pub fn from_result(result: ToolResult) -> Self {
        Self {
            kind: if result.is_error {
                ObservationKind::ToolError
            } else {
                ObservationKind::Success
            },
            content: result.content,
        }
    }

    /// Map a dispatch failure to the observation the model will read.
    pub fn from_error(error: &CryptoflowError) -> Self {
        match error {
            CryptoflowError::ToolNotFound(name) => Self {
                content: format!("Error: Tool '{name}' not found."),
                kind: ObservationKind::UnknownTool,
            },
            CryptoflowError::ToolValidation { tool, message } => Self {
                content: format!("Error: invalid input for tool '{tool}': {message}"),
                kind: ObservationKind::SchemaValidationError,
            },
            other => Self {
                content: format!("Error: {other}"),
                kind: ObservationKind::ToolError,
            },
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind != ObservationKind::Success
    }
}

/// Where a turn ended up in the loop's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TurnOutcome {
    Thinking,
    Acting,
    Observing,
    Answered,
}

/// One iteration of the loop. Built by value, never modified after it is
/// pushed onto a [`History`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub thought: String,
    pub action: Option<ToolInvocation>,
    pub observation: Option<Observation>,
    pub is_final: bool,
    pub answer: Option<String>,
}

impl Turn {
    pub fn thinking(thought: impl Into<String>) -> Self {
        Self {
            thought: thought.into(),
            action: None,
            observation: None,
            is_final: false,
            answer: None,
        }
    }

    pub fn act(self, invocation: ToolInvocation) -> Self {
        Self {
            action: Some(invocation),
            ..self
        }
    }

    pub fn observe(self, observation: Observation) -> Self {
        Self {
            observation: Some(observation),
            ..self
        }
    }

    pub fn answer(self, answer: impl Into<String>) -> Self {
        Self {
            is_final: true,
            answer: Some(answer.into()),
            ..self
        }
    }

    pub fn outcome(&self) -> TurnOutcome {
        match (&self.action, &self.observation) {
            _ if self.is_final => TurnOutcome::Answered,
            (Some(_), Some(_)) => TurnOutcome::Observing,
            (Some(_), None) => TurnOutcome::Acting,
            (None, _) => TurnOutcome::Thinking,
        }
    }
}

/// The query and every completed turn of one loop run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct History {
    query: String,
    turns: Vec<Turn>,
}

impl History {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            turns: Vec::new(),
        }
    }

    /// Append a turn, returning the extended history.
    #[must_use]
    pub fn push(mut self, turn: Turn) -> Self {
        self.turns.push(turn);
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn final_answer(&self) -> Option<&str> {
        self.last()
            .filter(|t| t.is_final)
            .and_then(|t| t.answer.as_deref())
    }

    /// Tool invocations in the order they were issued.
    pub fn invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.turns.iter().filter_map(|t| t.action.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_turn_outcomes() {
        let t = Turn::thinking("hmm");
        assert_eq!(t.outcome(), TurnOutcome::Thinking);

        let t = t.act(ToolInvocation::new("get_crypto_price", args(json!({"symbol": "BTC"}))));
        assert_eq!(t.outcome(), TurnOutcome::Acting);

        let t = t.observe(Observation::success("{}"));
        assert_eq!(t.outcome(), TurnOutcome::Observing);

        let t = Turn::thinking("done").answer("42");
        assert_eq!(t.outcome(), TurnOutcome::Answered);
        assert!(t.is_final);
    }

    #[test]
    fn test_push_returns_extended_history() {
        let h0 = History::new("price of BTC?");
        let h1 = h0.clone().push(Turn::thinking("a"));
        let h2 = h1.clone().push(Turn::thinking("b").answer("50k"));

        assert!(h0.is_empty());
        assert_eq!(h1.len(), 1);
        assert_eq!(h2.len(), 2);
        assert_eq!(h2.final_answer(), Some("50k"));
        assert_eq!(h1.final_answer(), None);
        assert_eq!(h2.query(), "price of BTC?");
    }

    #[test]
    fn test_error_observations() {
        let o = Observation::from_error(&CryptoflowError::ToolNotFound("fly".into()));
        assert_eq!(o.kind, ObservationKind::UnknownTool);
        assert_eq!(o.content, "Error: Tool 'fly' not found.");

        let o = Observation::from_error(&CryptoflowError::ToolValidation {
            tool: "get_crypto_price".into(),
            message: "missing required field: symbol".into(),
        });
        assert_eq!(o.kind, ObservationKind::SchemaValidationError);
        assert!(o.content.contains("missing required field: symbol"));

        let o = Observation::from_error(&CryptoflowError::ToolTimeout {
            tool: "search".into(),
            timeout_secs: 5,
        });
        assert_eq!(o.kind, ObservationKind::ToolError);
        assert!(o.is_error());
    }

    #[test]
    fn test_failed_tool_result_is_tool_error() {
        let o = Observation::from_result(ToolResult::error("webhook down"));
        assert_eq!(o.kind, ObservationKind::ToolError);
        assert!(!Observation::from_result(ToolResult::success("ok")).is_error());
    }
}
