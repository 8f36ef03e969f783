use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one engine run (loop or workflow).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message sent to the model gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }

    /// Successful result carrying a JSON document.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::success(serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()))
    }

    /// Parse the content back into JSON, if it is JSON.
    pub fn as_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.content).ok()
    }
}

/// Tool definition shown to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    /// Calling the tool changes something outside the process.
    #[serde(default)]
    pub side_effects: bool,
}

/// Event broadcast to all subscribers while an engine runs.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Reasoning loop started.
    RunStarted { run_id: RunId, query: String },
    /// Text streaming from the model.
    TextDelta(String),
    /// A parsed thought for the current turn.
    Thought { turn: usize, text: String },
    /// Tool execution started.
    ToolStart { name: String, input: serde_json::Value },
    /// Tool execution completed (or was rejected before dispatch).
    ToolEnd { name: String, result: ToolResult },
    /// Loop turn completed.
    TurnComplete { turn: usize },
    /// Loop produced a final answer.
    RunComplete {
        run_id: RunId,
        total_turns: usize,
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Run failed with an unrecovered error.
    RunError { error: String },
    /// Workflow node started.
    NodeStarted { run_id: RunId, node: String },
    /// Workflow node finished.
    NodeCompleted {
        run_id: RunId,
        node: String,
        elapsed_ms: u64,
    },
    /// Workflow reached its finish node.
    WorkflowComplete { run_id: RunId, trace: Vec<String> },
}
