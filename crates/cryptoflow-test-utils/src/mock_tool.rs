use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use cryptoflow_core::error::{CryptoflowError, Result};
use cryptoflow_core::traits::Tool;
use cryptoflow_core::types::ToolResult;

#[derive(Clone)]
enum Reply {
    Json(Value),
    Text(String),
    Fail(String),
}

/// Tool double that records every input it is executed with.
///
/// Clones share the input log.
#[derive(Clone)]
pub struct MockTool {
    name: String,
    schema: Value,
    reply: Reply,
    delay: Option<Duration>,
    timeout_secs: u64,
    inputs: Arc<Mutex<Vec<Value>>>,
}

impl MockTool {
    /// A tool accepting any object and answering `{"ok": true}`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: json!({ "type": "object", "properties": {} }),
            reply: Reply::Json(json!({ "ok": true })),
            delay: None,
            timeout_secs: 30,
            inputs: Arc::default(),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn returning(mut self, value: Value) -> Self {
        self.reply = Reply::Json(value);
        self
    }

    pub fn returning_text(mut self, text: impl Into<String>) -> Self {
        self.reply = Reply::Text(text.into());
        self
    }

    /// Every execution fails with `ToolExecution`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.reply = Reply::Fail(message.into());
        self
    }

    /// Sleep before answering, for timeout and cancellation tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn call_count(&self) -> usize {
        self.log().len()
    }

    pub fn inputs(&self) -> Vec<Value> {
        self.log().clone()
    }

    fn log(&self) -> std::sync::MutexGuard<'_, Vec<Value>> {
        self.inputs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Test double"
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn execute(&self, input: Value) -> BoxFuture<'_, Result<ToolResult>> {
        self.log().push(input);
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.reply {
                Reply::Json(v) => Ok(ToolResult::json(v)),
                Reply::Text(t) => Ok(ToolResult::success(t.clone())),
                Reply::Fail(message) => Err(CryptoflowError::ToolExecution {
                    tool: self.name.clone(),
                    message: message.clone(),
                }),
            }
        })
    }
}
