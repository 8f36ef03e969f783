use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use cryptoflow_core::config::AppConfig;
use cryptoflow_core::error::{CryptoflowError, Result};
use cryptoflow_core::traits::Tool;
use cryptoflow_core::types::{ToolDefinition, ToolResult};

use crate::builtin::{
    CryptoNewsTool, CryptoPriceTool, IndicatorTool, NotificationTool, WebSearchTool,
};
use crate::schema;

/// Collects tools at startup. `build` freezes them into a [`ToolRegistry`].
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<Arc<dyn Tool>>,
    timeout_cap_secs: Option<u64>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    pub fn register(self, tool: impl Tool) -> Self {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Upper bound for every tool's own timeout.
    pub fn timeout_cap(mut self, secs: u64) -> Self {
        self.timeout_cap_secs = Some(secs);
        self
    }

    /// Register the market tools, configured from `config`.
    pub fn with_builtins(self, config: &AppConfig) -> Self {
        let price = Arc::new(CryptoPriceTool::new(config.tools.coingecko_api_key.clone()));
        self.register_arc(price.clone())
            .register(CryptoNewsTool)
            .register(IndicatorTool::new(price))
            .register(WebSearchTool::new(config.tools.tavily_api_key.clone()))
            .register(NotificationTool::new(&config.tools))
            .timeout_cap(config.agent.tool_timeout_secs)
    }

    /// Freeze the registry. Fails on duplicate tool names.
    pub fn build(self) -> Result<ToolRegistry> {
        let mut tools = BTreeMap::new();
        for tool in self.tools {
            let name = tool.name().to_string();
            if tools.insert(name.clone(), tool).is_some() {
                return Err(CryptoflowError::Config(format!(
                    "tool registered twice: {name}"
                )));
            }
        }
        debug!(count = tools.len(), "Tool registry built");
        Ok(ToolRegistry {
            tools,
            timeout_cap_secs: self.timeout_cap_secs,
        })
    }
}

/// Read-only set of tools, shared across runs.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    timeout_cap_secs: Option<u64>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::new()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Tool names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Get tool definitions for the model prompt, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
                side_effects: t.has_side_effects(),
            })
            .collect()
    }

    /// Effective timeout of a tool.
    pub fn timeout_secs(&self, tool: &dyn Tool) -> u64 {
        match self.timeout_cap_secs {
            Some(cap) => tool.timeout_secs().min(cap),
            None => tool.timeout_secs(),
        }
    }

    /// Resolve a tool and check `input` against its schema.
    pub fn validate(&self, name: &str, input: &serde_json::Value) -> Result<Arc<dyn Tool>> {
        let tool = self
            .get(name)
            .ok_or_else(|| CryptoflowError::ToolNotFound(name.to_string()))?;

        schema::validate(&tool.input_schema(), input).map_err(|violations| {
            CryptoflowError::ToolValidation {
                tool: name.to_string(),
                message: violations.join("; "),
            }
        })?;
        Ok(tool)
    }

    /// Validate, then execute a tool with its timeout.
    ///
    /// Invalid input never reaches the tool.
    pub async fn execute(&self, name: &str, input: serde_json::Value) -> Result<ToolResult> {
        let tool = self.validate(name, &input)?;
        let timeout_secs = self.timeout_secs(tool.as_ref());

        match tokio::time::timeout(Duration::from_secs(timeout_secs), tool.execute(input)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(tool = name, timeout_secs, "Tool timed out");
                Err(CryptoflowError::ToolTimeout {
                    tool: name.to_string(),
                    timeout_secs,
                })
            }
        }
    }
}
