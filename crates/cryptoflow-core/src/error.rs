use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoflowError {
    // Model gateway errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {tool}: {message}")]
    ToolValidation { tool: String, message: String },

    // Loop errors
    #[error("No final answer after {0} iterations")]
    Exhausted(usize),

    #[error("Run cancelled")]
    Cancelled,

    // Workflow node errors (raised by node transforms)
    #[error("Node failed: {0}")]
    Node(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CryptoflowError {
    /// Errors the reasoning loop absorbs into an observation instead of failing the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ToolNotFound(_)
                | Self::ToolExecution { .. }
                | Self::ToolTimeout { .. }
                | Self::ToolValidation { .. }
        )
    }

    /// Provider-side failures (transport, auth, malformed stream).
    pub fn is_provider(&self) -> bool {
        matches!(
            self,
            Self::LlmRequest(_) | Self::LlmStream(_) | Self::UnsupportedProvider(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CryptoflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(CryptoflowError::ToolNotFound("x".into()).is_recoverable());
        assert!(CryptoflowError::ToolValidation {
            tool: "x".into(),
            message: "missing".into()
        }
        .is_recoverable());
        assert!(!CryptoflowError::Exhausted(3).is_recoverable());
        assert!(!CryptoflowError::Cancelled.is_recoverable());
        assert!(!CryptoflowError::LlmRequest("503".into()).is_recoverable());
    }

    #[test]
    fn test_provider_kinds() {
        assert!(CryptoflowError::LlmStream("eof".into()).is_provider());
        assert!(!CryptoflowError::Node("x".into()).is_provider());
    }

    #[test]
    fn test_display() {
        let e = CryptoflowError::ToolTimeout {
            tool: "get_crypto_price".into(),
            timeout_secs: 30,
        };
        assert_eq!(e.to_string(), "Tool timeout after 30s: get_crypto_price");
        assert_eq!(
            CryptoflowError::Exhausted(10).to_string(),
            "No final answer after 10 iterations"
        );
    }
}
