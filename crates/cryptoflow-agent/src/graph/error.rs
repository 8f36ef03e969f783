use thiserror::Error;

use cryptoflow_core::error::CryptoflowError;

use super::checkpoint::CheckpointError;

/// A graph that failed validation. Lists every problem found, not just the first.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Invalid graph: {}", .violations.join("; "))]
pub struct GraphDefinitionError {
    pub violations: Vec<String>,
}

/// Why a workflow run stopped without a result.
///
/// Every variant carries the trace of completed nodes and the last known
/// state so a failed run can be diagnosed without re-running it.
#[derive(Debug, Error)]
pub enum WorkflowError<S> {
    /// A node's transform failed. `state` is the state the node received.
    #[error("Node '{node}' failed: {source}")]
    NodeExecution {
        node: String,
        #[source]
        source: CryptoflowError,
        state: S,
        trace: Vec<String>,
    },

    /// A node was about to run more often than its revisit bound allows.
    #[error("Node '{node}' exceeded its visit limit of {limit}")]
    CycleLimit {
        node: String,
        limit: usize,
        state: S,
        trace: Vec<String>,
    },

    #[error("Workflow cancelled after {} node(s)", .trace.len())]
    Cancelled { state: S, trace: Vec<String> },

    #[error("Checkpoint failed: {source}")]
    Checkpoint {
        #[source]
        source: CheckpointError,
        state: S,
        trace: Vec<String>,
    },
}

impl<S> WorkflowError<S> {
    /// Nodes completed before the run stopped.
    pub fn trace(&self) -> &[String] {
        match self {
            Self::NodeExecution { trace, .. }
            | Self::CycleLimit { trace, .. }
            | Self::Cancelled { trace, .. }
            | Self::Checkpoint { trace, .. } => trace,
        }
    }

    pub fn state(&self) -> &S {
        match self {
            Self::NodeExecution { state, .. }
            | Self::CycleLimit { state, .. }
            | Self::Cancelled { state, .. }
            | Self::Checkpoint { state, .. } => state,
        }
    }

    pub fn into_state(self) -> S {
        match self {
            Self::NodeExecution { state, .. }
            | Self::CycleLimit { state, .. }
            | Self::Cancelled { state, .. }
            | Self::Checkpoint { state, .. } => state,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_error_lists_all() {
        let e = GraphDefinitionError {
            violations: vec!["no entry node".into(), "no finish node".into()],
        };
        assert_eq!(e.to_string(), "Invalid graph: no entry node; no finish node");
    }

    #[test]
    fn test_workflow_error_accessors() {
        let e: WorkflowError<u32> = WorkflowError::NodeExecution {
            node: "collect".into(),
            source: CryptoflowError::Node("price feed down".into()),
            state: 7,
            trace: vec![],
        };
        assert_eq!(e.to_string(), "Node 'collect' failed: Node failed: price feed down");
        assert_eq!(*e.state(), 7);
        assert!(e.trace().is_empty());

        let e: WorkflowError<u32> = WorkflowError::Cancelled {
            state: 1,
            trace: vec!["collect".into()],
        };
        assert!(e.is_cancelled());
        assert_eq!(e.to_string(), "Workflow cancelled after 1 node(s)");
        assert_eq!(e.into_state(), 1);
    }
}
