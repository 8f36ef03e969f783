pub mod agent_loop;
pub mod graph;
pub mod history;
pub mod market;
pub mod parser;
pub mod prompt;

pub use agent_loop::ReasoningLoop;
pub use graph::{
    Checkpoint, CheckpointError, Checkpointer, CompiledGraph, Graph, GraphBuilder,
    GraphDefinitionError, MemoryCheckpointer, Node, RunOptions, WorkflowError, WorkflowResult,
};
pub use history::{History, Observation, ObservationKind, ToolInvocation, Turn, TurnOutcome};
pub use market::{comparison_table, market_workflow, MarketContext, MarketState};
