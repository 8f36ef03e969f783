//! Graph workflow engine.
//!
//! A workflow is declared with a [`GraphBuilder`], validated into a [`Graph`]
//! and compiled into a [`CompiledGraph`]: a vector of nodes plus a transition
//! table indexed by node id. A compiled graph is read-only and can serve any
//! number of concurrent runs, each threading its own state from the entry
//! node to a finish node.

pub mod builder;
pub mod checkpoint;
pub mod compiled;
pub mod edge;
pub mod error;
pub mod node;

pub use builder::{Graph, GraphBuilder};
pub use checkpoint::{Checkpoint, CheckpointError, Checkpointer, MemoryCheckpointer};
pub use compiled::{CompiledGraph, RunOptions, WorkflowResult};
pub use edge::Edge;
pub use error::{GraphDefinitionError, WorkflowError};
pub use node::Node;
