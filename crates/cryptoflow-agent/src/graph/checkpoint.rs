use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use thiserror::Error;

use cryptoflow_core::types::RunId;

/// State recorded after a node completed.
#[derive(Debug, Clone)]
pub struct Checkpoint<S> {
    pub run_id: RunId,
    /// The node whose output `state` is.
    pub node: String,
    pub state: S,
    /// Nodes executed so far, including `node`.
    pub trace: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint store error: {0}")]
    Store(String),

    #[error("Checkpoint names unknown node: {0}")]
    UnknownNode(String),
}

/// Persistence for in-flight workflow runs. Only the latest checkpoint per
/// run is needed to resume.
pub trait Checkpointer<S>: Send + Sync {
    fn save(&self, checkpoint: Checkpoint<S>) -> BoxFuture<'_, Result<(), CheckpointError>>;

    fn load(&self, run_id: RunId) -> BoxFuture<'_, Result<Option<Checkpoint<S>>, CheckpointError>>;
}

/// Process-local checkpoint store.
pub struct MemoryCheckpointer<S> {
    records: Mutex<HashMap<RunId, Checkpoint<S>>>,
}

impl<S> MemoryCheckpointer<S> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the record of a finished run.
    pub fn remove(&self, run_id: &RunId) {
        if let Ok(mut records) = self.records.lock() {
            records.remove(run_id);
        }
    }
}

impl<S> Default for MemoryCheckpointer<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Clone + Send + 'static> Checkpointer<S> for MemoryCheckpointer<S> {
    fn save(&self, checkpoint: Checkpoint<S>) -> BoxFuture<'_, Result<(), CheckpointError>> {
        let result = self
            .records
            .lock()
            .map(|mut records| {
                records.insert(checkpoint.run_id.clone(), checkpoint);
            })
            .map_err(|e| CheckpointError::Store(e.to_string()));
        Box::pin(async move { result })
    }

    fn load(&self, run_id: RunId) -> BoxFuture<'_, Result<Option<Checkpoint<S>>, CheckpointError>> {
        let result = self
            .records
            .lock()
            .map(|records| records.get(&run_id).cloned())
            .map_err(|e| CheckpointError::Store(e.to_string()));
        Box::pin(async move { result })
    }
}
