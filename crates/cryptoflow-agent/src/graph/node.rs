use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use cryptoflow_core::error::Result;

pub(crate) type Transform<S> = Arc<dyn Fn(S) -> BoxFuture<'static, Result<S>> + Send + Sync>;

/// A named step of a workflow. The transform takes the state by value and
/// hands the next state forward.
pub struct Node<S> {
    pub(crate) name: String,
    pub(crate) transform: Transform<S>,
    pub(crate) may_suspend: bool,
    pub(crate) max_revisits: Option<usize>,
}

impl<S: Send + 'static> Node<S> {
    /// A node whose transform awaits external I/O.
    pub fn new<F, Fut>(name: impl Into<String>, transform: F) -> Self
    where
        F: Fn(S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
    {
        Self {
            name: name.into(),
            transform: Arc::new(move |state: S| -> BoxFuture<'static, Result<S>> {
                Box::pin(transform(state))
            }),
            may_suspend: true,
            max_revisits: None,
        }
    }

    /// A node computed in place, without suspending.
    pub fn sync<F>(name: impl Into<String>, transform: F) -> Self
    where
        F: Fn(S) -> Result<S> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            transform: Arc::new(move |state: S| -> BoxFuture<'static, Result<S>> {
                let out = transform(state);
                Box::pin(async move { out })
            }),
            may_suspend: false,
            max_revisits: None,
        }
    }

    /// Override the graph's revisit bound for this node.
    pub fn max_revisits(mut self, revisits: usize) -> Self {
        self.max_revisits = Some(revisits);
        self
    }
}

impl<S> Node<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn may_suspend(&self) -> bool {
        self.may_suspend
    }
}

impl<S> std::fmt::Debug for Node<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("may_suspend", &self.may_suspend)
            .field("max_revisits", &self.max_revisits)
            .finish()
    }
}
