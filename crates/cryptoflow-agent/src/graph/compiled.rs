use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cryptoflow_core::error::CryptoflowError;
use cryptoflow_core::event::EventBus;
use cryptoflow_core::types::{AgentEvent, RunId};

use super::checkpoint::{Checkpoint, CheckpointError, Checkpointer};
use super::edge::Router;
use super::error::WorkflowError;
use super::node::Node;

pub(crate) enum Transition<S> {
    Finish,
    Next(usize),
    Branch {
        router: Router<S>,
        branches: HashMap<String, usize>,
    },
}

/// Terminal state of a run and the nodes it passed through, in order.
#[derive(Debug, Clone)]
pub struct WorkflowResult<S> {
    pub state: S,
    pub trace: Vec<String>,
}

/// Per-run settings.
pub struct RunOptions<S> {
    pub run_id: RunId,
    pub cancel: CancellationToken,
    pub checkpointer: Option<Arc<dyn Checkpointer<S>>>,
    /// Continue from the last checkpoint of `run_id` if there is one.
    pub resume: bool,
}

impl<S> Default for RunOptions<S> {
    fn default() -> Self {
        Self {
            run_id: RunId::new(),
            cancel: CancellationToken::new(),
            checkpointer: None,
            resume: false,
        }
    }
}

impl<S> RunOptions<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer<S>>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn resume(mut self) -> Self {
        self.resume = true;
        self
    }
}

/// Execution plan: nodes by id and one transition per node.
pub struct CompiledGraph<S> {
    nodes: Vec<Node<S>>,
    transitions: Vec<Transition<S>>,
    entry: usize,
    index: HashMap<String, usize>,
    max_revisits: usize,
    event_bus: Option<Arc<EventBus>>,
}

impl<S> CompiledGraph<S> {
    pub(crate) fn from_parts(
        nodes: Vec<Node<S>>,
        transitions: Vec<Transition<S>>,
        entry: usize,
        index: HashMap<String, usize>,
        max_revisits: usize,
    ) -> Self {
        Self {
            nodes,
            transitions,
            entry,
            index,
            max_revisits,
            event_bus: None,
        }
    }

    /// Publish node progress on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    fn visit_limit(&self, id: usize) -> usize {
        self.nodes[id]
            .max_revisits
            .unwrap_or(self.max_revisits)
            .saturating_add(1)
    }

    fn successor(&self, id: usize, state: &S) -> Result<Option<usize>, CryptoflowError> {
        match &self.transitions[id] {
            Transition::Finish => Ok(None),
            Transition::Next(next) => Ok(Some(*next)),
            Transition::Branch { router, branches } => {
                let label = router(state);
                branches.get(&label).copied().map(Some).ok_or_else(|| {
                    CryptoflowError::Node(format!("no branch for label '{label}'"))
                })
            }
        }
    }

    fn publish(&self, event: AgentEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

impl<S: Clone + Send + 'static> CompiledGraph<S> {
    pub async fn run(&self, state: S) -> Result<WorkflowResult<S>, WorkflowError<S>> {
        self.run_with(state, RunOptions::default()).await
    }

    /// Run from the entry node (or the last checkpoint) to a finish node.
    pub async fn run_with(
        &self,
        state: S,
        options: RunOptions<S>,
    ) -> Result<WorkflowResult<S>, WorkflowError<S>> {
        let run_id = options.run_id.clone();
        let start = Instant::now();
        let mut visits = vec![0usize; self.nodes.len()];
        let mut trace: Vec<String> = Vec::new();
        let mut state = state;
        let mut current = self.entry;

        if let (true, Some(store)) = (options.resume, &options.checkpointer) {
            let saved = match store.load(run_id.clone()).await {
                Ok(saved) => saved,
                Err(source) => {
                    return Err(WorkflowError::Checkpoint {
                        source,
                        state,
                        trace,
                    })
                }
            };
            if let Some(cp) = saved {
                let Some(&id) = self.index.get(&cp.node) else {
                    return Err(WorkflowError::Checkpoint {
                        source: CheckpointError::UnknownNode(cp.node),
                        state,
                        trace,
                    });
                };
                for name in &cp.trace {
                    if let Some(&i) = self.index.get(name) {
                        visits[i] += 1;
                    }
                }
                info!(run_id = %run_id, node = %cp.node, "Resuming workflow from checkpoint");
                trace = cp.trace;
                match self.successor(id, &cp.state) {
                    Ok(Some(next)) => {
                        current = next;
                        state = cp.state;
                    }
                    Ok(None) => {
                        return Ok(WorkflowResult {
                            state: cp.state,
                            trace,
                        })
                    }
                    Err(source) => {
                        return Err(WorkflowError::NodeExecution {
                            node: cp.node,
                            source,
                            state: cp.state,
                            trace,
                        })
                    }
                }
            }
        }

        loop {
            if options.cancel.is_cancelled() {
                info!(run_id = %run_id, completed = trace.len(), "Workflow cancelled");
                return Err(WorkflowError::Cancelled { state, trace });
            }

            let node = &self.nodes[current];
            let limit = self.visit_limit(current);
            if visits[current] >= limit {
                warn!(run_id = %run_id, node = %node.name, limit, "Node visit limit reached");
                return Err(WorkflowError::CycleLimit {
                    node: node.name.clone(),
                    limit,
                    state,
                    trace,
                });
            }
            visits[current] += 1;

            self.publish(AgentEvent::NodeStarted {
                run_id: run_id.clone(),
                node: node.name.clone(),
            });
            debug!(run_id = %run_id, node = %node.name, may_suspend = node.may_suspend, "Running node");

            let node_start = Instant::now();
            let input = state.clone();
            let output = tokio::select! {
                biased;
                _ = options.cancel.cancelled() => {
                    info!(run_id = %run_id, node = %node.name, "Workflow cancelled mid-node");
                    return Err(WorkflowError::Cancelled { state: input, trace });
                }
                result = (node.transform)(state) => result,
            };

            let next_state = match output {
                Ok(s) => s,
                Err(source) => {
                    error!(run_id = %run_id, node = %node.name, error = %source, "Graph node failed");
                    return Err(WorkflowError::NodeExecution {
                        node: node.name.clone(),
                        source,
                        state: input,
                        trace,
                    });
                }
            };

            let elapsed_ms = node_start.elapsed().as_millis() as u64;
            trace.push(node.name.clone());
            self.publish(AgentEvent::NodeCompleted {
                run_id: run_id.clone(),
                node: node.name.clone(),
                elapsed_ms,
            });
            debug!(run_id = %run_id, node = %node.name, elapsed_ms, "Node complete");

            if let Some(store) = &options.checkpointer {
                let saved = store
                    .save(Checkpoint {
                        run_id: run_id.clone(),
                        node: node.name.clone(),
                        state: next_state.clone(),
                        trace: trace.clone(),
                    })
                    .await;
                if let Err(source) = saved {
                    return Err(WorkflowError::Checkpoint {
                        source,
                        state: next_state,
                        trace,
                    });
                }
            }

            match self.successor(current, &next_state) {
                Ok(Some(next)) => {
                    current = next;
                    state = next_state;
                }
                Ok(None) => {
                    info!(
                        run_id = %run_id,
                        nodes = trace.len(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Workflow complete"
                    );
                    self.publish(AgentEvent::WorkflowComplete {
                        run_id,
                        trace: trace.clone(),
                    });
                    return Ok(WorkflowResult {
                        state: next_state,
                        trace,
                    });
                }
                Err(source) => {
                    error!(run_id = %run_id, node = %node.name, error = %source, "Routing failed");
                    return Err(WorkflowError::NodeExecution {
                        node: node.name.clone(),
                        source,
                        state: next_state,
                        trace,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::graph::{GraphBuilder, MemoryCheckpointer};

    type Log = Vec<String>;

    fn push(name: &'static str) -> Node<Log> {
        Node::sync(name, move |mut log: Log| {
            log.push(name.to_string());
            Ok(log)
        })
    }

    fn line(names: &[&'static str]) -> GraphBuilder<Log> {
        let mut b = GraphBuilder::new();
        for n in names {
            b = b.add_node(push(n));
        }
        for pair in names.windows(2) {
            b = b.add_edge(pair[0], pair[1]);
        }
        b.set_entry(names[0]).set_finish(names[names.len() - 1])
    }

    #[tokio::test]
    async fn test_linear_run() {
        let graph = line(&["a", "b", "c"]).build().unwrap().compile();
        let result = graph.run(vec![]).await.unwrap();
        assert_eq!(result.trace, vec!["a", "b", "c"]);
        assert_eq!(result.state, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_router_sees_current_state() {
        let graph = GraphBuilder::new()
            .add_node(Node::sync("inc", |n: u32| Ok(n + 1)))
            .add_node(Node::sync("done", |n: u32| Ok(n * 10)))
            .add_conditional_edges(
                "inc",
                |n: &u32| if *n < 3 { "again".into() } else { "stop".into() },
                [("again", "inc"), ("stop", "done")],
            )
            .set_entry("inc")
            .set_finish("done")
            .max_revisits(5)
            .build()
            .unwrap()
            .compile();

        let result = graph.run(0).await.unwrap();
        assert_eq!(result.state, 30);
        assert_eq!(result.trace, vec!["inc", "inc", "inc", "done"]);
    }

    #[tokio::test]
    async fn test_revisit_limit() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let build = |revisits: Option<usize>| {
            let counter = counter.clone();
            let mut work = Node::sync("work", move |n: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(n + 1)
            });
            if let Some(r) = revisits {
                work = work.max_revisits(r);
            }
            GraphBuilder::new()
                .add_node(work)
                .add_node(Node::sync("done", Ok))
                .add_conditional_edges("work", |_: &u32| "again".into(), [("again", "work"), ("never", "done")])
                .set_entry("work")
                .set_finish("done")
                .build()
                .unwrap()
                .compile()
        };

        let err = build(None).run(0).await.unwrap_err();
        assert!(matches!(&err, WorkflowError::CycleLimit { node, limit: 1, .. } if node == "work"));
        assert_eq!(err.trace(), ["work"]);
        assert_eq!(*err.state(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let err = build(Some(2)).run(0).await.unwrap_err();
        assert!(matches!(err, WorkflowError::CycleLimit { limit: 3, .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_unbounded_revisits() {
        let graph = GraphBuilder::new()
            .add_node(Node::sync("work", |n: u32| Ok(n + 1)))
            .add_node(Node::sync("done", Ok))
            .add_conditional_edges(
                "work",
                |n: &u32| if *n < 5 { "again".into() } else { "stop".into() },
                [("again", "work"), ("stop", "done")],
            )
            .set_entry("work")
            .set_finish("done")
            .max_revisits(usize::MAX)
            .build()
            .unwrap()
            .compile();

        let result = graph.run(0).await.unwrap();
        assert_eq!(result.state, 5);
        assert_eq!(result.trace.len(), 6);
        assert_eq!(graph.node_names(), vec!["work", "done"]);

        let per_node = GraphBuilder::new()
            .add_node(Node::sync("work", |n: u32| Ok(n + 1)).max_revisits(usize::MAX))
            .add_node(Node::sync("done", Ok))
            .add_conditional_edges(
                "work",
                |n: &u32| if *n < 3 { "again".into() } else { "stop".into() },
                [("again", "work"), ("stop", "done")],
            )
            .set_entry("work")
            .set_finish("done")
            .build()
            .unwrap()
            .compile();
        assert_eq!(per_node.run(0).await.unwrap().state, 3);
    }

    #[tokio::test]
    async fn test_node_failure_keeps_partial_state() {
        let graph = GraphBuilder::new()
            .add_node(push("a"))
            .add_node(Node::sync("boom", |_: Log| Err(CryptoflowError::Node("bad input".into()))))
            .add_node(push("c"))
            .add_edge("a", "boom")
            .add_edge("boom", "c")
            .set_entry("a")
            .set_finish("c")
            .build()
            .unwrap()
            .compile();

        match graph.run(vec![]).await.unwrap_err() {
            WorkflowError::NodeExecution { node, source, state, trace } => {
                assert_eq!(node, "boom");
                assert!(source.to_string().contains("bad input"));
                assert_eq!(state, vec!["a"]);
                assert_eq!(trace, vec!["a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_branch_label() {
        let graph = GraphBuilder::new()
            .add_node(push("a"))
            .add_node(push("b"))
            .add_conditional_edges("a", |_: &Log| "missing".into(), [("ok", "b")])
            .set_entry("a")
            .set_finish("b")
            .build()
            .unwrap()
            .compile();
        let err = graph.run(vec![]).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NodeExecution { ref node, .. } if node == "a"));
    }

    #[tokio::test]
    async fn test_cancel_between_nodes() {
        let cancel = CancellationToken::new();
        let second_ran = Arc::new(AtomicBool::new(false));
        let (token, flag) = (cancel.clone(), second_ran.clone());

        let graph = GraphBuilder::new()
            .add_node(Node::sync("first", move |mut log: Log| {
                log.push("first".into());
                token.cancel();
                Ok(log)
            }))
            .add_node(Node::sync("second", move |log: Log| {
                flag.store(true, Ordering::SeqCst);
                Ok(log)
            }))
            .add_edge("first", "second")
            .set_entry("first")
            .set_finish("second")
            .build()
            .unwrap()
            .compile();

        let err = graph
            .run_with(vec![], RunOptions::new().with_cancel(cancel))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.trace(), ["first"]);
        assert!(!second_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_suspended_node() {
        let graph = GraphBuilder::new()
            .add_node(Node::new("wait", |n: u32| async move {
                futures::future::pending::<()>().await;
                Ok(n)
            }))
            .set_entry("wait")
            .set_finish("wait")
            .build()
            .unwrap()
            .compile();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = graph
            .run_with(5, RunOptions::new().with_cancel(cancel))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(err.trace().is_empty());
        assert_eq!(err.into_state(), 5);
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint() {
        let fail_once = Arc::new(AtomicBool::new(true));
        let first_runs = Arc::new(AtomicUsize::new(0));
        let (flag, count) = (fail_once.clone(), first_runs.clone());

        let graph = GraphBuilder::new()
            .add_node(Node::sync("first", move |mut log: Log| {
                count.fetch_add(1, Ordering::SeqCst);
                log.push("first".into());
                Ok(log)
            }))
            .add_node(Node::sync("flaky", move |mut log: Log| {
                if flag.swap(false, Ordering::SeqCst) {
                    return Err(CryptoflowError::Node("transient".into()));
                }
                log.push("flaky".into());
                Ok(log)
            }))
            .add_node(push("last"))
            .add_edge("first", "flaky")
            .add_edge("flaky", "last")
            .set_entry("first")
            .set_finish("last")
            .build()
            .unwrap()
            .compile();

        let store: Arc<MemoryCheckpointer<Log>> = Arc::new(MemoryCheckpointer::new());
        let run_id = RunId::from_str("resume-me");
        let options = || {
            RunOptions::new()
                .with_run_id(run_id.clone())
                .with_checkpointer(store.clone())
        };

        let err = graph.run_with(vec![], options()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NodeExecution { .. }));

        let result = graph.run_with(vec![], options().resume()).await.unwrap();
        assert_eq!(result.trace, vec!["first", "flaky", "last"]);
        assert_eq!(result.state, vec!["first", "flaky", "last"]);
        assert_eq!(first_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint_starts_fresh() {
        let graph = line(&["a", "b"]).build().unwrap().compile();
        let store: Arc<dyn Checkpointer<Log>> = Arc::new(MemoryCheckpointer::new());
        let result = graph
            .run_with(vec![], RunOptions::new().with_checkpointer(store).resume())
            .await
            .unwrap();
        assert_eq!(result.trace, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_publishes_node_events() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let graph = line(&["a", "b"]).build().unwrap().compile().with_event_bus(bus);

        graph.run(vec![]).await.unwrap();

        let mut started = Vec::new();
        let mut complete = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                AgentEvent::NodeStarted { node, .. } => started.push(node),
                AgentEvent::WorkflowComplete { trace, .. } => complete = Some(trace),
                _ => {}
            }
        }
        assert_eq!(started, vec!["a", "b"]);
        assert_eq!(complete, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_independent() {
        let graph = Arc::new(
            GraphBuilder::new()
                .add_node(Node::new("slow_double", |n: u64| async move {
                    tokio::time::sleep(std::time::Duration::from_millis(n % 5)).await;
                    Ok(n * 2)
                }))
                .add_node(Node::sync("inc", |n: u64| Ok(n + 1)))
                .add_edge("slow_double", "inc")
                .set_entry("slow_double")
                .set_finish("inc")
                .build()
                .unwrap()
                .compile(),
        );

        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let graph = graph.clone();
                tokio::spawn(async move { graph.run(i).await.map(|r| r.state) })
            })
            .collect();

        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.await.unwrap().unwrap(), i as u64 * 2 + 1);
        }
    }
}
