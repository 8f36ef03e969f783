use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use super::compiled::{CompiledGraph, Transition};
use super::edge::Edge;
use super::error::GraphDefinitionError;
use super::node::Node;

/// Declares nodes and edges. Nothing is checked until [`build`](Self::build).
pub struct GraphBuilder<S> {
    nodes: Vec<Node<S>>,
    edges: Vec<(String, Edge<S>)>,
    entries: Vec<String>,
    finishes: Vec<String>,
    max_revisits: usize,
}

impl<S: Send + 'static> GraphBuilder<S> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            entries: Vec::new(),
            finishes: Vec::new(),
            max_revisits: 0,
        }
    }

    pub fn add_node(mut self, node: Node<S>) -> Self {
        self.nodes.push(node);
        self
    }

    /// Unconditional transition `from -> to`.
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), Edge::to(to)));
        self
    }

    /// Branch on the label `router` returns for the state `from` produced.
    pub fn add_conditional_edges<F, I, L, T>(
        mut self,
        from: impl Into<String>,
        router: F,
        branches: I,
    ) -> Self
    where
        F: Fn(&S) -> String + Send + Sync + 'static,
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: Into<String>,
    {
        self.edges
            .push((from.into(), Edge::conditional(router, branches)));
        self
    }

    pub fn set_entry(mut self, name: impl Into<String>) -> Self {
        self.entries.push(name.into());
        self
    }

    /// Mark a node as terminal. A run ends once a finish node has run.
    pub fn set_finish(mut self, name: impl Into<String>) -> Self {
        self.finishes.push(name.into());
        self
    }

    /// How many times any node may run again within one run (default 0).
    pub fn max_revisits(mut self, revisits: usize) -> Self {
        self.max_revisits = revisits;
        self
    }

    /// Validate the declaration, collecting every violation.
    pub fn build(self) -> Result<Graph<S>, GraphDefinitionError> {
        let mut violations = Vec::new();

        let mut index: HashMap<String, usize> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if index.insert(node.name.clone(), i).is_some() {
                violations.push(format!("duplicate node: {}", node.name));
            }
        }
        if self.nodes.is_empty() {
            violations.push("graph has no nodes".to_string());
        }

        match self.entries.len() {
            0 => violations.push("no entry node declared".to_string()),
            1 => {}
            _ => violations.push(format!(
                "multiple entry nodes declared: {}",
                self.entries.join(", ")
            )),
        }
        for name in &self.entries {
            if !index.contains_key(name) {
                violations.push(format!("entry node not registered: {name}"));
            }
        }

        if self.finishes.is_empty() {
            violations.push("no finish node declared".to_string());
        }
        for name in &self.finishes {
            if !index.contains_key(name) {
                violations.push(format!("finish node not registered: {name}"));
            }
        }

        let mut outgoing: HashMap<&str, Vec<&Edge<S>>> = HashMap::new();
        for (from, edge) in &self.edges {
            if !index.contains_key(from) {
                violations.push(format!("edge from unregistered node: {from}"));
            }
            for target in edge.targets() {
                if !index.contains_key(target) {
                    violations.push(format!(
                        "edge from '{from}' to unregistered node: {target}"
                    ));
                }
            }
            if edge.targets().is_empty() {
                violations.push(format!("conditional edge from '{from}' has no branches"));
            }
            outgoing.entry(from.as_str()).or_default().push(edge);
        }

        let finishes: HashSet<&str> = self.finishes.iter().map(|s| s.as_str()).collect();
        for node in &self.nodes {
            let name = node.name.as_str();
            let count = outgoing.get(name).map_or(0, |e| e.len());
            if count > 1 {
                violations.push(format!("node '{name}' has more than one outgoing edge"));
            }
            if count > 0 && finishes.contains(name) {
                violations.push(format!("finish node '{name}' has an outgoing edge"));
            }
        }

        if let [entry] = self.entries.as_slice() {
            if index.contains_key(entry) {
                let reached = reachable(entry, &outgoing);
                for node in &self.nodes {
                    let name = node.name.as_str();
                    if !reached.contains(name) {
                        violations.push(format!("unreachable node: {name}"));
                    } else if !finishes.contains(name) && !outgoing.contains_key(name) {
                        violations.push(format!(
                            "node '{name}' has no outgoing edge and is not a finish node"
                        ));
                    }
                }
                for name in static_cycles(&self.nodes, &outgoing) {
                    violations.push(format!("static edge cycle through '{name}' never finishes"));
                }
            }
        }

        if !violations.is_empty() {
            return Err(GraphDefinitionError { violations });
        }

        let mut edges: Vec<Option<Edge<S>>> = self.nodes.iter().map(|_| None).collect();
        for (from, edge) in self.edges {
            edges[index[&from]] = Some(edge);
        }
        let finish: Vec<bool> = self
            .nodes
            .iter()
            .map(|n| finishes.contains(n.name.as_str()))
            .collect();
        let entry = index[&self.entries[0]];

        debug!(nodes = self.nodes.len(), "Graph validated");
        Ok(Graph {
            nodes: self.nodes,
            edges,
            finish,
            entry,
            index,
            max_revisits: self.max_revisits,
        })
    }
}

impl<S: Send + 'static> Default for GraphBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn reachable<'a, S>(entry: &'a str, outgoing: &HashMap<&'a str, Vec<&'a Edge<S>>>) -> HashSet<&'a str> {
    let mut seen = HashSet::from([entry]);
    let mut queue = VecDeque::from([entry]);
    while let Some(name) = queue.pop_front() {
        for edge in outgoing.get(name).into_iter().flatten().copied() {
            for target in edge.targets() {
                if seen.insert(target) {
                    queue.push_back(target);
                }
            }
        }
    }
    seen
}

/// Nodes that lead back to themselves through static edges only. Each cycle
/// is reported once, under its first declared member.
fn static_cycles<'a, S>(nodes: &'a [Node<S>], outgoing: &HashMap<&str, Vec<&'a Edge<S>>>) -> Vec<&'a str> {
    let order: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.name.as_str(), i))
        .collect();
    let next = |name: &str| -> Option<&'a str> {
        match outgoing.get(name).map(|e| e.as_slice()) {
            Some([Edge::Static(to)]) => Some(to.as_str()),
            _ => None,
        }
    };

    let mut out = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        let start = node.name.as_str();
        let mut current = start;
        let mut members = vec![i];
        for _ in 0..nodes.len() {
            let Some(to) = next(current) else { break };
            if to == start {
                if members.iter().min() == Some(&i) {
                    out.push(start);
                }
                break;
            }
            match order.get(to) {
                Some(&j) => members.push(j),
                None => break,
            }
            current = to;
        }
    }
    out
}

/// A validated graph, ready to compile.
pub struct Graph<S> {
    nodes: Vec<Node<S>>,
    edges: Vec<Option<Edge<S>>>,
    finish: Vec<bool>,
    entry: usize,
    index: HashMap<String, usize>,
    max_revisits: usize,
}

impl<S> Graph<S> {
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn entry(&self) -> &str {
        &self.nodes[self.entry].name
    }

    /// Resolve edges to node ids and produce the execution plan.
    pub fn compile(self) -> CompiledGraph<S> {
        let index = self.index;
        let transitions = self
            .edges
            .into_iter()
            .zip(&self.finish)
            .map(|(edge, finish)| match edge {
                _ if *finish => Transition::Finish,
                Some(Edge::Static(to)) => Transition::Next(index[&to]),
                Some(Edge::Conditional { router, branches }) => Transition::Branch {
                    router,
                    branches: branches
                        .into_iter()
                        .map(|(label, to)| (label, index[&to]))
                        .collect(),
                },
                None => Transition::Finish,
            })
            .collect();

        CompiledGraph::from_parts(self.nodes, transitions, self.entry, index, self.max_revisits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str) -> Node<u32> {
        Node::sync(name, |n: u32| Ok(n + 1))
    }

    fn violations(builder: GraphBuilder<u32>) -> Vec<String> {
        match builder.build() {
            Ok(_) => panic!("graph should be invalid"),
            Err(e) => e.violations,
        }
    }

    #[test]
    fn test_valid_line() {
        let graph = GraphBuilder::new()
            .add_node(step("a"))
            .add_node(step("b"))
            .add_edge("a", "b")
            .set_entry("a")
            .set_finish("b")
            .build()
            .unwrap();
        assert_eq!(graph.node_names(), vec!["a", "b"]);
        assert_eq!(graph.entry(), "a");
    }

    #[test]
    fn test_dead_end_node_rejected() {
        let v = violations(
            GraphBuilder::new()
                .add_node(step("a"))
                .add_node(step("b"))
                .add_node(step("c"))
                .add_edge("a", "b")
                .add_conditional_edges("a", |_| "x".into(), [("x", "c")])
                .set_entry("a")
                .set_finish("c"),
        );
        assert!(v.contains(&"node 'b' has no outgoing edge and is not a finish node".to_string()));
        assert!(v.contains(&"node 'a' has more than one outgoing edge".to_string()));
    }

    #[test]
    fn test_two_entries_rejected() {
        let v = violations(
            GraphBuilder::new()
                .add_node(step("a"))
                .add_node(step("b"))
                .add_edge("a", "b")
                .set_entry("a")
                .set_entry("b")
                .set_finish("b"),
        );
        assert_eq!(v, vec!["multiple entry nodes declared: a, b".to_string()]);
    }

    #[test]
    fn test_all_violations_reported() {
        let v = violations(
            GraphBuilder::new()
                .add_node(step("a"))
                .add_node(step("a"))
                .add_node(step("orphan"))
                .add_edge("a", "ghost")
                .add_edge("nowhere", "a")
                .set_entry("a"),
        );
        assert!(v.contains(&"duplicate node: a".to_string()));
        assert!(v.contains(&"no finish node declared".to_string()));
        assert!(v.contains(&"edge from 'a' to unregistered node: ghost".to_string()));
        assert!(v.contains(&"edge from unregistered node: nowhere".to_string()));
        assert!(v.contains(&"unreachable node: orphan".to_string()));
    }

    #[test]
    fn test_missing_entry_and_finish() {
        let v = violations(GraphBuilder::new().add_node(step("a")));
        assert!(v.contains(&"no entry node declared".to_string()));
        assert!(v.contains(&"no finish node declared".to_string()));
    }

    #[test]
    fn test_static_cycle_rejected() {
        let v = violations(
            GraphBuilder::new()
                .add_node(step("a"))
                .add_node(step("b"))
                .add_node(step("c"))
                .add_node(step("done"))
                .add_edge("a", "b")
                .add_edge("b", "c")
                .add_edge("c", "b")
                .add_conditional_edges("done", |_| "x".into(), [("x", "a")])
                .set_entry("a")
                .set_finish("done"),
        );
        assert!(v.contains(&"static edge cycle through 'b' never finishes".to_string()));
        assert!(v.contains(&"finish node 'done' has an outgoing edge".to_string()));
        assert!(v.contains(&"unreachable node: done".to_string()));
        assert_eq!(v.iter().filter(|s| s.contains("cycle")).count(), 1);
    }

    #[test]
    fn test_conditional_cycle_allowed() {
        let graph = GraphBuilder::new()
            .add_node(step("work"))
            .add_node(step("check"))
            .add_node(step("done"))
            .add_edge("work", "check")
            .add_conditional_edges(
                "check",
                |n: &u32| if *n < 4 { "again".into() } else { "ok".into() },
                [("again", "work"), ("ok", "done")],
            )
            .set_entry("work")
            .set_finish("done")
            .build();
        assert!(graph.is_ok());
    }
}
