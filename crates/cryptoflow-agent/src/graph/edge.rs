use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) type Router<S> = Arc<dyn Fn(&S) -> String + Send + Sync>;

/// Outgoing transition of a node.
pub enum Edge<S> {
    /// Always continue to `to`.
    Static(String),
    /// Ask `router` for a label and continue to the node it maps to.
    Conditional {
        router: Router<S>,
        branches: BTreeMap<String, String>,
    },
}

impl<S> Edge<S> {
    pub fn to(target: impl Into<String>) -> Self {
        Edge::Static(target.into())
    }

    pub fn conditional<F, I, L, T>(router: F, branches: I) -> Self
    where
        F: Fn(&S) -> String + Send + Sync + 'static,
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: Into<String>,
    {
        Edge::Conditional {
            router: Arc::new(router),
            branches: branches
                .into_iter()
                .map(|(l, t)| (l.into(), t.into()))
                .collect(),
        }
    }

    /// Every node this edge can lead to.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Edge::Static(to) => vec![to.as_str()],
            Edge::Conditional { branches, .. } => branches.values().map(|s| s.as_str()).collect(),
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, Edge::Static(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets() {
        let e: Edge<u8> = Edge::to("b");
        assert_eq!(e.targets(), vec!["b"]);
        assert!(e.is_static());

        let e: Edge<u8> = Edge::conditional(
            |n| if *n > 1 { "big".into() } else { "small".into() },
            [("big", "x"), ("small", "y")],
        );
        assert_eq!(e.targets(), vec!["x", "y"]);
        assert!(!e.is_static());
    }
}
