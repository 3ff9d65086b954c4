//! Dependency graph construction and ordering.
//!
//! Edges run from a dependency to the resources that depend on it, so a
//! topological order is a valid creation order.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::PlanError;
use crate::resource::{ResourceDescriptor, ResourceId};

/// Origin label for an edge declared with `depends_on`.
pub const DEPENDS_ON: &str = "depends_on";

/// Directed graph of "must exist before" relations between resources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// All resource ids.
    nodes: BTreeSet<ResourceId>,
    /// dependency -> dependents.
    dependents: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
    /// dependent -> dependencies.
    dependencies: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
    /// Property paths (or `depends_on`) that produced each edge.
    origins: BTreeMap<(ResourceId, ResourceId), Vec<String>>,
}

impl DependencyGraph {
    /// Builds and checks the graph for a set of descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownReference`] when a descriptor points at an
    /// id outside the set and [`PlanError::Cycle`] when the graph is not
    /// acyclic. A resource referencing its own attributes is a cycle.
    pub fn build(descriptors: &[ResourceDescriptor]) -> Result<Self, PlanError> {
        let graph = Self::build_unchecked(descriptors, false)?;
        graph.ensure_acyclic()?;
        Ok(graph)
    }

    /// Builds the graph of previously recorded resources.
    ///
    /// Edges towards resources that were never recorded are skipped: those
    /// resources have nothing to delete.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] if the recorded graph is cyclic.
    pub fn build_recorded(descriptors: &[ResourceDescriptor]) -> Result<Self, PlanError> {
        let graph = Self::build_unchecked(descriptors, true)?;
        graph.ensure_acyclic()?;
        Ok(graph)
    }

    fn build_unchecked(
        descriptors: &[ResourceDescriptor],
        skip_unknown: bool,
    ) -> Result<Self, PlanError> {
        let mut graph = Self {
            nodes: descriptors.iter().map(|d| d.id.clone()).collect(),
            ..Self::default()
        };

        for descriptor in descriptors {
            let explicit = descriptor
                .depends_on
                .iter()
                .map(|id| (DEPENDS_ON.to_string(), id));
            let referenced = descriptor
                .references()
                .into_iter()
                .map(|(path, reference)| (path, &reference.resource));

            for (origin, dependency) in referenced.chain(explicit) {
                if !graph.nodes.contains(dependency) {
                    if skip_unknown {
                        debug!(
                            "Skipping recorded edge {dependency} -> {}: not recorded",
                            descriptor.id
                        );
                        continue;
                    }
                    return Err(PlanError::UnknownReference {
                        resource: descriptor.id.clone(),
                        referenced: dependency.clone(),
                    });
                }
                graph.add_edge(dependency.clone(), descriptor.id.clone(), origin);
            }
        }

        debug!(
            "Built dependency graph: {} nodes, {} edges",
            graph.nodes.len(),
            graph.edge_count()
        );
        Ok(graph)
    }

    fn add_edge(&mut self, from: ResourceId, to: ResourceId, origin: String) {
        self.dependents
            .entry(from.clone())
            .or_default()
            .insert(to.clone());
        self.dependencies
            .entry(to.clone())
            .or_default()
            .insert(from.clone());
        self.origins.entry((from, to)).or_default().push(origin);
    }

    /// Returns the resource ids in ascending order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceId> {
        self.nodes.iter()
    }

    /// Returns true if the graph holds `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains(id)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the number of distinct edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.origins.len()
    }

    /// Returns all edges as `(dependency, dependent, origins)`.
    pub fn edges(&self) -> impl Iterator<Item = (&ResourceId, &ResourceId, &[String])> {
        self.origins
            .iter()
            .map(|((from, to), origins)| (from, to, origins.as_slice()))
    }

    /// Returns the direct dependencies of `id`.
    #[must_use]
    pub fn dependencies_of(&self, id: &str) -> BTreeSet<ResourceId> {
        self.dependencies.get(id).cloned().unwrap_or_default()
    }

    /// Returns the direct dependents of `id`.
    #[must_use]
    pub fn dependents_of(&self, id: &str) -> BTreeSet<ResourceId> {
        self.dependents.get(id).cloned().unwrap_or_default()
    }

    /// Returns every resource that transitively depends on `id`.
    #[must_use]
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<ResourceId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&ResourceId> = self
            .dependents
            .get(id)
            .map(|d| d.iter().collect())
            .unwrap_or_default();

        while let Some(next) = stack.pop() {
            if seen.insert(next.clone())
                && let Some(more) = self.dependents.get(next)
            {
                stack.extend(more.iter());
            }
        }
        seen
    }

    /// Finds a cycle, returning the ids along it in traversal order.
    ///
    /// Nodes and successors are visited in ascending id order, so the same
    /// graph always reports the same cycle.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<ResourceId>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let empty: BTreeSet<ResourceId> = BTreeSet::new();
        let mut marks: BTreeMap<&ResourceId, Mark> =
            self.nodes.iter().map(|n| (n, Mark::Unvisited)).collect();

        for root in &self.nodes {
            if marks.get(root) != Some(&Mark::Unvisited) {
                continue;
            }

            // Iterative DFS; `path` mirrors the recursion stack.
            let mut path: Vec<&ResourceId> = vec![root];
            let mut iters = vec![self.dependents.get(root).unwrap_or(&empty).iter()];
            marks.insert(root, Mark::OnStack);

            while let Some(successors) = iters.last_mut() {
                match successors.next() {
                    Some(next) => match marks.get(next).copied().unwrap_or(Mark::Done) {
                        Mark::OnStack => {
                            let start = path.iter().position(|n| *n == next).unwrap_or(0);
                            return Some(path[start..].iter().map(|n| (*n).clone()).collect());
                        }
                        Mark::Unvisited => {
                            marks.insert(next, Mark::OnStack);
                            path.push(next);
                            iters.push(self.dependents.get(next).unwrap_or(&empty).iter());
                        }
                        Mark::Done => {}
                    },
                    None => {
                        iters.pop();
                        if let Some(done) = path.pop() {
                            marks.insert(done, Mark::Done);
                        }
                    }
                }
            }
        }

        None
    }

    /// Fails with [`PlanError::Cycle`] if the graph contains a cycle.
    ///
    /// # Errors
    ///
    /// Returns the cycle found by [`Self::find_cycle`].
    pub fn ensure_acyclic(&self) -> Result<(), PlanError> {
        match self.find_cycle() {
            Some(cycle) => Err(PlanError::Cycle { cycle }),
            None => Ok(()),
        }
    }

    /// Returns a stable topological order: dependencies first, ties broken
    /// by ascending id.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] if the graph is cyclic.
    pub fn topological_order(&self) -> Result<Vec<ResourceId>, PlanError> {
        let mut in_degree: BTreeMap<&ResourceId, usize> = self
            .nodes
            .iter()
            .map(|n| (n, self.dependencies.get(n).map_or(0, BTreeSet::len)))
            .collect();

        let mut ready: BTreeSet<&ResourceId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(next) = ready.pop_first() {
            order.push(next.clone());
            for dependent in self.dependents.get(next).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            self.ensure_acyclic()?;
        }
        Ok(order)
    }

    /// Renders the graph in Graphviz DOT format.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph stack {\n    rankdir=LR;\n");
        for node in &self.nodes {
            out.push_str(&format!("    \"{node}\";\n"));
        }
        for ((from, to), origins) in &self.origins {
            out.push_str(&format!(
                "    \"{from}\" -> \"{to}\" [label=\"{}\"];\n",
                origins.join(", ")
            ));
        }
        out.push('}');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceType, Value};

    fn database(id: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(id, ResourceType::Database)
    }

    fn service(id: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(id, ResourceType::ContainerService)
    }

    fn ids(order: &[ResourceId]) -> Vec<&str> {
        order.iter().map(ResourceId::as_str).collect()
    }

    #[test]
    fn test_reference_creates_edge() {
        let graph = DependencyGraph::build(&[
            database("a"),
            service("b").with_property("db_host", Value::reference("a", "endpoint")),
        ])
        .unwrap();

        assert_eq!(graph.edge_count(), 1);
        assert!(graph.dependents_of("a").contains("b"));
        assert!(graph.dependencies_of("b").contains("a"));
        assert_eq!(ids(&graph.topological_order().unwrap()), vec!["a", "b"]);
    }

    #[test]
    fn test_one_edge_per_pair_with_all_origins() {
        let graph = DependencyGraph::build(&[
            database("db"),
            service("api")
                .with_property("host", Value::reference("db", "endpoint"))
                .with_property("port", Value::reference("db", "port"))
                .with_dependency("db"),
        ])
        .unwrap();

        assert_eq!(graph.edge_count(), 1);
        let (_, _, origins) = graph.edges().next().unwrap();
        assert_eq!(origins, ["host", "port", DEPENDS_ON]);
    }

    #[test]
    fn test_nested_references_are_found() {
        let graph = DependencyGraph::build(&[
            database("db"),
            ResourceDescriptor::new("secret", ResourceType::Secret),
            service("api").with_property(
                "env",
                Value::List(vec![
                    Value::reference("db", "endpoint"),
                    Value::List(vec![Value::reference("secret", "arn")]),
                ]),
            ),
        ])
        .unwrap();

        assert_eq!(graph.edge_count(), 2);
        assert_eq!(
            ids(&graph.topological_order().unwrap()),
            vec!["db", "secret", "api"]
        );
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let result = DependencyGraph::build(&[
            service("api").with_property("host", Value::reference("missing", "endpoint")),
        ]);
        assert!(matches!(
            result,
            Err(PlanError::UnknownReference { referenced, .. }) if referenced.as_str() == "missing"
        ));
    }

    #[test]
    fn test_recorded_graph_skips_unknown() {
        let graph = DependencyGraph::build_recorded(&[
            service("api").with_property("host", Value::reference("gone", "endpoint")),
        ])
        .unwrap();
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let result = DependencyGraph::build(&[
            service("c").with_property("me", Value::reference("c", "self_attr")),
        ]);
        match result {
            Err(PlanError::Cycle { cycle }) => assert_eq!(ids(&cycle), vec!["c"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_multi_hop_cycle_reports_path() {
        let result = DependencyGraph::build(&[
            service("x").with_property("p", Value::reference("z", "out")),
            service("y").with_property("p", Value::reference("x", "out")),
            service("z").with_property("p", Value::reference("y", "out")),
            database("unrelated"),
        ]);
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "Dependency cycle detected: x -> y -> z -> x");
        let PlanError::Cycle { cycle } = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(ids(&cycle), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_topological_order_is_stable() {
        // d and e are independent; f depends on both.
        let descriptors = vec![
            service("f")
                .with_property("a", Value::reference("e", "out"))
                .with_property("b", Value::reference("d", "out")),
            database("e"),
            database("d"),
        ];
        let graph = DependencyGraph::build(&descriptors).unwrap();
        let order = graph.topological_order().unwrap();
        assert_eq!(ids(&order), vec!["d", "e", "f"]);

        let mut reversed = descriptors;
        reversed.reverse();
        let again = DependencyGraph::build(&reversed).unwrap();
        assert_eq!(again.topological_order().unwrap(), order);
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = DependencyGraph::build(&[
            ResourceDescriptor::new("vpc", ResourceType::Network),
            database("db").with_dependency("vpc"),
            service("api").with_property("host", Value::reference("db", "endpoint")),
            ResourceDescriptor::new("logs", ResourceType::LogGroup),
        ])
        .unwrap();

        let dependents = graph.transitive_dependents("vpc");
        assert_eq!(dependents.len(), 2);
        assert!(dependents.contains("api"));
        assert!(!dependents.contains("logs"));
    }

    #[test]
    fn test_dot_output() {
        let graph = DependencyGraph::build(&[
            database("db"),
            service("api").with_property("host", Value::reference("db", "endpoint")),
        ])
        .unwrap();
        let dot = graph.to_dot();
        assert!(dot.contains("\"db\" -> \"api\" [label=\"host\"]"));
    }
}
