//! Dependency ordering of a batch of modules.

use std::collections::{BTreeSet, HashMap};

use crate::bus::TypeKey;

use super::Dependency;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The batch cannot be fully ordered. `sorted` holds the nodes Kahn's
    /// algorithm could place, `residual` the rest by priority.
    #[error("dependency cycle detected: {}", render_path(.path))]
    Cycle {
        path: Vec<TypeKey>,
        sorted: Vec<TypeKey>,
        residual: Vec<TypeKey>,
    },
}

impl GraphError {
    /// Best-effort order: the sortable prefix followed by the residual nodes.
    pub fn fallback_order(&self) -> Vec<TypeKey> {
        match self {
            GraphError::Cycle {
                sorted, residual, ..
            } => sorted.iter().chain(residual.iter()).copied().collect(),
        }
    }
}

fn render_path(path: &[TypeKey]) -> String {
    path.iter()
        .map(|key| key.short_name())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A module as seen by the graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub key: TypeKey,
    pub interfaces: Vec<TypeKey>,
    pub dependencies: Vec<Dependency>,
    pub priority: i32,
}

/// Edges run from a dependency to its dependents. Interface dependencies are
/// expanded to one edge per node of the batch providing the interface.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    keys: Vec<TypeKey>,
    priorities: Vec<i32>,
    dependents: Vec<Vec<usize>>,
    indegree: Vec<usize>,
}

impl DependencyGraph {
    pub fn build(nodes: &[GraphNode]) -> Self {
        let index: HashMap<TypeKey, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.key, i))
            .collect();

        let mut graph = DependencyGraph {
            keys: nodes.iter().map(|n| n.key).collect(),
            priorities: nodes.iter().map(|n| n.priority).collect(),
            dependents: vec![Vec::new(); nodes.len()],
            indegree: vec![0; nodes.len()],
        };

        for (dependent, node) in nodes.iter().enumerate() {
            for dependency in &node.dependencies {
                match dependency {
                    Dependency::Module(key) => {
                        if let Some(&provider) = index.get(key) {
                            graph.add_edge(provider, dependent);
                        }
                    }
                    Dependency::Interface(interface) => {
                        for (provider, candidate) in nodes.iter().enumerate() {
                            if candidate.key == *interface || candidate.interfaces.contains(interface)
                            {
                                graph.add_edge(provider, dependent);
                            }
                        }
                    }
                }
            }
        }
        graph
    }

    fn add_edge(&mut self, from: usize, to: usize) {
        if from == to || self.dependents[from].contains(&to) {
            return;
        }
        self.dependents[from].push(to);
        self.indegree[to] += 1;
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys of the nodes `key` depends on inside the batch.
    pub fn dependencies_of(&self, key: &TypeKey) -> Vec<TypeKey> {
        let Some(target) = self.keys.iter().position(|k| k == key) else {
            return Vec::new();
        };
        self.dependents
            .iter()
            .enumerate()
            .filter(|(_, dependents)| dependents.contains(&target))
            .map(|(provider, _)| self.keys[provider])
            .collect()
    }

    /// Kahn's algorithm. Among ready nodes, lower priority then batch order
    /// comes first, so the result is deterministic.
    pub fn sort(&self) -> Result<Vec<TypeKey>, GraphError> {
        let mut indegree = self.indegree.clone();
        let mut ready: BTreeSet<(i32, usize)> = indegree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| (self.priorities[i], i))
            .collect();

        let mut sorted = Vec::with_capacity(self.len());
        while let Some((_, node)) = ready.pop_first() {
            sorted.push(node);
            for &dependent in &self.dependents[node] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.insert((self.priorities[dependent], dependent));
                }
            }
        }

        if sorted.len() == self.len() {
            return Ok(sorted.into_iter().map(|i| self.keys[i]).collect());
        }

        let mut residual: Vec<usize> = (0..self.len()).filter(|i| indegree[*i] > 0).collect();
        let path = self.find_cycle(&indegree);
        residual.sort_by_key(|i| (self.priorities[*i], *i));
        Err(GraphError::Cycle {
            path: path.into_iter().map(|i| self.keys[i]).collect(),
            sorted: sorted.into_iter().map(|i| self.keys[i]).collect(),
            residual: residual.into_iter().map(|i| self.keys[i]).collect(),
        })
    }

    /// Depth-first search restricted to the nodes Kahn's algorithm left over.
    /// Returns the cycle with its first node repeated at the end.
    fn find_cycle(&self, indegree: &[usize]) -> Vec<usize> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            indegree: &[usize],
            node: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            marks[node] = Mark::OnStack;
            stack.push(node);
            for &next in &graph.dependents[node] {
                if indegree[next] == 0 {
                    continue;
                }
                match marks[next] {
                    Mark::OnStack => {
                        let start = stack.iter().position(|n| *n == next)?;
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(graph, indegree, next, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            stack.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.len()];
        let mut stack = Vec::new();
        for node in 0..self.len() {
            if indegree[node] > 0 && marks[node] == Mark::Unvisited {
                if let Some(cycle) = visit(self, indegree, node, &mut marks, &mut stack) {
                    return cycle;
                }
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct A;
    struct B;
    struct C;
    struct D;
    trait Storage {}

    fn node(key: TypeKey, dependencies: Vec<Dependency>) -> GraphNode {
        GraphNode {
            key,
            interfaces: Vec::new(),
            dependencies,
            priority: 0,
        }
    }

    #[test]
    fn dependencies_come_first() {
        let a = TypeKey::of::<A>();
        let b = TypeKey::of::<B>();
        let c = TypeKey::of::<C>();
        let graph = DependencyGraph::build(&[
            node(c, vec![Dependency::Module(b)]),
            node(b, vec![Dependency::Module(a)]),
            node(a, vec![]),
        ]);
        assert_eq!(graph.sort().unwrap(), vec![a, b, c]);
        assert_eq!(graph.dependencies_of(&b), vec![a]);
    }

    #[test]
    fn interface_dependencies_expand_to_providers() {
        let a = TypeKey::of::<A>();
        let b = TypeKey::of::<B>();
        let c = TypeKey::of::<C>();
        let storage = TypeKey::of::<dyn Storage>();
        let mut consumer = node(a, vec![Dependency::Interface(storage)]);
        consumer.priority = -10;
        let mut disk = node(b, vec![]);
        disk.interfaces.push(storage);
        let mut memory = node(c, vec![]);
        memory.interfaces.push(storage);

        let order = DependencyGraph::build(&[consumer, disk, memory]).sort().unwrap();
        assert_eq!(order.last(), Some(&a));
    }

    #[test]
    fn ready_nodes_follow_priority() {
        let a = TypeKey::of::<A>();
        let b = TypeKey::of::<B>();
        let mut first = node(a, vec![]);
        first.priority = 5;
        let second = node(b, vec![]);
        assert_eq!(DependencyGraph::build(&[first, second]).sort().unwrap(), vec![b, a]);
    }

    #[test]
    fn cycles_are_reported_with_a_fallback() {
        let a = TypeKey::of::<A>();
        let b = TypeKey::of::<B>();
        let c = TypeKey::of::<C>();
        let d = TypeKey::of::<D>();
        let graph = DependencyGraph::build(&[
            node(a, vec![Dependency::Module(b)]),
            node(b, vec![Dependency::Module(a)]),
            node(c, vec![]),
            node(d, vec![Dependency::Module(a)]),
        ]);
        let err = graph.sort().unwrap_err();
        let GraphError::Cycle {
            path,
            sorted,
            residual,
        } = &err;
        assert_eq!(path.len(), 3);
        assert_eq!(path.first(), path.last());
        assert!(path.contains(&a) && path.contains(&b));
        assert_eq!(sorted, &vec![c]);
        assert_eq!(residual, &vec![a, b, d]);
        assert_eq!(err.fallback_order(), vec![c, a, b, d]);
        assert!(err.to_string().starts_with("dependency cycle detected: "));
    }
}
