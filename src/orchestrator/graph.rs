//! Service dependency graph
//!
//! Services live in an arena indexed by declaration order; edges are index
//! lists in both directions. Nothing holds references to other nodes, so a
//! cyclic configuration cannot create cyclic ownership.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::config::ServiceSpec;
use crate::error::{Error, Result};

/// One service and its edges
#[derive(Debug, Clone)]
pub struct ServiceNode {
    pub spec: ServiceSpec,
    /// Indices of services this one requires healthy first
    pub dependencies: Vec<usize>,
    /// Indices of services that require this one
    pub dependents: Vec<usize>,
}

/// Arena of services with index-based edges
#[derive(Debug, Clone, Default)]
pub struct ServiceGraph {
    nodes: Vec<ServiceNode>,
    index: HashMap<String, usize>,
}

impl ServiceGraph {
    /// Build the graph. Rejects duplicate names and undeclared dependencies;
    /// cycles are reported by [`ServiceGraph::topological_order`].
    pub fn new(services: &[ServiceSpec]) -> Result<Self> {
        let mut index = HashMap::with_capacity(services.len());
        for (i, spec) in services.iter().enumerate() {
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(Error::DuplicateService(spec.name.clone()));
            }
        }

        let mut nodes: Vec<ServiceNode> = services
            .iter()
            .map(|spec| ServiceNode {
                spec: spec.clone(),
                dependencies: Vec::new(),
                dependents: Vec::new(),
            })
            .collect();

        for (i, spec) in services.iter().enumerate() {
            for dep in &spec.depends_on {
                let j = *index.get(dep).ok_or_else(|| Error::UnknownDependency {
                    service: spec.name.clone(),
                    dependency: dep.clone(),
                })?;
                // Repeated entries in depends_on collapse to one edge
                if !nodes[i].dependencies.contains(&j) {
                    nodes[i].dependencies.push(j);
                    nodes[j].dependents.push(i);
                }
            }
        }

        Ok(Self { nodes, index })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &ServiceNode {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[ServiceNode] {
        &self.nodes
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, idx: usize) -> &str {
        &self.nodes[idx].spec.name
    }

    /// Kahn's algorithm. Among services that are ready at the same time the
    /// earliest declared comes first, so the order is reproducible.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &dependent in &self.nodes[i].dependents {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            Err(Error::Cycle {
                services: self.find_cycle(&in_degree),
            })
        }
    }

    /// Topological order as service names
    pub fn start_order(&self) -> Result<Vec<String>> {
        Ok(self
            .topological_order()?
            .into_iter()
            .map(|i| self.name(i).to_string())
            .collect())
    }

    /// Names one cycle among the nodes Kahn's algorithm could not place.
    /// The first name is repeated at the end: `a -> b -> a`.
    fn find_cycle(&self, in_degree: &[usize]) -> Vec<String> {
        let Some(start) = in_degree.iter().position(|&d| d > 0) else {
            return Vec::new();
        };

        // Every stuck node has a stuck dependency, so following them must
        // revisit a node.
        let mut position: HashMap<usize, usize> = HashMap::new();
        let mut path = Vec::new();
        let mut current = start;
        while !position.contains_key(&current) {
            position.insert(current, path.len());
            path.push(current);
            current = match self.nodes[current]
                .dependencies
                .iter()
                .copied()
                .find(|&d| in_degree[d] > 0)
            {
                Some(next) => next,
                None => return vec![self.name(current).to_string()],
            };
        }

        let first = position[&current];
        let mut cycle: Vec<String> = path[first..]
            .iter()
            .rev()
            .map(|&i| self.name(i).to_string())
            .collect();
        cycle.rotate_right(1);
        cycle.push(cycle[0].clone());
        cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchDescriptor;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn svc(name: &str, deps: &[&str]) -> ServiceSpec {
        ServiceSpec::new(name, LaunchDescriptor::Builtin).depends_on(deps.iter().copied())
    }

    // =========================================================================
    // Construction Tests
    // =========================================================================

    #[test]
    fn test_edges_built_both_ways() {
        let graph = ServiceGraph::new(&[svc("a", &[]), svc("b", &["a", "a"])]).unwrap();
        assert_eq!(graph.node(1).dependencies, vec![0]);
        assert_eq!(graph.node(0).dependents, vec![1]);
        assert_eq!(graph.index_of("b"), Some(1));
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_duplicate_and_unknown_rejected() {
        assert_matches!(
            ServiceGraph::new(&[svc("a", &[]), svc("a", &[])]),
            Err(Error::DuplicateService(_))
        );
        assert_matches!(
            ServiceGraph::new(&[svc("a", &["missing"])]),
            Err(Error::UnknownDependency { .. })
        );
    }

    // =========================================================================
    // Ordering Tests
    // =========================================================================

    #[test]
    fn test_simple_chain() {
        let graph = ServiceGraph::new(&[svc("b", &["a"]), svc("a", &[])]).unwrap();
        assert_eq!(graph.start_order().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_declaration_order_tie_break() {
        let graph = ServiceGraph::new(&[
            svc("grafana", &["collector"]),
            svc("webapp", &["statsd"]),
            svc("node-exporter", &[]),
            svc("statsd", &[]),
            svc("cadvisor", &[]),
            svc("collector", &["webapp", "node-exporter", "cadvisor"]),
        ])
        .unwrap();

        assert_eq!(
            graph.start_order().unwrap(),
            vec![
                "node-exporter",
                "statsd",
                "webapp",
                "cadvisor",
                "collector",
                "grafana"
            ]
        );
    }

    #[test]
    fn test_empty_graph() {
        let graph = ServiceGraph::new(&[]).unwrap();
        assert!(graph.is_empty());
        assert!(graph.topological_order().unwrap().is_empty());
    }

    // =========================================================================
    // Cycle Tests
    // =========================================================================

    #[test]
    fn test_self_dependency_is_cycle() {
        let graph = ServiceGraph::new(&[svc("a", &["a"])]).unwrap();
        assert_matches!(
            graph.topological_order(),
            Err(Error::Cycle { services }) if services == vec!["a", "a"]
        );
    }

    #[test]
    fn test_cycle_named() {
        let graph = ServiceGraph::new(&[
            svc("root", &[]),
            svc("a", &["c", "root"]),
            svc("b", &["a"]),
            svc("c", &["b"]),
            svc("tail", &["c"]),
        ])
        .unwrap();

        let err = graph.topological_order().unwrap_err();
        let Error::Cycle { services } = err else {
            panic!("expected cycle error");
        };
        assert_eq!(services.first(), services.last());
        assert_eq!(services.len(), 4);
        for name in ["a", "b", "c"] {
            assert!(services.contains(&name.to_string()));
        }
        assert!(!services.contains(&"tail".to_string()));
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Random DAG: each node may depend only on earlier-indexed nodes, then
    /// the declaration order is shuffled by reversing.
    fn dag_strategy() -> impl Strategy<Value = Vec<ServiceSpec>> {
        (1usize..12)
            .prop_flat_map(|n| {
                prop::collection::vec(prop::collection::vec(any::<bool>(), n), n)
            })
            .prop_map(|matrix| {
                let n = matrix.len();
                let mut services: Vec<ServiceSpec> = (0..n)
                    .map(|i| {
                        let deps: Vec<String> = (0..i)
                            .filter(|&j| matrix[i][j])
                            .map(|j| format!("s{}", j))
                            .collect();
                        ServiceSpec::new(format!("s{}", i), LaunchDescriptor::Builtin)
                            .depends_on(deps)
                    })
                    .collect();
                services.reverse();
                services
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_order_respects_dependencies(services in dag_strategy()) {
            let graph = ServiceGraph::new(&services).unwrap();
            let order = graph.start_order().unwrap();
            prop_assert_eq!(order.len(), services.len());

            let position: HashMap<&str, usize> =
                order.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
            for spec in &services {
                for dep in &spec.depends_on {
                    prop_assert!(position[dep.as_str()] < position[spec.name.as_str()]);
                }
            }
        }

        #[test]
        fn prop_back_edge_creates_cycle(services in dag_strategy()) {
            // s0 is declared last after reversal; make it depend on every other
            // service that (transitively) depends on it.
            let mut services = services;
            let has_dependent = services.iter().any(|s| s.depends_on.contains(&"s0".to_string()));
            prop_assume!(has_dependent);
            let dependent = services
                .iter()
                .find(|s| s.depends_on.contains(&"s0".to_string()))
                .map(|s| s.name.clone())
                .unwrap();
            let last = services.len() - 1;
            services[last].depends_on.push(dependent);

            let graph = ServiceGraph::new(&services).unwrap();
            let is_cycle = matches!(graph.topological_order(), Err(Error::Cycle { .. }));
            prop_assert!(is_cycle);
        }
    }
}
