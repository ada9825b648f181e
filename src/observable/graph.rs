//! Dependency graph between references.
//!
//! Tracks `input -> dependents` edges and refuses edges that would close a
//! cycle. Propagation order is topological. Configuration tables use the same
//! graph to reject motor paths and table links that refer back to themselves.

use crate::error::{AppResult, DaqError};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Display;

/// Directed acyclic graph of `node -> dependents`.
#[derive(Debug, Clone)]
pub struct DependencyGraph<N: Ord + Clone + Display> {
    dependents: BTreeMap<N, BTreeSet<N>>,
}

impl<N: Ord + Clone + Display> Default for DependencyGraph<N> {
    fn default() -> Self {
        Self {
            dependents: BTreeMap::new(),
        }
    }
}

impl<N: Ord + Clone + Display> DependencyGraph<N> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `dependent` is computed from `input`.
    ///
    /// Fails with [`DaqError::DependencyCycle`] if `input` is already reachable
    /// from `dependent`.
    pub fn add_dependency(&mut self, input: N, dependent: N) -> AppResult<()> {
        if input == dependent || self.reaches(&dependent, &input) {
            return Err(DaqError::DependencyCycle(dependent.to_string()));
        }
        self.dependents.entry(dependent.clone()).or_default();
        self.dependents.entry(input).or_default().insert(dependent);
        Ok(())
    }

    /// Remove a node and all its edges.
    pub fn remove(&mut self, node: &N) {
        self.dependents.remove(node);
        for set in self.dependents.values_mut() {
            set.remove(node);
        }
    }

    fn reaches(&self, from: &N, to: &N) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([from.clone()]);
        while let Some(node) = queue.pop_front() {
            if &node == to {
                return true;
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            if let Some(next) = self.dependents.get(&node) {
                queue.extend(next.iter().cloned());
            }
        }
        false
    }

    /// Direct dependents of a node.
    pub fn dependents_of(&self, node: &N) -> Vec<N> {
        self.dependents
            .get(node)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All nodes in topological order (inputs before dependents).
    pub fn topological_order(&self) -> Vec<N> {
        let mut in_degree: BTreeMap<&N, usize> = self.dependents.keys().map(|n| (n, 0)).collect();
        for set in self.dependents.values() {
            for dependent in set {
                *in_degree.entry(dependent).or_insert(0) += 1;
            }
        }
        let mut ready: VecDeque<&N> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(node) = ready.pop_front() {
            order.push(node.clone());
            if let Some(next) = self.dependents.get(node) {
                for dependent in next {
                    if let Some(d) = in_degree.get_mut(dependent) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push_back(dependent);
                        }
                    }
                }
            }
        }
        order
    }

    /// Everything downstream of `node`, in propagation order.
    pub fn propagation_order(&self, node: &N) -> Vec<N> {
        let order = self.topological_order();
        order
            .into_iter()
            .filter(|candidate| candidate != node && self.reaches(node, candidate))
            .collect()
    }

    /// Longest chain of dependents starting at `node` (0 for a leaf).
    pub fn depth(&self, node: &N) -> usize {
        self.dependents_of(node)
            .iter()
            .map(|d| 1 + self.depth(d))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_cycle() {
        let mut g = DependencyGraph::new();
        g.add_dependency("a".to_string(), "b".to_string()).unwrap();
        g.add_dependency("b".to_string(), "c".to_string()).unwrap();
        let err = g.add_dependency("c".to_string(), "a".to_string());
        assert!(matches!(err, Err(DaqError::DependencyCycle(_))));
        assert!(g.add_dependency("x".to_string(), "x".to_string()).is_err());
    }

    #[test]
    fn test_topological_order() {
        let mut g = DependencyGraph::new();
        g.add_dependency("count", "value").unwrap();
        g.add_dependency("stepsize", "value").unwrap();
        g.add_dependency("value", "label").unwrap();
        let order = g.topological_order();
        let pos = |n: &str| order.iter().position(|x| *x == n).unwrap();
        assert!(pos("count") < pos("value"));
        assert!(pos("stepsize") < pos("value"));
        assert!(pos("value") < pos("label"));
        assert_eq!(g.propagation_order(&"count"), vec!["value", "label"]);
        assert_eq!(g.depth(&"count"), 2);
    }
}
