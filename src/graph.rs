//! Dependency graph over registered modules.
//!
//! An edge `A -> B` exists when `A` declares a dependency on `B`. The graph is
//! an immutable snapshot: the registry rebuilds it whenever the module set
//! changes and hands out `Arc` clones, so a cascade always walks one
//! consistent version even while registrations happen concurrently.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::error::KernelError;
use crate::module::{Dependency, ModuleDescriptor};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependencies: BTreeMap<String, Vec<Dependency>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Builds the graph, rejecting cycles among mandatory start-blocking
    /// edges. Soft and optional edges never gate a start, so they may loop.
    pub fn build<'a, I>(descriptors: I) -> Result<Self, KernelError>
    where
        I: IntoIterator<Item = &'a ModuleDescriptor>,
    {
        let mut graph = Self::default();
        for d in descriptors {
            graph.dependencies.insert(d.name().to_string(), d.dependencies().to_vec());
            for dep in d.dependencies() {
                graph
                    .dependents
                    .entry(dep.target.clone())
                    .or_default()
                    .insert(d.name().to_string());
            }
        }
        if let Some(cycle) = graph.find_hard_cycle() {
            return Err(KernelError::CyclicDependency { cycle });
        }
        Ok(graph)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    /// What `name` declared it needs.
    pub fn dependencies(&self, name: &str) -> &[Dependency] {
        self.dependencies.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Registered modules that declare a dependency on `name`.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.dependents
            .get(name)
            .into_iter()
            .flatten()
            .filter(|d| self.contains(d))
            .map(String::as_str)
            .collect()
    }

    /// Everything that directly or indirectly requires `name`, in
    /// breadth-first layers: direct dependents first.
    pub fn dependency_branch(&self, name: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::from([name]);
        let mut queue: VecDeque<&str> = VecDeque::from([name]);
        let mut branch = Vec::new();
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(current) {
                if seen.insert(dependent) {
                    branch.push(dependent.to_string());
                    queue.push_back(dependent);
                }
            }
        }
        branch
    }

    /// Full shutdown order: every module appears after all of its
    /// dependents. Members of soft cycles come last, sorted by name.
    pub fn shutdown_order(&self) -> Vec<String> {
        let mut pending: BTreeMap<&str, usize> =
            self.modules().map(|m| (m, self.dependents(m).len())).collect();
        let mut ready: BTreeSet<&str> =
            pending.iter().filter(|(_, n)| **n == 0).map(|(m, _)| *m).collect();
        let mut order = Vec::with_capacity(pending.len());

        while let Some(next) = ready.pop_first() {
            pending.remove(next);
            order.push(next.to_string());
            for dep in self.dependencies(next) {
                if let Some(count) = pending.get_mut(dep.target.as_str()) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.insert(dep.target.as_str());
                    }
                }
            }
        }
        order.extend(pending.into_keys().map(str::to_string));
        order
    }

    fn find_hard_cycle(&self) -> Option<Vec<String>> {
        let mut done: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();
        for start in self.modules() {
            if let Some(cycle) = self.visit(start, &mut done, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        done: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if done.contains(node) {
            return None;
        }
        if let Some(pos) = stack.iter().position(|n| *n == node) {
            let mut cycle: Vec<String> = stack[pos..].iter().map(|n| n.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        stack.push(node);
        for dep in self.dependencies(node).iter().filter(|d| d.is_hard()) {
            if let Some(cycle) = self.visit(&dep.target, done, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        done.insert(node);
        None
    }
}
