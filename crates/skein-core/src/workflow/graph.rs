//! Dependency graph for workflow steps.
//!
//! Design:
//! - Forward edges: step -> steps it depends on (waits for)
//! - Reverse edges: step -> steps that depend on it (waiting steps)
//! - Invariant: edges and reverse_edges must be kept in sync
//! - Every step appears as a key in `edges`, even with no dependencies

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::WorkflowError;

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Forward edges: step -> steps it depends on
    edges: BTreeMap<String, BTreeSet<String>>,

    /// Reverse edges: step -> steps waiting for it
    reverse_edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and check a graph from `(step, depends_on)` pairs.
    ///
    /// Rejects duplicate steps and dependencies on steps that do not exist.
    pub fn from_steps<'a, I, D>(steps: I) -> Result<Self, WorkflowError>
    where
        I: IntoIterator<Item = (&'a str, D)>,
        D: IntoIterator<Item = &'a str>,
    {
        let steps: Vec<(&str, Vec<&str>)> = steps
            .into_iter()
            .map(|(name, deps)| (name, deps.into_iter().collect()))
            .collect();

        let mut graph = Self::new();
        for (name, _) in &steps {
            if !graph.add_step(name) {
                return Err(WorkflowError::DuplicateStep(name.to_string()));
            }
        }
        for (name, deps) in &steps {
            for dep in deps {
                if !graph.contains(dep) {
                    return Err(WorkflowError::UnknownDependency {
                        step: name.to_string(),
                        dependency: dep.to_string(),
                    });
                }
                graph.add_dependency(name, dep);
            }
        }
        Ok(graph)
    }

    /// Add a step with no dependencies. Returns `false` if it already exists.
    pub fn add_step(&mut self, step: &str) -> bool {
        if self.edges.contains_key(step) {
            return false;
        }
        self.edges.insert(step.to_string(), BTreeSet::new());
        true
    }

    pub fn contains(&self, step: &str) -> bool {
        self.edges.contains_key(step)
    }

    /// `step` depends on `depends_on` ("step waits for depends_on").
    pub fn add_dependency(&mut self, step: &str, depends_on: &str) {
        self.add_step(step);
        self.add_step(depends_on);
        self.edges
            .entry(step.to_string())
            .or_default()
            .insert(depends_on.to_string());
        self.reverse_edges
            .entry(depends_on.to_string())
            .or_default()
            .insert(step.to_string());
    }

    pub fn dependencies(&self, step: &str) -> impl Iterator<Item = &str> {
        self.edges.get(step).into_iter().flatten().map(String::as_str)
    }

    /// Steps waiting for `step`.
    pub fn dependents(&self, step: &str) -> impl Iterator<Item = &str> {
        self.reverse_edges
            .get(step)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Topological layering (Kahn's algorithm).
    ///
    /// Each level holds every step whose dependencies all lie in earlier
    /// levels, sorted by name. Steps left over when no zero in-degree step
    /// remains form (or sit behind) a cycle.
    pub fn levels(&self) -> Result<Vec<Vec<String>>, WorkflowError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .edges
            .iter()
            .map(|(step, deps)| (step.as_str(), deps.len()))
            .collect();

        let mut levels = Vec::new();
        while !in_degree.is_empty() {
            let ready: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(step, _)| *step)
                .collect();

            if ready.is_empty() {
                return Err(WorkflowError::CycleDetected(
                    in_degree.keys().map(|s| s.to_string()).collect(),
                ));
            }

            for step in &ready {
                in_degree.remove(step);
                for dependent in self.dependents(step) {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                    }
                }
            }
            levels.push(ready.into_iter().map(str::to_string).collect());
        }
        Ok(levels)
    }
}
