use std::collections::{HashMap, HashSet, VecDeque};

use snafu::Snafu;
use tracing::debug;

use crate::config::TargetRegistry;

/// The subset of targets one run needs, with edges pointing from a target to
/// the targets waiting on it.
///
/// With a requested target only it and its transitive `dependsOn` are kept.
/// Without one every registered target is kept.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    dependents: HashMap<String, Vec<String>>,
    dependency_counts: HashMap<String, usize>,
    final_target: Option<String>,
}

impl DependencyGraph {
    pub fn from_registry(
        registry: &TargetRegistry,
        final_target: Option<&str>,
    ) -> Result<Self, DependencyGraphError> {
        let needed_targets = match final_target {
            Some(name) => {
                if registry.get_target_by_id(name).is_none() {
                    return UnknownTargetSnafu { target_name: name }.fail();
                }
                Self::collect_needed_targets(registry, name)
            }
            None => registry
                .get_targets_iter()
                .map(|target| target.id().to_string())
                .collect(),
        };
        debug!("Needed targets: {:?}", needed_targets);

        let mut dependents: HashMap<String, Vec<String>> = needed_targets
            .iter()
            .map(|id| (id.clone(), Vec::new()))
            .collect();
        let mut dependency_counts = HashMap::new();

        for target in registry
            .get_targets_iter()
            .filter(|target| needed_targets.contains(target.id()))
        {
            dependency_counts.insert(target.id().to_string(), target.dependencies().len());
            for dependency in target.dependencies() {
                if let Some(waiting) = dependents.get_mut(dependency) {
                    waiting.push(target.id().to_string());
                }
            }
        }

        let graph = DependencyGraph {
            dependents,
            dependency_counts,
            final_target: final_target.map(str::to_string),
        };
        graph.check_acyclic()?;

        debug!("Constructed dependency graph: {:?}", graph.dependents);
        Ok(graph)
    }

    /// Targets whose completion unblocks `target_id`'s dependents.
    pub fn get_dependents_by_id(&self, target_id: impl AsRef<str>) -> Option<&Vec<String>> {
        self.dependents.get(target_id.as_ref())
    }

    pub fn dependency_counts(&self) -> HashMap<String, usize> {
        self.dependency_counts.clone()
    }

    /// Targets that can start right away, sorted for a stable dispatch order.
    pub fn ready_targets(&self) -> Vec<&str> {
        let mut ready = self
            .dependency_counts
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| id.as_str())
            .collect::<Vec<_>>();
        ready.sort_unstable();
        ready
    }

    pub fn final_target(&self) -> Option<&str> {
        self.final_target.as_deref()
    }

    pub fn len(&self) -> usize {
        self.dependency_counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependency_counts.is_empty()
    }

    fn collect_needed_targets(registry: &TargetRegistry, final_target: &str) -> HashSet<String> {
        let mut needed = HashSet::new();
        let mut stack = vec![final_target.to_string()];

        while let Some(id) = stack.pop() {
            if !needed.insert(id.clone()) {
                continue;
            }
            if let Some(target) = registry.get_target_by_id(&id) {
                stack.extend(target.dependencies().iter().cloned());
            }
        }

        needed
    }

    /// Kahn's algorithm; anything left unvisited sits on a cycle.
    fn check_acyclic(&self) -> Result<(), DependencyGraphError> {
        let mut counts = self.dependency_counts.clone();
        let mut queue = counts
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| id.clone())
            .collect::<VecDeque<_>>();
        let mut visited = 0;

        while let Some(id) = queue.pop_front() {
            visited += 1;
            for dependent in self.dependents.get(&id).into_iter().flatten() {
                if let Some(count) = counts.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }

        if visited == counts.len() {
            return Ok(());
        }

        let mut cycle = counts
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(id, _)| id)
            .collect::<Vec<_>>();
        cycle.sort_unstable();
        DependencyCycleSnafu {
            targets: cycle.join(", "),
        }
        .fail()
    }
}

#[derive(Debug, Snafu)]
pub enum DependencyGraphError {
    #[snafu(display("Unknown target '{}'", target_name))]
    UnknownTargetError { target_name: String },
    #[snafu(display("Dependency cycle between targets: {}", targets))]
    DependencyCycleError { targets: String },
}
