//! Dependency Graph Resolver
//!
//! Builds the job DAG from declared `requires` edges, rejects malformed
//! references before traversal, and produces a topologically valid
//! execution order via depth-first traversal with three-color marking.
//! The reverse edges drive failure/skip propagation in the scheduler.

use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tolva_core::{JobId, WorkflowSpec};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GraphError {
    #[error("job '{0}' depends on itself")]
    SelfDependency(JobId),

    #[error("job '{job}' requires unknown job '{dependency}'")]
    UnknownDependency { job: JobId, dependency: JobId },

    #[error("dependency cycle: {}", members.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(" -> "))]
    Cycle { members: Vec<JobId> },
}

/// DFS node coloring
#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Immutable dependency graph over a workflow's jobs
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Declaration order - dispatch tie-break
    order: Vec<JobId>,
    /// job -> jobs it requires
    dependencies: HashMap<JobId, Vec<JobId>>,
    /// job -> jobs that require it
    dependents: HashMap<JobId, Vec<JobId>>,
}

impl DependencyGraph {
    /// Build the graph, rejecting self-dependencies and unknown references
    ///
    /// # Errors
    /// Returns `GraphError::SelfDependency` or `GraphError::UnknownDependency`
    /// before any traversal happens
    pub fn build(spec: &WorkflowSpec) -> Result<Self, GraphError> {
        let known: HashSet<&JobId> = spec.job_ids().collect();
        let mut dependencies: HashMap<JobId, Vec<JobId>> = HashMap::new();
        let mut dependents: HashMap<JobId, Vec<JobId>> = HashMap::new();
        let mut order = Vec::with_capacity(spec.jobs.len());

        for job in &spec.jobs {
            order.push(job.id.clone());
            dependencies.entry(job.id.clone()).or_default();
            dependents.entry(job.id.clone()).or_default();
        }

        for job in &spec.jobs {
            for dep in &job.requires {
                if dep == &job.id {
                    return Err(GraphError::SelfDependency(job.id.clone()));
                }
                if !known.contains(dep) {
                    return Err(GraphError::UnknownDependency {
                        job: job.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependencies.get_mut(&job.id).expect("job inserted").push(dep.clone());
                dependents.get_mut(dep).expect("dep known").push(job.id.clone());
            }
        }

        Ok(Self {
            order,
            dependencies,
            dependents,
        })
    }

    /// Jobs in declaration order
    pub fn declaration_order(&self) -> &[JobId] {
        &self.order
    }

    pub fn dependencies_of(&self, id: &JobId) -> &[JobId] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents_of(&self, id: &JobId) -> &[JobId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every job reachable from `id` along dependent edges
    pub fn transitive_dependents(&self, id: &JobId) -> HashSet<JobId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&JobId> = self.dependents_of(id).iter().collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents_of(next).iter());
            }
        }
        seen
    }

    /// Topologically valid execution order, or the offending cycle
    ///
    /// Iterative depth-first traversal (explicit frame stack, so deep
    /// dependency chains cost heap, not call stack) rooted in declaration
    /// order; reaching an in-progress node again signals a cycle, whose
    /// members are the path segment from that node to the current one.
    ///
    /// # Errors
    /// Returns `GraphError::Cycle` naming the cycle's member ids
    pub fn execution_order(&self) -> Result<Vec<JobId>, GraphError> {
        enum Frame<'a> {
            Enter(&'a JobId),
            Exit(&'a JobId),
        }

        let mut marks: HashMap<&JobId, Mark> =
            self.order.iter().map(|id| (id, Mark::Unvisited)).collect();
        let mut sorted = Vec::with_capacity(self.order.len());
        let mut path: Vec<&JobId> = Vec::new();
        let mut stack: Vec<Frame> = Vec::new();

        for root in &self.order {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            stack.push(Frame::Enter(root));
            while let Some(frame) = stack.pop() {
                match frame {
                    Frame::Enter(node) => match marks[node] {
                        Mark::Done => {}
                        // in-progress nodes are exactly the current path
                        Mark::InProgress => {
                            let start = path
                                .iter()
                                .position(|p| *p == node)
                                .expect("in-progress node is on the path");
                            let members = path[start..].iter().map(|p| (*p).clone()).collect();
                            return Err(GraphError::Cycle { members });
                        }
                        Mark::Unvisited => {
                            marks.insert(node, Mark::InProgress);
                            path.push(node);
                            stack.push(Frame::Exit(node));
                            // reversed so dependencies pop in declared order
                            for dep in self.dependencies_of(node).iter().rev() {
                                stack.push(Frame::Enter(dep));
                            }
                        }
                    },
                    Frame::Exit(node) => {
                        path.pop();
                        marks.insert(node, Mark::Done);
                        sorted.push(node.clone());
                    }
                }
            }
        }
        Ok(sorted)
    }
}
