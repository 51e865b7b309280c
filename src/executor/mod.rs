mod dependency_graph;
mod executor;

pub use dependency_graph::{DependencyGraph, DependencyGraphError};
pub use executor::{ExecutionError, Executor, ExecutorCreationError};
