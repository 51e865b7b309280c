use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::available_parallelism;

use compio::dispatcher::{Dispatcher, DispatcherBuilder};
use compio::runtime::spawn;
use futures::StreamExt;
use futures_channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use crate::application::RuntimeConfig;
use crate::config::TargetRegistry;
use crate::executor::DependencyGraph;
use crate::materializer::MaterializeOptions;
use crate::targets::{Target, TargetError, TargetReport};

const DEFAULT_WORKER_THREADS: NonZeroUsize = NonZeroUsize::MIN;

type TargetResult = Result<TargetReport, TargetError>;

/// Runs the targets of a [`DependencyGraph`] on a worker pool, starting each
/// one as soon as everything it depends on has finished.
pub struct Executor {
    dispatcher: Dispatcher,
    runtime_config: Arc<RuntimeConfig>,
    registry: Arc<TargetRegistry>,
    dependency_graph: Arc<DependencyGraph>,
}

impl Executor {
    pub fn new(
        registry: Arc<TargetRegistry>,
        dependency_graph: Arc<DependencyGraph>,
        runtime_config: Arc<RuntimeConfig>,
    ) -> Result<Self, ExecutorCreationError> {
        let workers_num = Self::determine_worker_count();
        debug!("Using {} worker threads for target execution", workers_num);

        let dispatcher = DispatcherBuilder::new()
            .worker_threads(workers_num)
            .build()
            .context(DispatcherSnafu)?;

        Ok(Self {
            dispatcher,
            runtime_config,
            registry,
            dependency_graph,
        })
    }

    fn determine_worker_count() -> NonZeroUsize {
        available_parallelism().unwrap_or(DEFAULT_WORKER_THREADS)
    }

    fn materialize_options(&self) -> MaterializeOptions {
        MaterializeOptions {
            force_copy: self.runtime_config.force_copy || self.registry.force_copy(),
        }
    }

    /// Returns the reports of every finished target in completion order.
    pub async fn execute(&self) -> Result<Vec<TargetReport>, ExecutionError> {
        if self.dependency_graph.is_empty() {
            info!("No targets to run");
            return Ok(Vec::new());
        }

        let mut dependency_counts = self.dependency_graph.dependency_counts();
        let (sender, mut receiver) = mpsc::unbounded::<TargetResult>();

        for target_id in self.dependency_graph.ready_targets() {
            self.dispatch_by_id(&sender, target_id)?;
        }

        self.process_results(&mut receiver, &mut dependency_counts, &sender)
            .await
    }

    async fn process_results(
        &self,
        receiver: &mut UnboundedReceiver<TargetResult>,
        dependency_counts: &mut HashMap<String, usize>,
        sender: &UnboundedSender<TargetResult>,
    ) -> Result<Vec<TargetReport>, ExecutionError> {
        let mut reports = Vec::new();

        while let Some(result) = receiver.next().await {
            let report = result.context(TargetExecutionSnafu)?;
            debug!("Acknowledged target '{}' completion", report.name);
            let finished = report.name.clone();
            reports.push(report);

            let done = match self.dependency_graph.final_target() {
                Some(final_target) => finished == final_target,
                None => reports.len() == self.dependency_graph.len(),
            };
            if done {
                info!("Execution completed: {} targets", reports.len());
                return Ok(reports);
            }

            self.handle_completion(&finished, dependency_counts, sender)?;
        }

        Err(ExecutionError::ExecutionEndedPrematurely)
    }

    fn handle_completion(
        &self,
        finished: &str,
        dependency_counts: &mut HashMap<String, usize>,
        sender: &UnboundedSender<TargetResult>,
    ) -> Result<(), ExecutionError> {
        let Some(dependents) = self.dependency_graph.get_dependents_by_id(finished) else {
            return Ok(());
        };

        for dependent in dependents {
            let Some(count) = dependency_counts.get_mut(dependent) else {
                continue;
            };
            *count = count.saturating_sub(1);
            debug!("Target '{}' waits on {} more targets", dependent, count);
            if *count == 0 {
                self.dispatch_by_id(sender, dependent)?;
            }
        }

        Ok(())
    }

    fn dispatch_by_id(
        &self,
        sender: &UnboundedSender<TargetResult>,
        target_id: &str,
    ) -> Result<(), ExecutionError> {
        match self.registry.get_target_by_id(target_id) {
            Some(target) => self.dispatch(sender.clone(), target.clone()),
            None => MissingTargetSnafu { target_id }.fail(),
        }
    }

    fn dispatch(
        &self,
        sender: UnboundedSender<TargetResult>,
        target: Target,
    ) -> Result<(), ExecutionError> {
        let target_id = target.id().to_string();
        let root = self.runtime_config.root.clone();
        let options = self.materialize_options();

        let receiver = self
            .dispatcher
            .dispatch(move || async move { target.run(&root, options) })
            .map_err(|e| ExecutionError::TargetDispatchError {
                target_id: target_id.clone(),
                error: e.to_string(),
            })?;

        debug!("Dispatched target '{}'", target_id);

        spawn(async move {
            let result = match receiver.await {
                Ok(inner) => inner,
                Err(source) => {
                    debug!("Target '{}' was canceled", target_id);
                    Err(TargetError::CanceledError {
                        target_name: target_id.clone(),
                        source,
                    })
                }
            };

            if let Err(error) = sender.unbounded_send(result) {
                debug!("Failed to send result of '{}': {}", target_id, error);
            }
        })
        .detach();

        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum ExecutorCreationError {
    #[snafu(display("Failed to create target dispatcher"))]
    DispatcherError { source: std::io::Error },
}

#[derive(Debug, Snafu)]
pub enum ExecutionError {
    #[snafu(display("Failed to dispatch target '{}': {}", target_id, error))]
    TargetDispatchError { target_id: String, error: String },
    #[snafu(display("Target '{}' is not registered", target_id))]
    MissingTargetError { target_id: String },
    #[snafu(display("A target failed"))]
    TargetExecutionError { source: TargetError },
    #[snafu(display("Execution loop ended before every target finished"))]
    ExecutionEndedPrematurely,
}
