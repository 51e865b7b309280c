use std::sync::Arc;

use snafu::prelude::*;
use tracing::{debug, info};

use crate::application::RuntimeConfig;
use crate::config::{TargetRegistry, TargetRegistryCreationError};
use crate::executor::{
    DependencyGraph, DependencyGraphError, ExecutionError, Executor, ExecutorCreationError,
};
use crate::targets::{TargetReport, print_target_report};

pub struct Application;

impl Application {
    /// Loads `treesync.yaml` from the configured root and runs the requested
    /// target, or every target when none is requested.
    pub async fn run(
        runtime_config: impl Into<RuntimeConfig>,
    ) -> Result<Vec<TargetReport>, ApplicationError> {
        let runtime_config: RuntimeConfig = runtime_config.into();
        let registry = TargetRegistry::read(&runtime_config.root)
            .await
            .context(TargetRegistrySnafu)?;
        debug!("Loaded config: {:?}", registry);

        let dependency_graph =
            DependencyGraph::from_registry(&registry, runtime_config.target.as_deref())
                .context(DependencyGraphSnafu)?;

        let reports = Executor::new(
            Arc::new(registry),
            Arc::new(dependency_graph),
            Arc::new(runtime_config),
        )
        .context(ExecutorCreationSnafu)?
        .execute()
        .await
        .context(ApplicationExecutionSnafu)?;
        info!("Finished {} targets", reports.len());

        for report in &reports {
            print_target_report(report);
        }

        Ok(reports)
    }
}

#[derive(Debug, Snafu)]
pub enum ApplicationError {
    #[snafu(display("Critical failure encountered while reading the target registry"))]
    TargetRegistryError { source: TargetRegistryCreationError },
    #[snafu(display("Critical failure encountered while resolving target dependencies"))]
    DependencyGraphError { source: DependencyGraphError },
    #[snafu(display("Critical failure encountered during executor creation"))]
    ExecutorCreationError { source: ExecutorCreationError },
    #[snafu(display("Critical failure encountered during application execution"))]
    ApplicationExecutionError { source: ExecutionError },
}
