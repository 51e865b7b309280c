use std::path::PathBuf;

use crate::cli::Cli;

/// What one invocation asked for, after CLI parsing.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `None` runs every target.
    pub target: Option<String>,
    pub root: PathBuf,
    pub force_copy: bool,
}

impl From<Cli> for RuntimeConfig {
    fn from(cli: Cli) -> Self {
        Self {
            target: cli.target,
            root: cli.root,
            force_copy: cli.copy,
        }
    }
}
