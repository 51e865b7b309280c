use std::path::PathBuf;

use clap::Parser;

use crate::application::data::LogLevel;

/// Merge input directories into output directories and keep them in sync.
#[derive(Parser, Debug, Clone)]
#[command(version)]
pub struct Cli {
    /// Target to materialize along with its dependencies. Runs every target when omitted.
    pub target: Option<String>,

    #[clap(long, short, default_value = "warn", value_enum)]
    pub log_level: LogLevel,

    /// The root directory of the project
    #[clap(long, short, default_value = ".")]
    pub root: PathBuf,

    /// Copy files instead of symlinking them
    #[clap(long)]
    pub copy: bool,
}
