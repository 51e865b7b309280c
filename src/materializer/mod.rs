//! Incremental synchronization of an output directory with a virtual tree.

mod change_stats;
mod materializer;

pub use change_stats::ChangeStats;
pub use materializer::{MaterializationError, MaterializeOptions, Materializer};
