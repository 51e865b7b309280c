//! Named merge-and-materialize jobs declared in `treesync.yaml`.

mod report;
mod target;

pub use report::print_target_report;
pub use target::{Target, TargetError, TargetReport};
