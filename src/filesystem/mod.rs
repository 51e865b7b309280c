//! Filesystem tree representation and the primitives that touch disk.
//!
//! This module provides a tree-like structure to represent directory
//! snapshots, where nodes can be either directories (that can contain other
//! nodes) or files, a scanner that reads such a snapshot from disk, and the
//! change applier used to write one back out.

mod change_applier;
mod scan;
mod tree;

pub use change_applier::{ChangeApplier, ChangeError, FsChangeApplier, can_symlink};
pub use scan::{ScanError, scan};
pub use tree::{
    Directory, FileEntry, Fingerprint, NodeKind, TreeBuildError, TreeBuilder, TreeNode,
};
