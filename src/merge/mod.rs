//! Combines several input trees into one, rejecting ambiguous layouts.

mod merge_trees;

pub use merge_trees::{MergeError, MergeInput, MergeOptions, merge};
