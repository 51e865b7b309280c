//! Merges ordered input directory trees into a virtual tree and keeps an
//! output directory in sync with it, touching only what changed.

#![allow(clippy::enum_variant_names, clippy::module_inception)]

pub mod application;
pub mod cli;
pub mod config;
pub mod executor;
pub mod ext;
pub mod filesystem;
pub mod materializer;
pub mod merge;
pub mod targets;
