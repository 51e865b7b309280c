use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashlink::{LinkedHashMap, linked_hash_map};
use snafu::{OptionExt, Snafu};
use tracing::{debug, instrument};

use crate::ext::{PathDisplayExt, join_relative};
use crate::filesystem::{Directory, NodeKind, TreeNode};

/// One tree to merge, plus where it came from for error messages.
#[derive(Debug, Clone)]
pub struct MergeInput {
    pub root: Arc<TreeNode>,
    pub origin: PathBuf,
}

impl MergeInput {
    pub fn new(root: Arc<TreeNode>, origin: impl Into<PathBuf>) -> Self {
        Self {
            root,
            origin: origin.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Let a later input's file replace an earlier input's file of the same name.
    pub overwrite: bool,
}

type Level<'a> = (&'a Directory, &'a Path);
type Candidate<'a> = (&'a Arc<TreeNode>, &'a Path);

/// Merges the inputs into a single directory tree.
///
/// Inputs are considered in order: with `overwrite`, the last input
/// supplying a file wins. A single input is returned as-is.
#[instrument(skip_all, fields(inputs = inputs.len(), overwrite = options.overwrite))]
pub fn merge(
    inputs: &[MergeInput],
    options: MergeOptions,
) -> Result<Arc<TreeNode>, MergeError> {
    let levels = inputs
        .iter()
        .map(|input| {
            let directory = input.root.as_directory().context(NotADirectorySnafu {
                origin: input.origin.clone(),
            })?;
            Ok((directory, input.origin.as_path()))
        })
        .collect::<Result<Vec<Level>, MergeError>>()?;

    match inputs {
        [] => Ok(Arc::new(TreeNode::empty_directory())),
        [single] => Ok(Arc::clone(&single.root)),
        _ => {
            let merged = merge_level(&levels, "", options)?;
            debug!(entries = merged.len(), "Merged input trees");
            Ok(Arc::new(TreeNode::Directory(merged)))
        }
    }
}

fn merge_level(
    levels: &[Level],
    relative: &str,
    options: MergeOptions,
) -> Result<Directory, MergeError> {
    check_capitalization(levels, relative)?;

    let mut candidates: LinkedHashMap<&str, Vec<Candidate>> = LinkedHashMap::new();
    for (directory, origin) in levels {
        for (name, node) in directory.entries() {
            match candidates.entry(name.as_str()) {
                linked_hash_map::Entry::Occupied(mut suppliers) => {
                    suppliers.get_mut().push((node, *origin))
                }
                linked_hash_map::Entry::Vacant(slot) => {
                    slot.insert(vec![(node, *origin)]);
                }
            }
        }
    }

    let mut merged = LinkedHashMap::with_capacity(candidates.len());
    for (name, suppliers) in &candidates {
        let Some((first, rest)) = suppliers.split_first() else {
            continue;
        };
        let path = join_relative(relative, name);
        let node = merge_entry(*first, rest, &path, options)?;
        merged.insert(name.to_string(), node);
    }

    Ok(Directory::new(merged))
}

fn merge_entry(
    first: Candidate,
    rest: &[Candidate],
    path: &str,
    options: MergeOptions,
) -> Result<Arc<TreeNode>, MergeError> {
    let (first_node, first_origin) = first;

    if let Some((other, other_origin)) = rest
        .iter()
        .find(|(node, _)| node.kind() != first_node.kind())
    {
        return ConflictingTypeSnafu {
            path,
            first_origin,
            first_kind: first_node.kind(),
            second_origin: *other_origin,
            second_kind: other.kind(),
        }
        .fail();
    }

    let Some((last_node, last_origin)) = rest.last() else {
        return Ok(Arc::clone(first_node));
    };

    if first_node.is_directory() {
        let levels = std::iter::once(&first)
            .chain(rest)
            .filter_map(|(node, origin)| node.as_directory().map(|dir| (dir, *origin)))
            .collect::<Vec<_>>();
        let merged = merge_level(&levels, path, options)?;
        return Ok(Arc::new(TreeNode::Directory(merged)));
    }

    if !options.overwrite {
        let (_, second_origin) = rest[0];
        return ConflictingFileSnafu {
            path,
            first_origin,
            second_origin,
        }
        .fail();
    }

    debug!(path, origin = %last_origin.display(), "Later input overwrites file");
    Ok(Arc::clone(last_node))
}

/// Two names that differ only by case would collide on case-insensitive
/// filesystems, so they are rejected everywhere.
fn check_capitalization(levels: &[Level], relative: &str) -> Result<(), MergeError> {
    let mut seen: HashMap<String, (&str, &Path)> = HashMap::new();

    for (directory, origin) in levels {
        for name in directory.names() {
            match seen.entry(name.to_lowercase()) {
                Entry::Occupied(existing) => {
                    let (first_name, first_origin) = *existing.get();
                    if first_name != name {
                        return ConflictingCapitalizationSnafu {
                            path: join_relative(relative, name),
                            first_name: join_relative(relative, first_name),
                            first_origin,
                            second_name: join_relative(relative, name),
                            second_origin: *origin,
                        }
                        .fail();
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert((name, *origin));
                }
            }
        }
    }

    Ok(())
}

#[derive(Debug, Snafu)]
pub enum MergeError {
    #[snafu(display(
        "Merge error: conflicting capitalizations: {} in {} and {} in {}. Remove one of the files and re-add it with matching capitalization",
        first_name,
        first_origin.display_best_effort(),
        second_name,
        second_origin.display_best_effort()
    ))]
    ConflictingCapitalization {
        path: String,
        first_name: String,
        first_origin: PathBuf,
        second_name: String,
        second_origin: PathBuf,
    },
    #[snafu(display(
        "Merge error: conflicting file types: {} is a {} in {} but a {} in {}",
        path,
        first_kind,
        first_origin.display_best_effort(),
        second_kind,
        second_origin.display_best_effort()
    ))]
    ConflictingType {
        path: String,
        first_origin: PathBuf,
        first_kind: NodeKind,
        second_origin: PathBuf,
        second_kind: NodeKind,
    },
    #[snafu(display(
        "Merge error: file {} exists in {} and {}. Enable overwrite to have the latter file win",
        path,
        first_origin.display_best_effort(),
        second_origin.display_best_effort()
    ))]
    ConflictingFile {
        path: String,
        first_origin: PathBuf,
        second_origin: PathBuf,
    },
    #[snafu(display("Merge input {} is not a directory", origin.display_best_effort()))]
    NotADirectory { origin: PathBuf },
}

impl MergeError {
    /// The relative path the conflict was found at, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            MergeError::ConflictingCapitalization { path, .. }
            | MergeError::ConflictingType { path, .. }
            | MergeError::ConflictingFile { path, .. } => Some(path),
            MergeError::NotADirectory { .. } => None,
        }
    }
}
