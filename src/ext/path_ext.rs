use std::path::{Component, Path, PathBuf};

/// Renders a path for humans: canonical if it exists, otherwise absolute.
pub fn display_best_effort(path: &Path) -> String {
    let resolved = path
        .canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf());
    resolved.display().to_string()
}

pub trait PathDisplayExt {
    fn display_best_effort(&self) -> String;
}

impl PathDisplayExt for Path {
    fn display_best_effort(&self) -> String {
        display_best_effort(self)
    }
}

impl PathDisplayExt for PathBuf {
    fn display_best_effort(&self) -> String {
        display_best_effort(self)
    }
}

/// Joins a slash-separated relative path and a child name.
pub fn join_relative(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Drops `.` and folds `..` into its parent without touching the filesystem.
/// A `..` that would climb above a relative path's start is kept.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => normalized.push(".."),
            },
            other => normalized.push(other),
        }
    }
    normalized
}

/// True when `outer` is `inner` or one of its ancestors, compared component-wise
/// after lexical normalization.
pub fn contains_path(outer: &Path, inner: &Path) -> bool {
    normalize_lexically(inner).starts_with(normalize_lexically(outer))
}
