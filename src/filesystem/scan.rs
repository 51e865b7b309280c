use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::ext::PathDisplayExt;
use crate::filesystem::{FileEntry, TreeBuildError, TreeBuilder, TreeNode};

/// Reads the directory at `root` into a fresh tree.
///
/// Symlinks are followed, so every entry is recorded as the file or
/// directory it ultimately points at. Entries are sorted by name.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn scan(root: &Path) -> Result<Arc<TreeNode>, ScanError> {
    let root = fs::canonicalize(root).context(RootSnafu {
        path: root.to_path_buf(),
    })?;
    let root_metadata = fs::metadata(&root).context(RootSnafu { path: root.clone() })?;
    ensure!(
        root_metadata.is_dir(),
        RootNotDirectorySnafu { path: root.clone() }
    );

    let mut builder = TreeBuilder::new();
    let mut file_count = 0usize;

    let walker = WalkDir::new(&root)
        .follow_links(true)
        .sort_by_file_name()
        .min_depth(1);

    for entry in walker {
        let entry = entry.context(WalkSnafu { root: root.clone() })?;
        let relative = relative_name(&root, entry.path())?;
        let metadata = entry.metadata().context(WalkSnafu { root: root.clone() })?;

        if metadata.is_dir() {
            builder
                .insert_directory(&relative)
                .context(InsertSnafu)?;
        } else {
            let source_path = if entry.path_is_symlink() {
                resolve_link(entry.path())?
            } else {
                entry.path().to_path_buf()
            };
            builder
                .insert_file(&relative, file_entry(source_path, &metadata)?)
                .context(InsertSnafu)?;
            file_count += 1;
        }
    }

    debug!(file_count, "Scanned input tree");
    Ok(builder.build())
}

fn resolve_link(path: &Path) -> Result<PathBuf, ScanError> {
    fs::canonicalize(path).context(EntrySnafu {
        path: path.to_path_buf(),
    })
}

fn file_entry(source_path: PathBuf, metadata: &Metadata) -> Result<FileEntry, ScanError> {
    let modified_time = metadata.modified().context(EntrySnafu {
        path: source_path.clone(),
    })?;
    Ok(FileEntry {
        size: metadata.len(),
        modified_time,
        mode: permission_bits(metadata),
        source_path,
    })
}

#[cfg(unix)]
fn permission_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

fn relative_name(root: &Path, path: &Path) -> Result<String, ScanError> {
    let relative = path.strip_prefix(root).ok().context(OutsideRootSnafu {
        path: path.to_path_buf(),
        root: root.to_path_buf(),
    })?;
    let components = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect::<Option<Vec<_>>>();
    match components {
        Some(components) => Ok(components.join("/")),
        None => NonUtf8NameSnafu {
            path: path.to_path_buf(),
        }
        .fail(),
    }
}

#[derive(Debug, Snafu)]
pub enum ScanError {
    #[snafu(display("Failed to read {}", path.display_best_effort()))]
    RootError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Input {} is not a directory", path.display_best_effort()))]
    RootNotDirectory { path: PathBuf },
    #[snafu(display("Failed to walk {}", root.display_best_effort()))]
    WalkError {
        root: PathBuf,
        source: walkdir::Error,
    },
    #[snafu(display("Failed to read entry {}", path.display_best_effort()))]
    EntryError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "Walked entry {} lies outside {}",
        path.display(),
        root.display_best_effort()
    ))]
    OutsideRoot { path: PathBuf, root: PathBuf },
    #[snafu(display("Path {} is not valid UTF-8 below its input root", path.display()))]
    NonUtf8Name { path: PathBuf },
    #[snafu(display("Scanned entries do not form a tree"))]
    InsertError { source: TreeBuildError },
}
