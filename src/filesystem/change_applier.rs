use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use snafu::{ResultExt, Snafu};
use tracing::{debug, trace, warn};

use crate::ext::PathDisplayExt;

static SYMLINK_SUPPORT: OnceLock<bool> = OnceLock::new();

/// Whether this process can create symlinks. Probed once, then cached.
pub fn can_symlink() -> bool {
    *SYMLINK_SUPPORT.get_or_init(probe_symlink_support)
}

fn probe_symlink_support() -> bool {
    let probe_dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            warn!("Failed to create symlink probe directory, falling back to copies: {e}");
            return false;
        }
    };
    let target = probe_dir.path().join("target");
    let link = probe_dir.path().join("link");

    let supported = fs::write(&target, b"").is_ok()
        && symlink_file(&target, &link).is_ok()
        && fs::remove_file(&link).is_ok();
    debug!(supported, "Probed symlink support");
    supported
}

#[cfg(unix)]
fn symlink_file(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, dest)
}

#[cfg(windows)]
fn symlink_file(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(source, dest)
}

#[cfg(not(any(unix, windows)))]
fn symlink_file(_source: &Path, _dest: &Path) -> io::Result<()> {
    Err(io::Error::from(ErrorKind::Unsupported))
}

/// The primitive mutations the materializer is built from.
///
/// None of these ever clobbers an unexpected occupant: callers clear a path
/// before creating something new at it.
pub trait ChangeApplier {
    /// Removes a file or symlink. Succeeds if nothing is there.
    fn unlink(&self, path: &Path) -> Result<(), ChangeError>;
    /// Removes a directory whose children are already gone.
    fn rmdir(&self, path: &Path) -> Result<(), ChangeError>;
    /// Removes whatever occupies `path`, recursively. Succeeds if nothing is there.
    fn remove_all(&self, path: &Path) -> Result<(), ChangeError>;
    /// Creates a directory. Fails if anything already occupies `path`.
    fn mkdir(&self, path: &Path) -> Result<(), ChangeError>;
    /// Ensures every ancestor of `path` exists.
    fn create_parents(&self, path: &Path) -> Result<(), ChangeError>;
    /// Links `dest` to `source` when `can_symlink`, otherwise copies the bytes
    /// along with mode and timestamps.
    fn copy_or_link(&self, source: &Path, dest: &Path, can_symlink: bool)
    -> Result<(), ChangeError>;
}

/// Applies changes to the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsChangeApplier;

impl ChangeApplier for FsChangeApplier {
    fn unlink(&self, path: &Path) -> Result<(), ChangeError> {
        trace!(path = %path.display(), "unlink");
        match fs::remove_file(path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            result => result.context(UnlinkSnafu {
                path: path.to_path_buf(),
            }),
        }
    }

    fn rmdir(&self, path: &Path) -> Result<(), ChangeError> {
        trace!(path = %path.display(), "rmdir");
        fs::remove_dir(path).context(RmdirSnafu {
            path: path.to_path_buf(),
        })
    }

    fn remove_all(&self, path: &Path) -> Result<(), ChangeError> {
        trace!(path = %path.display(), "remove_all");
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).context(RemoveAllSnafu {
                    path: path.to_path_buf(),
                });
            }
        };
        let result = if metadata.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        result.context(RemoveAllSnafu {
            path: path.to_path_buf(),
        })
    }

    fn mkdir(&self, path: &Path) -> Result<(), ChangeError> {
        trace!(path = %path.display(), "mkdir");
        fs::create_dir(path).context(MkdirSnafu {
            path: path.to_path_buf(),
        })
    }

    fn create_parents(&self, path: &Path) -> Result<(), ChangeError> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent).context(MkdirSnafu {
                    path: parent.to_path_buf(),
                })
            }
            _ => Ok(()),
        }
    }

    fn copy_or_link(
        &self,
        source: &Path,
        dest: &Path,
        can_symlink: bool,
    ) -> Result<(), ChangeError> {
        if can_symlink {
            trace!(source = %source.display(), dest = %dest.display(), "symlink");
            symlink_file(source, dest).context(SymlinkSnafu {
                from: source.to_path_buf(),
                path: dest.to_path_buf(),
            })
        } else {
            trace!(source = %source.display(), dest = %dest.display(), "copy");
            copy_with_metadata(source, dest).context(CopySnafu {
                from: source.to_path_buf(),
                path: dest.to_path_buf(),
            })
        }
    }
}

// `create_new` makes an unexpected occupant an error instead of a silent overwrite.
fn copy_with_metadata(source: &Path, dest: &Path) -> io::Result<()> {
    let mut reader = File::open(source)?;
    let metadata = reader.metadata()?;
    let mut writer = OpenOptions::new().write(true).create_new(true).open(dest)?;
    io::copy(&mut reader, &mut writer)?;

    let mut times = FileTimes::new().set_modified(metadata.modified()?);
    if let Ok(accessed) = metadata.accessed() {
        times = times.set_accessed(accessed);
    }
    writer.set_times(times)?;
    writer.set_permissions(metadata.permissions())?;
    Ok(())
}

#[derive(Debug, Snafu)]
pub enum ChangeError {
    #[snafu(display("Failed to unlink {}", path.display_best_effort()))]
    UnlinkError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to remove directory {}", path.display_best_effort()))]
    RmdirError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to recursively remove {}", path.display_best_effort()))]
    RemoveAllError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to create directory {}", path.display_best_effort()))]
    MkdirError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "Failed to link {} to {}",
        path.display_best_effort(),
        from.display_best_effort()
    ))]
    SymlinkError {
        from: PathBuf,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "Failed to copy {} to {}",
        from.display_best_effort(),
        path.display_best_effort()
    ))]
    CopyError {
        from: PathBuf,
        path: PathBuf,
        source: std::io::Error,
    },
}
