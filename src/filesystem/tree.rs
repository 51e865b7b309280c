use std::hash::Hasher;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use derive_more::Display;
use hashlink::LinkedHashMap;
use hashlink::linked_hash_map::Entry;
use metrohash::MetroHash64;
use snafu::Snafu;

/// Structural hash of a subtree. Two directories with equal fingerprints
/// materialize to the same output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{_0:016x}")]
pub struct Fingerprint(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum NodeKind {
    #[display("directory")]
    Directory,
    #[display("file")]
    File,
}

/// A file as seen by the scanner. `source_path` is where the bytes live;
/// the output entry is a link to it or a copy of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub source_path: PathBuf,
    pub size: u64,
    pub modified_time: SystemTime,
    pub mode: u32,
}

impl FileEntry {
    /// True when size, mtime and mode all match, i.e. a previous copy is still valid.
    pub fn same_metadata(&self, other: &FileEntry) -> bool {
        self.size == other.size
            && self.modified_time == other.modified_time
            && self.mode == other.mode
    }

    fn fingerprint(&self) -> Fingerprint {
        let mut hasher = MetroHash64::default();
        hasher.write_u8(b'f');
        hasher.write(self.source_path.as_os_str().as_encoded_bytes());
        hasher.write_u64(self.size);
        match self.modified_time.duration_since(UNIX_EPOCH) {
            Ok(since) => {
                hasher.write_u8(1);
                hasher.write_u64(since.as_secs());
                hasher.write_u32(since.subsec_nanos());
            }
            Err(before) => {
                hasher.write_u8(0);
                hasher.write_u64(before.duration().as_secs());
                hasher.write_u32(before.duration().subsec_nanos());
            }
        }
        hasher.write_u32(self.mode);
        Fingerprint(hasher.finish())
    }
}

/// Directory entries in insertion order, plus the fingerprint of the whole subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    entries: LinkedHashMap<String, Arc<TreeNode>>,
    fingerprint: Fingerprint,
}

impl Directory {
    pub fn new(entries: LinkedHashMap<String, Arc<TreeNode>>) -> Self {
        let fingerprint = Self::compute_fingerprint(&entries);
        Self {
            entries,
            fingerprint,
        }
    }

    pub fn empty() -> Self {
        Self::new(LinkedHashMap::new())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TreeNode>> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Arc<TreeNode>)> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    // Sorted so that entry order does not leak into the fingerprint.
    fn compute_fingerprint(entries: &LinkedHashMap<String, Arc<TreeNode>>) -> Fingerprint {
        let mut sorted = entries.iter().collect::<Vec<_>>();
        sorted.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

        let mut hasher = MetroHash64::default();
        hasher.write_u8(b'd');
        for (name, node) in sorted {
            hasher.write(name.as_bytes());
            hasher.write_u8(0);
            hasher.write_u64(node.fingerprint().0);
        }
        Fingerprint(hasher.finish())
    }
}

/// Represents a node of a virtual directory tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeNode {
    Directory(Directory),
    File(FileEntry),
}

impl TreeNode {
    pub fn empty_directory() -> Self {
        TreeNode::Directory(Directory::empty())
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            TreeNode::Directory(_) => NodeKind::Directory,
            TreeNode::File(_) => NodeKind::File,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, TreeNode::Directory(_))
    }

    pub fn as_directory(&self) -> Option<&Directory> {
        match self {
            TreeNode::Directory(directory) => Some(directory),
            TreeNode::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileEntry> {
        match self {
            TreeNode::File(file) => Some(file),
            TreeNode::Directory(_) => None,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        match self {
            TreeNode::Directory(directory) => directory.fingerprint(),
            TreeNode::File(file) => file.fingerprint(),
        }
    }

    /// Looks up a slash-separated relative path.
    #[cfg(test)]
    pub fn lookup(&self, relative_path: &str) -> Option<&TreeNode> {
        relative_path
            .split('/')
            .filter(|component| !component.is_empty())
            .try_fold(self, |current, name| {
                current.as_directory()?.get(name).map(Arc::as_ref)
            })
    }
}

#[derive(Debug)]
enum PendingNode {
    Directory(LinkedHashMap<String, PendingNode>),
    File(FileEntry),
}

/// Mutable staging area for a tree. Directories are immutable once built
/// because their fingerprints depend on every descendant.
#[derive(Debug)]
pub struct TreeBuilder {
    root: LinkedHashMap<String, PendingNode>,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self {
            root: LinkedHashMap::new(),
        }
    }

    /// Inserts a file at a slash-separated relative path, creating
    /// intermediate directories as needed.
    pub fn insert_file(&mut self, path: &str, file: FileEntry) -> Result<(), TreeBuildError> {
        let (parent, name) = self.parent_of(path)?;
        match parent.get(name) {
            Some(PendingNode::Directory(_)) => OccupiedByDirectorySnafu { path }.fail(),
            _ => {
                // `replace` keeps a re-inserted name at its first-seen position.
                parent.replace(name.to_string(), PendingNode::File(file));
                Ok(())
            }
        }
    }

    /// Inserts a directory, which may stay empty.
    pub fn insert_directory(&mut self, path: &str) -> Result<(), TreeBuildError> {
        let (parent, name) = self.parent_of(path)?;
        match parent.get(name) {
            Some(PendingNode::Directory(_)) => Ok(()),
            Some(PendingNode::File(_)) => CannotInsertIntoFileSnafu { path }.fail(),
            None => {
                parent.insert(
                    name.to_string(),
                    PendingNode::Directory(LinkedHashMap::new()),
                );
                Ok(())
            }
        }
    }

    pub fn build(self) -> Arc<TreeNode> {
        Arc::new(TreeNode::Directory(Self::build_directory(self.root)))
    }

    fn build_directory(pending: LinkedHashMap<String, PendingNode>) -> Directory {
        let entries = pending
            .into_iter()
            .map(|(name, node)| {
                let node = match node {
                    PendingNode::Directory(children) => {
                        TreeNode::Directory(Self::build_directory(children))
                    }
                    PendingNode::File(file) => TreeNode::File(file),
                };
                (name, Arc::new(node))
            })
            .collect();
        Directory::new(entries)
    }

    fn parent_of<'a>(
        &mut self,
        path: &'a str,
    ) -> Result<(&mut LinkedHashMap<String, PendingNode>, &'a str), TreeBuildError> {
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        let mut current = &mut self.root;

        while let Some(name) = components.next() {
            if components.peek().is_none() {
                return Ok((current, name));
            }
            let child = match current.entry(name.to_string()) {
                Entry::Occupied(existing) => existing.into_mut(),
                Entry::Vacant(slot) => slot.insert(PendingNode::Directory(LinkedHashMap::new())),
            };
            current = match child {
                PendingNode::Directory(children) => children,
                PendingNode::File(_) => return CannotInsertIntoFileSnafu { path }.fail(),
            };
        }

        EmptyPathSnafu.fail()
    }
}

#[derive(Debug, Snafu)]
pub enum TreeBuildError {
    #[snafu(display("Cannot insert {} below a file", path))]
    CannotInsertIntoFile { path: String },
    #[snafu(display("Cannot replace directory {} with a file", path))]
    OccupiedByDirectory { path: String },
    #[snafu(display("Cannot insert an empty path"))]
    EmptyPath,
}
