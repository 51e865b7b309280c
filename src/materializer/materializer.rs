use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, info, instrument, trace, warn};

use crate::ext::PathDisplayExt;
use crate::filesystem::{
    ChangeApplier, ChangeError, Directory, FsChangeApplier, TreeNode, can_symlink,
};
use crate::materializer::ChangeStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeOptions {
    /// Copy file contents even where symlinks are available.
    pub force_copy: bool,
}

#[derive(Debug, Clone)]
enum MaterializerState {
    /// Nothing has been written yet; whatever is on disk is unknown.
    Fresh,
    /// The output matches this tree.
    Clean(Arc<TreeNode>),
    /// The last update failed; the output is in an unknown state.
    Error,
}

/// Keeps one output directory in sync with a sequence of trees.
///
/// Each instance owns the baseline for its output path, so there must be
/// exactly one instance per path. `update` takes `&mut self` to keep it that way.
#[derive(Debug)]
pub struct Materializer<A: ChangeApplier = FsChangeApplier> {
    output: PathBuf,
    applier: A,
    can_symlink: bool,
    state: MaterializerState,
}

impl Materializer<FsChangeApplier> {
    pub fn new(output: impl Into<PathBuf>, options: MaterializeOptions) -> Self {
        let use_symlinks = !options.force_copy && can_symlink();
        Self::with_applier(output, FsChangeApplier, use_symlinks)
    }
}

impl<A: ChangeApplier> Materializer<A> {
    pub fn with_applier(output: impl Into<PathBuf>, applier: A, can_symlink: bool) -> Self {
        Self {
            output: output.into(),
            applier,
            can_symlink,
            state: MaterializerState::Fresh,
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn applier(&self) -> &A {
        &self.applier
    }

    pub fn uses_symlinks(&self) -> bool {
        self.can_symlink
    }

    /// True when the last update succeeded.
    pub fn is_clean(&self) -> bool {
        matches!(self.state, MaterializerState::Clean(_))
    }

    /// Converges the output directory to `new_tree`.
    ///
    /// If the incremental pass fails, the output is deleted and rebuilt once
    /// from scratch. If that fails too the error is returned and the next
    /// call starts with a full rebuild.
    #[instrument(skip_all, fields(output = %self.output.display()))]
    pub fn update(
        &mut self,
        new_tree: Arc<TreeNode>,
    ) -> Result<ChangeStats, MaterializationError> {
        ensure!(
            new_tree.is_directory(),
            RootNotDirectorySnafu {
                path: self.output.clone(),
            }
        );

        let previous = mem::replace(&mut self.state, MaterializerState::Error);
        let stats = match previous {
            MaterializerState::Clean(baseline) => {
                self.update_incrementally(&baseline, &new_tree)?
            }
            MaterializerState::Fresh => {
                debug!("No baseline yet, materializing from scratch");
                self.rebuild(&new_tree)?
            }
            MaterializerState::Error => {
                warn!(
                    "Previous update of {} failed, rebuilding from scratch",
                    self.output.display()
                );
                let mut stats = self.rebuild(&new_tree)?;
                stats.repaired = true;
                stats
            }
        };

        debug!(%stats, "Output updated");
        self.state = MaterializerState::Clean(new_tree);
        Ok(stats)
    }

    fn update_incrementally(
        &self,
        baseline: &Arc<TreeNode>,
        new_tree: &Arc<TreeNode>,
    ) -> Result<ChangeStats, MaterializationError> {
        if !self.output_is_directory() {
            warn!(
                "Output {} is missing or was replaced, rebuilding from scratch",
                self.output.display()
            );
            return self.repair(new_tree);
        }

        let mut stats = ChangeStats::default();
        match self.apply(&self.output, Some(baseline), Some(new_tree), &mut stats) {
            Ok(()) => Ok(stats),
            Err(error) => {
                warn!(
                    "Incremental update of {} failed ({error}), rebuilding from scratch",
                    self.output.display()
                );
                self.repair(new_tree)
            }
        }
    }

    fn repair(&self, new_tree: &Arc<TreeNode>) -> Result<ChangeStats, MaterializationError> {
        let mut stats = self.rebuild(new_tree)?;
        stats.repaired = true;
        warn!("Recovered {} with a full rebuild", self.output.display());
        Ok(stats)
    }

    fn rebuild(&self, new_tree: &Arc<TreeNode>) -> Result<ChangeStats, MaterializationError> {
        let mut stats = ChangeStats::default();
        self.applier
            .remove_all(&self.output)
            .and_then(|()| self.applier.create_parents(&self.output))
            .and_then(|()| self.apply(&self.output, None, Some(new_tree), &mut stats))
            .context(ApplySnafu {
                path: self.output.clone(),
            })?;
        info!(%stats, "Rebuilt {}", self.output.display());
        Ok(stats)
    }

    fn output_is_directory(&self) -> bool {
        fs::symlink_metadata(&self.output)
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false)
    }

    /// Makes `path` match `new`, given that it currently matches `old`.
    fn apply(
        &self,
        path: &Path,
        old: Option<&Arc<TreeNode>>,
        new: Option<&Arc<TreeNode>>,
        stats: &mut ChangeStats,
    ) -> Result<(), ChangeError> {
        let new = match (old, new) {
            (None, None) => return Ok(()),
            (Some(old), None) => return self.remove(path, old, stats),
            (_, Some(new)) => new,
        };

        if old.is_some_and(|old| self.is_unchanged(old, new)) {
            trace!(path = %path.display(), "unchanged");
            return Ok(());
        }

        match new.as_ref() {
            TreeNode::Directory(new_directory) => match old.map(Arc::as_ref) {
                Some(TreeNode::Directory(old_directory)) => {
                    self.apply_entries(path, Some(old_directory), new_directory, stats)
                }
                Some(TreeNode::File(_)) => {
                    self.applier.unlink(path)?;
                    stats.unlinked += 1;
                    self.create_directory(path, new_directory, stats)
                }
                None => self.create_directory(path, new_directory, stats),
            },
            TreeNode::File(file) => {
                if let Some(old) = old {
                    self.remove(path, old, stats)?;
                }
                self.applier
                    .copy_or_link(&file.source_path, path, self.can_symlink)?;
                if self.can_symlink {
                    stats.linked += 1;
                } else {
                    stats.copied += 1;
                }
                Ok(())
            }
        }
    }

    fn create_directory(
        &self,
        path: &Path,
        directory: &Directory,
        stats: &mut ChangeStats,
    ) -> Result<(), ChangeError> {
        self.applier.mkdir(path)?;
        stats.created_directories += 1;
        self.apply_entries(path, None, directory, stats)
    }

    fn apply_entries(
        &self,
        path: &Path,
        old: Option<&Directory>,
        new: &Directory,
        stats: &mut ChangeStats,
    ) -> Result<(), ChangeError> {
        if let Some(old) = old {
            for (name, old_child) in old.entries() {
                if !new.contains(name) {
                    self.remove(&path.join(name), old_child, stats)?;
                }
            }
        }

        for (name, new_child) in new.entries() {
            let old_child = old.and_then(|old| old.get(name));
            self.apply(&path.join(name), old_child, Some(new_child), stats)?;
        }
        Ok(())
    }

    /// Deletes `node` from `path`, children before their directory.
    fn remove(
        &self,
        path: &Path,
        node: &TreeNode,
        stats: &mut ChangeStats,
    ) -> Result<(), ChangeError> {
        match node {
            TreeNode::File(_) => {
                self.applier.unlink(path)?;
                stats.unlinked += 1;
            }
            TreeNode::Directory(directory) => {
                for (name, child) in directory.entries() {
                    self.remove(&path.join(name), child, stats)?;
                }
                self.applier.rmdir(path)?;
                stats.removed_directories += 1;
            }
        }
        Ok(())
    }

    fn is_unchanged(&self, old: &Arc<TreeNode>, new: &Arc<TreeNode>) -> bool {
        if Arc::ptr_eq(old, new) {
            return true;
        }
        match (old.as_ref(), new.as_ref()) {
            (TreeNode::Directory(old), TreeNode::Directory(new)) => {
                old.fingerprint() == new.fingerprint()
            }
            (TreeNode::File(old), TreeNode::File(new)) => {
                old.source_path == new.source_path
                    && (self.can_symlink || old.same_metadata(new))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum MaterializationError {
    #[snafu(display(
        "Only a directory can be materialized at {}",
        path.display_best_effort()
    ))]
    RootNotDirectory { path: PathBuf },
    #[snafu(display("Failed to materialize {}", path.display_best_effort()))]
    ApplyError { path: PathBuf, source: ChangeError },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::scan;
    use crate::merge::{MergeInput, MergeOptions, merge};
    use rstest::*;
    use std::cell::Cell;
    use std::collections::BTreeMap;
    use std::fs::File;
    use std::io;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    /// Log sink shared between a scoped subscriber and the test body.
    #[derive(Debug, Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }

        fn warnings(&self) -> Vec<String> {
            self.contents()
                .lines()
                .filter(|line| line.contains("WARN"))
                .map(str::to_string)
                .collect()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Runs `body` with every event on this thread written to the returned logs.
    fn capture_logs<T>(body: impl FnOnce() -> T) -> (T, CapturedLogs) {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let result = tracing::subscriber::with_default(subscriber, body);
        (result, logs)
    }

    fn assert_warned_about(logs: &CapturedLogs, output: &Path) {
        let output = output.display().to_string();
        let warnings = logs.warnings();
        assert!(
            warnings.iter().any(|line| line.contains(&output)),
            "No warning mentions {output}: {warnings:?}"
        );
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Entry {
        Directory,
        File(Vec<u8>),
    }

    /// Everything under `root`, with file contents read through links.
    fn snapshot(root: &Path) -> BTreeMap<String, Entry> {
        walkdir::WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .map(|entry| {
                let entry = entry.expect("Failed to walk output");
                let relative = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/");
                let content = if entry.file_type().is_dir() {
                    Entry::Directory
                } else {
                    Entry::File(fs::read(entry.path()).expect("Failed to read output file"))
                };
                (relative, content)
            })
            .collect()
    }

    fn symlink_count(root: &Path) -> usize {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.path_is_symlink())
            .count()
    }

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    struct Fixture {
        temp_dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                temp_dir: TempDir::new().expect("Failed to create temp directory"),
            }
        }

        fn input(&self, name: &str) -> PathBuf {
            let path = self.temp_dir.path().join("inputs").join(name);
            fs::create_dir_all(&path).unwrap();
            path
        }

        fn output(&self, name: &str) -> PathBuf {
            self.temp_dir.path().join("outputs").join(name)
        }

        fn materializer(&self, name: &str, link: bool) -> Materializer {
            Materializer::with_applier(self.output(name), FsChangeApplier, link)
        }
    }

    fn tree(roots: &[&Path]) -> Arc<TreeNode> {
        let inputs = roots
            .iter()
            .map(|root| MergeInput::new(scan(root).expect("Failed to scan"), *root))
            .collect::<Vec<_>>();
        merge(&inputs, MergeOptions { overwrite: true }).expect("Failed to merge")
    }

    fn skip_without_symlinks(link: bool) -> bool {
        link && !can_symlink()
    }

    #[rstest]
    #[case::symlink(true)]
    #[case::copy(false)]
    fn materializes_merged_inputs(#[case] link: bool) {
        if skip_without_symlinks(link) {
            return;
        }
        let fixture = Fixture::new();
        let a = fixture.input("a");
        let b = fixture.input("b");
        write(&a, "index.html", "<html>");
        write(&a, "css/site.css", "body{}");
        write(&b, "css/extra.css", "p{}");
        write(&b, "js/app.js", "run()");
        fs::create_dir_all(b.join("empty")).unwrap();

        let mut materializer = fixture.materializer("out", link);
        let stats = materializer.update(tree(&[&a, &b])).unwrap();

        let out = fixture.output("out");
        let snapshot = snapshot(&out);
        assert_eq!(snapshot["index.html"], Entry::File(b"<html>".to_vec()));
        assert_eq!(snapshot["css/site.css"], Entry::File(b"body{}".to_vec()));
        assert_eq!(snapshot["css/extra.css"], Entry::File(b"p{}".to_vec()));
        assert_eq!(snapshot["js/app.js"], Entry::File(b"run()".to_vec()));
        assert_eq!(snapshot["empty"], Entry::Directory);
        assert_eq!(snapshot.len(), 7);

        assert_eq!(symlink_count(&out), if link { 4 } else { 0 });
        assert_eq!(stats.linked + stats.copied, 4);
        assert!(!stats.repaired);
        assert!(materializer.is_clean());
    }

    #[rstest]
    #[case::symlink(true)]
    #[case::copy(false)]
    fn second_identical_update_changes_nothing(#[case] link: bool) {
        if skip_without_symlinks(link) {
            return;
        }
        let fixture = Fixture::new();
        let a = fixture.input("a");
        write(&a, "dir/one.txt", "1");
        write(&a, "two.txt", "2");

        let mut materializer = fixture.materializer("out", link);
        materializer.update(tree(&[&a])).unwrap();
        let stats = materializer.update(tree(&[&a])).unwrap();

        assert_eq!(stats.mutations(), 0);
        assert!(!stats.repaired);
    }

    #[test]
    fn same_tree_object_short_circuits() {
        let fixture = Fixture::new();
        let a = fixture.input("a");
        write(&a, "file.txt", "x");
        let scanned = tree(&[&a]);

        let mut materializer = fixture.materializer("out", false);
        materializer.update(Arc::clone(&scanned)).unwrap();
        let stats = materializer.update(scanned).unwrap();

        assert_eq!(stats, ChangeStats::default());
    }

    #[rstest]
    #[case::symlink(true)]
    #[case::copy(false)]
    fn round_trip_leaves_nothing_behind(#[case] link: bool) {
        if skip_without_symlinks(link) {
            return;
        }
        let fixture = Fixture::new();
        let first = fixture.input("first");
        let second = fixture.input("second");
        write(&first, "keep.txt", "keep");
        write(&first, "docs/guide.md", "guide");
        write(&second, "keep.txt", "other keep");
        write(&second, "extra/deep/file.txt", "extra");
        write(&second, "docs", "now a file");

        let mut materializer = fixture.materializer("cycled", link);
        materializer.update(tree(&[&first])).unwrap();
        materializer.update(tree(&[&second])).unwrap();
        materializer.update(tree(&[&first])).unwrap();

        let mut fresh = fixture.materializer("fresh", link);
        fresh.update(tree(&[&first])).unwrap();

        assert_eq!(
            snapshot(&fixture.output("cycled")),
            snapshot(&fixture.output("fresh"))
        );
    }

    #[rstest]
    #[case::symlink(true)]
    #[case::copy(false)]
    fn path_can_flip_between_file_and_directory(#[case] link: bool) {
        if skip_without_symlinks(link) {
            return;
        }
        let fixture = Fixture::new();
        let as_file = fixture.input("as_file");
        let as_dir = fixture.input("as_dir");
        write(&as_file, "x", "plain");
        write(&as_dir, "x/inner/leaf.txt", "leaf");

        let mut materializer = fixture.materializer("out", link);
        let out = fixture.output("out");

        materializer.update(tree(&[&as_file])).unwrap();
        assert!(out.join("x").is_file());

        let stats = materializer.update(tree(&[&as_dir])).unwrap();
        assert!(out.join("x").is_dir());
        assert_eq!(fs::read_to_string(out.join("x/inner/leaf.txt")).unwrap(), "leaf");
        assert!(!stats.repaired);

        let stats = materializer.update(tree(&[&as_file])).unwrap();
        assert_eq!(fs::read_to_string(out.join("x")).unwrap(), "plain");
        assert_eq!(stats.removed_directories, 2);
        assert!(!stats.repaired);
    }

    #[test]
    fn symlink_and_copy_modes_produce_identical_trees() {
        if !can_symlink() {
            return;
        }
        let fixture = Fixture::new();
        let a = fixture.input("a");
        let b = fixture.input("b");
        write(&a, "one/two/three.txt", "3");
        write(&a, "root.txt", "r");
        write(&b, "one/four.txt", "4");

        let mut linked = fixture.materializer("linked", true);
        let mut copied = fixture.materializer("copied", false);
        linked.update(tree(&[&a, &b])).unwrap();
        copied.update(tree(&[&a, &b])).unwrap();

        assert_eq!(
            snapshot(&fixture.output("linked")),
            snapshot(&fixture.output("copied"))
        );
        assert_eq!(symlink_count(&fixture.output("linked")), 3);
        assert_eq!(symlink_count(&fixture.output("copied")), 0);
    }

    #[test]
    fn copy_mode_skips_unchanged_files_and_recopies_touched_ones() {
        let fixture = Fixture::new();
        let a = fixture.input("a");
        write(&a, "stable.txt", "stable");
        write(&a, "touched.txt", "before");
        let epoch = SystemTime::UNIX_EPOCH + Duration::from_secs(1_650_000_000);
        set_mtime(&a.join("stable.txt"), epoch);
        set_mtime(&a.join("touched.txt"), epoch);

        let mut materializer = fixture.materializer("out", false);
        materializer.update(tree(&[&a])).unwrap();

        let unchanged = materializer.update(tree(&[&a])).unwrap();
        assert_eq!(unchanged.copied, 0);

        fs::write(a.join("touched.txt"), "after!").unwrap();
        set_mtime(&a.join("touched.txt"), epoch + Duration::from_secs(60));
        let stats = materializer.update(tree(&[&a])).unwrap();

        assert_eq!(stats.copied, 1);
        assert_eq!(stats.unlinked, 1);
        assert_eq!(stats.mutations(), 2);
        let out = fixture.output("out");
        assert_eq!(fs::read_to_string(out.join("touched.txt")).unwrap(), "after!");
        assert_eq!(
            fs::metadata(out.join("touched.txt")).unwrap().modified().unwrap(),
            epoch + Duration::from_secs(60)
        );
    }

    #[test]
    fn symlink_mode_ignores_metadata_only_changes() {
        if !can_symlink() {
            return;
        }
        let fixture = Fixture::new();
        let a = fixture.input("a");
        write(&a, "file.txt", "v1");

        let mut materializer = fixture.materializer("out", true);
        materializer.update(tree(&[&a])).unwrap();

        write(&a, "file.txt", "version two");
        let stats = materializer.update(tree(&[&a])).unwrap();

        assert_eq!(stats.mutations(), 0);
        assert_eq!(
            fs::read_to_string(fixture.output("out").join("file.txt")).unwrap(),
            "version two"
        );
    }

    #[rstest]
    #[case::symlink(true)]
    #[case::copy(false)]
    fn recovers_after_output_is_deleted(#[case] link: bool) {
        if skip_without_symlinks(link) {
            return;
        }
        let fixture = Fixture::new();
        let first = fixture.input("first");
        let second = fixture.input("second");
        write(&first, "a.txt", "a");
        write(&second, "b/c.txt", "c");

        let mut materializer = fixture.materializer("out", link);
        materializer.update(tree(&[&first])).unwrap();
        fs::remove_dir_all(fixture.output("out")).unwrap();

        let next = tree(&[&second]);
        let (stats, logs) = capture_logs(|| materializer.update(next));
        let stats = stats.unwrap();

        assert!(stats.repaired);
        assert!(materializer.is_clean());
        assert_warned_about(&logs, &fixture.output("out"));
        let snapshot = snapshot(&fixture.output("out"));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["b/c.txt"], Entry::File(b"c".to_vec()));
    }

    #[test]
    fn recovers_after_external_corruption() {
        let fixture = Fixture::new();
        let first = fixture.input("first");
        write(&first, "a/one.txt", "1");

        let mut materializer = fixture.materializer("out", false);
        materializer.update(tree(&[&first])).unwrap();

        let out = fixture.output("out");
        fs::remove_dir_all(out.join("a")).unwrap();
        fs::write(out.join("a"), "squatter").unwrap();
        write(&first, "a/two.txt", "2");

        let stats = materializer.update(tree(&[&first])).unwrap();
        assert!(stats.repaired);
        assert_eq!(fs::read_to_string(out.join("a/one.txt")).unwrap(), "1");
        assert_eq!(fs::read_to_string(out.join("a/two.txt")).unwrap(), "2");

        let settled = materializer.update(tree(&[&first])).unwrap();
        assert_eq!(settled.mutations(), 0);
    }

    #[test]
    fn fresh_materializer_replaces_stale_output() {
        let fixture = Fixture::new();
        let a = fixture.input("a");
        write(&a, "new.txt", "new");
        let out = fixture.output("out");
        write(&out, "stale/leftover.txt", "old");

        let mut materializer = fixture.materializer("out", false);
        let stats = materializer.update(tree(&[&a])).unwrap();

        assert!(!stats.repaired);
        assert_eq!(
            snapshot(&out).keys().collect::<Vec<_>>(),
            vec!["new.txt"]
        );
    }

    #[test]
    fn file_tree_cannot_be_materialized() {
        let fixture = Fixture::new();
        let a = fixture.input("a");
        write(&a, "f", "x");
        let file = Arc::clone(tree(&[&a]).as_directory().unwrap().get("f").unwrap());

        let mut materializer = fixture.materializer("out", false);
        let result = materializer.update(file);

        assert!(matches!(
            result,
            Err(MaterializationError::RootNotDirectory { .. })
        ));
        assert!(!fixture.output("out").exists());
    }

    /// Fails the next `failures` calls to `copy_or_link`, then behaves normally.
    #[derive(Debug, Default)]
    struct FlakyApplier {
        failures: Cell<usize>,
    }

    impl FlakyApplier {
        fn fail_next(&self, failures: usize) {
            self.failures.set(failures);
        }
    }

    impl ChangeApplier for FlakyApplier {
        fn unlink(&self, path: &Path) -> Result<(), ChangeError> {
            FsChangeApplier.unlink(path)
        }

        fn rmdir(&self, path: &Path) -> Result<(), ChangeError> {
            FsChangeApplier.rmdir(path)
        }

        fn remove_all(&self, path: &Path) -> Result<(), ChangeError> {
            FsChangeApplier.remove_all(path)
        }

        fn mkdir(&self, path: &Path) -> Result<(), ChangeError> {
            FsChangeApplier.mkdir(path)
        }

        fn create_parents(&self, path: &Path) -> Result<(), ChangeError> {
            FsChangeApplier.create_parents(path)
        }

        fn copy_or_link(
            &self,
            source: &Path,
            dest: &Path,
            can_symlink: bool,
        ) -> Result<(), ChangeError> {
            let remaining = self.failures.get();
            if remaining > 0 {
                self.failures.set(remaining - 1);
                return Err(ChangeError::CopyError {
                    from: source.to_path_buf(),
                    path: dest.to_path_buf(),
                    source: std::io::Error::other("injected failure"),
                });
            }
            FsChangeApplier.copy_or_link(source, dest, can_symlink)
        }
    }

    #[test]
    fn single_failure_is_repaired_by_one_rebuild() {
        let fixture = Fixture::new();
        let a = fixture.input("a");
        write(&a, "one.txt", "1");

        let mut materializer =
            Materializer::with_applier(fixture.output("out"), FlakyApplier::default(), false);
        materializer.update(tree(&[&a])).unwrap();

        write(&a, "two.txt", "2");
        materializer.applier().fail_next(1);
        let next = tree(&[&a]);
        let (stats, logs) = capture_logs(|| materializer.update(next));
        let stats = stats.unwrap();

        assert!(stats.repaired);
        assert_eq!(stats.copied, 2);
        assert_eq!(snapshot(&fixture.output("out")).len(), 2);
        assert_warned_about(&logs, &fixture.output("out"));
        assert_eq!(logs.warnings().len(), 2, "{}", logs.contents());
    }

    #[test]
    fn failed_repair_is_fatal_and_next_update_rebuilds() {
        let fixture = Fixture::new();
        let a = fixture.input("a");
        write(&a, "one.txt", "1");

        let mut materializer =
            Materializer::with_applier(fixture.output("out"), FlakyApplier::default(), false);
        materializer.update(tree(&[&a])).unwrap();

        write(&a, "two.txt", "2");
        materializer.applier().fail_next(2);
        let result = materializer.update(tree(&[&a]));

        assert!(matches!(
            result,
            Err(MaterializationError::ApplyError {
                source: ChangeError::CopyError { .. },
                ..
            })
        ));
        assert!(!materializer.is_clean());

        let stats = materializer.update(tree(&[&a])).unwrap();
        assert!(stats.repaired);
        assert!(materializer.is_clean());
        assert_eq!(
            snapshot(&fixture.output("out")).keys().collect::<Vec<_>>(),
            vec!["one.txt", "two.txt"]
        );
    }

    #[test]
    fn output_parent_directories_are_created() {
        let fixture = Fixture::new();
        let a = fixture.input("a");
        write(&a, "f.txt", "f");

        let mut materializer = fixture.materializer("deeply/nested/out", false);
        materializer.update(tree(&[&a])).unwrap();

        assert!(fixture.output("deeply/nested/out/f.txt").is_file());
    }
}
