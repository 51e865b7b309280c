use derive_more::Display;

/// Counts of the mutations one `update` performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
#[display(
    "{created_directories} dirs created, {linked} linked, {copied} copied, {unlinked} unlinked, {removed_directories} dirs removed"
)]
pub struct ChangeStats {
    pub created_directories: usize,
    pub removed_directories: usize,
    pub linked: usize,
    pub copied: usize,
    pub unlinked: usize,
    /// The incremental pass failed and the output was rebuilt from scratch.
    pub repaired: bool,
}

impl ChangeStats {
    pub fn mutations(&self) -> usize {
        self.created_directories
            + self.removed_directories
            + self.linked
            + self.copied
            + self.unlinked
    }
}
