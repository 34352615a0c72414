//! The source-kind × destination-kind decision table.
//!
//! Every image entry is classified, the destination path is classified, and
//! the pair selects one [`Action`] from [`TABLE`]. The walk in
//! [`merger`](crate::merger) only interprets actions; policy lives here as
//! data.

use std::fmt;
use std::path::Path;

use crate::entry::EntryKind;

/// A structural clash between the image and the destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    /// A regular file would replace a directory.
    FileOverDir,
    /// A directory would replace a regular file.
    DirOverFile,
    /// A symlink would replace a directory.
    SymOverDir,
}

impl ConflictKind {
    /// Message naming both paths.
    #[must_use]
    pub fn message(self, src: &Path, dst: &Path) -> String {
        let (existing, incoming) = match self {
            Self::FileOverDir => ("directory", "file"),
            Self::DirOverFile => ("file", "directory"),
            Self::SymOverDir => ("directory", "symlink"),
        };
        format!(
            "Cannot overwrite {existing} '{}' with {incoming} '{}'",
            dst.display(),
            src.display()
        )
    }
}

/// What to do with one (source, destination) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing is in the way: install fresh.
    Install,
    /// Unlink the existing entry, then install (`UNLINKED_FIRST`).
    Replace,
    /// File over file: redirect to a `._cfg` name when protected, else
    /// replace.
    ProtectOrReplace,
    /// Directory over directory: reuse it and descend.
    MergeInPlace,
    /// Directory over symlink: reuse it if it resolves to a directory,
    /// otherwise a conflict.
    MergeThroughSymlink,
    /// Fatal in merge, recorded in check.
    Conflict(ConflictKind),
    /// The source is a fifo, socket or device node.
    Unrecognised,
    /// The source disappeared after being listed.
    SourceVanished,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Replace => write!(f, "replace"),
            Self::ProtectOrReplace => write!(f, "protect-or-replace"),
            Self::MergeInPlace => write!(f, "merge-in-place"),
            Self::MergeThroughSymlink => write!(f, "merge-through-symlink"),
            Self::Conflict(_) => write!(f, "conflict"),
            Self::Unrecognised => write!(f, "unrecognised"),
            Self::SourceVanished => write!(f, "source-vanished"),
        }
    }
}

use Action::{
    Conflict, Install, MergeInPlace, MergeThroughSymlink, ProtectOrReplace, Replace,
    SourceVanished, Unrecognised,
};
use ConflictKind::{DirOverFile, FileOverDir, SymOverDir};

/// Rows are the source kind, columns the destination kind, both in
/// [`EntryKind::ALL`] order: Absent, Symlink, RegularFile, Directory, Other.
pub const TABLE: [[Action; 5]; 5] = [
    // Absent
    [SourceVanished; 5],
    // Symlink
    [Install, Replace, Replace, Conflict(SymOverDir), Replace],
    // RegularFile
    [Install, Replace, ProtectOrReplace, Conflict(FileOverDir), Replace],
    // Directory
    [Install, MergeThroughSymlink, Conflict(DirOverFile), MergeInPlace, Replace],
    // Other
    [Unrecognised; 5],
];

/// Look up the action for a source/destination pair.
#[must_use]
pub const fn action_for(src: EntryKind, dst: EntryKind) -> Action {
    TABLE[src.index()][dst.index()]
}
