//! Classification of filesystem entries.
//!
//! [`classify`] uses `lstat` semantics: a symlink is reported as
//! [`EntryKind::Symlink`], never as the kind of its target.

use std::fmt;
use std::io;
use std::path::Path;

use crate::error::{MergeError, Result};

/// The kind of entry found at a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Nothing exists at the path.
    Absent,
    /// A symbolic link (target not followed).
    Symlink,
    /// A regular file.
    RegularFile,
    /// A directory.
    Directory,
    /// A fifo, socket, or device node.
    Other,
}

impl EntryKind {
    /// All kinds, in table order.
    pub const ALL: [Self; 5] = [
        Self::Absent,
        Self::Symlink,
        Self::RegularFile,
        Self::Directory,
        Self::Other,
    ];

    /// Row/column index into the dispatch table.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Absent => 0,
            Self::Symlink => 1,
            Self::RegularFile => 2,
            Self::Directory => 3,
            Self::Other => 4,
        }
    }

    /// Classify already-fetched `symlink_metadata`.
    #[must_use]
    pub fn from_file_type(file_type: std::fs::FileType) -> Self {
        if file_type.is_symlink() {
            Self::Symlink
        } else if file_type.is_file() {
            Self::RegularFile
        } else if file_type.is_dir() {
            Self::Directory
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "nothing"),
            Self::Symlink => write!(f, "symlink"),
            Self::RegularFile => write!(f, "file"),
            Self::Directory => write!(f, "directory"),
            Self::Other => write!(f, "special file"),
        }
    }
}

/// Classify the entry at `path` without following a final symlink.
///
/// # Errors
/// Returns [`MergeError::Io`] for any stat failure other than "not found".
pub fn classify(path: &Path) -> Result<EntryKind> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => Ok(EntryKind::from_file_type(meta.file_type())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(EntryKind::Absent),
        Err(e) => Err(MergeError::io("lstat", path)(e)),
    }
}

/// Classify the entry a path resolves to, following symlinks.
///
/// A dangling symlink or an unresolvable path is reported as
/// [`EntryKind::Absent`].
#[must_use]
pub fn classify_resolved(path: &Path) -> EntryKind {
    std::fs::canonicalize(path)
        .ok()
        .and_then(|real| classify(&real).ok())
        .unwrap_or(EntryKind::Absent)
}
