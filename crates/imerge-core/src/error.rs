//! Error types for the merge engine.
//!
//! [`MergeError`] is the single error type returned by [`Merger`](crate::Merger)
//! operations. Structural conflicts only surface as errors during the merge
//! pass; during the check pass they are collected as problem strings instead.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors returned by the merge engine.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The image and destination disagree about what kind of entry lives at
    /// a path (file over directory, directory over file, ...).
    #[error("{message}")]
    Conflict {
        /// Human-readable description naming both paths.
        message: String,
    },

    /// A filesystem syscall failed.
    #[error("{op}({}) failed: {source}", path.display())]
    Io {
        /// The operation that failed (`rename`, `lchown`, ...).
        op: &'static str,
        /// The path the operation was applied to.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A path that must be a directory is not.
    #[error("{role} directory '{}' is not a directory", path.display())]
    NotADirectory {
        /// `"source"` or `"destination"`.
        role: &'static str,
        /// The offending path.
        path: PathBuf,
    },

    /// The security-labeling collaborator failed.
    #[error("could not set security label on '{}': {message}", path.display())]
    Label {
        /// The path being labeled.
        path: PathBuf,
        /// Collaborator-supplied detail.
        message: String,
    },

    /// The recorder refused a notification.
    #[error("recorder failed for '{}': {message}", path.display())]
    Record {
        /// The entry being recorded.
        path: PathBuf,
        /// Recorder-supplied detail.
        message: String,
    },

    /// A relocated subtree contained a fifo, socket or device node.
    #[error("unexpected special entry found at '{}'", path.display())]
    UnexpectedEntry {
        /// The offending path.
        path: PathBuf,
    },

    /// An image entry disappeared between listing and classification.
    #[error("image entry '{}' vanished during the merge", path.display())]
    SourceVanished {
        /// The missing source path.
        path: PathBuf,
    },
}

impl MergeError {
    /// Build a closure that wraps an [`io::Error`] for `op` on `path`.
    pub(crate) fn io<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Self + 'a {
        move |source| Self::Io {
            op,
            path: path.to_owned(),
            source,
        }
    }

    /// Returns `true` for structural conflicts.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T, E = MergeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_names_op_and_path() {
        let err = MergeError::io("rename", Path::new("/image/foo"))(io::Error::other("disk full"));
        let msg = err.to_string();
        assert!(msg.starts_with("rename(/image/foo) failed"), "{msg}");
        assert!(msg.contains("disk full"), "{msg}");
        assert!(!err.is_conflict());
    }

    #[test]
    fn not_a_directory_display() {
        let err = MergeError::NotADirectory {
            role: "destination",
            path: PathBuf::from("/root/usr"),
        };
        assert_eq!(
            err.to_string(),
            "destination directory '/root/usr' is not a directory"
        );
    }

    #[test]
    fn conflict_display_is_message() {
        let err = MergeError::Conflict {
            message: "cannot overwrite directory '/a' with file '/b'".to_owned(),
        };
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "cannot overwrite directory '/a' with file '/b'");
    }
}
