//! Recorder contract.
//!
//! The engine keeps no durable state of its own. Every finalized entry is
//! reported to a [`Recorder`] exactly once; the recorder decides how (and
//! whether) to persist it. The same trait receives the human-readable
//! progress output, with stdout defaults.

use std::ffi::OsString;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::flags::MergeStatus;

/// Kind-specific data of a recorded entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordKind {
    /// A regular file.
    File {
        /// Name actually written when config protection redirected the
        /// install (`._cfg0000_foo.conf`); `None` when installed under its
        /// own name.
        installed_as: Option<OsString>,
        /// Lowercase hex SHA-256 of the installed content.
        content_hash: String,
        /// Modification time of the installed file, seconds since the epoch.
        mtime: i64,
    },
    /// A directory.
    Dir,
    /// A symbolic link.
    Symlink {
        /// Link target as installed (after any rewrite).
        target: PathBuf,
        /// Modification time of the link itself.
        mtime: i64,
    },
}

/// One finalized filesystem entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEntry {
    /// Path relative to the destination root, with a leading `/`.
    pub path: PathBuf,
    /// How the entry was installed.
    pub status: MergeStatus,
    /// Kind-specific data.
    pub kind: RecordKind,
}

impl RecordedEntry {
    /// Short type tag used in progress output.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self.kind {
            RecordKind::File { .. } => "[obj]",
            RecordKind::Dir => "[dir]",
            RecordKind::Symlink { .. } => "[sym]",
        }
    }

    /// The progress line for this entry: marker, tag, path, and the
    /// protected install name in parentheses when there is one.
    #[must_use]
    pub fn progress_line(&self) -> String {
        let mut line = format!(
            "{} {} {}",
            self.status.arrows(),
            self.tag(),
            self.path.display()
        );
        if let RecordKind::File {
            installed_as: Some(name),
            ..
        } = &self.kind
        {
            line.push_str(&format!(" ({})", name.to_string_lossy()));
        }
        line
    }
}

/// Receiver of engine output.
pub trait Recorder {
    /// Persist one finalized entry.
    ///
    /// # Errors
    /// A returned message aborts the merge.
    fn record(&mut self, entry: &RecordedEntry) -> Result<(), String>;

    /// One human-readable status line (installed, retained, skipped).
    fn status_line(&mut self, line: &str) {
        println!("{line}");
    }

    /// The check pass is starting.
    fn check_started(&mut self, root: &Path) {
        print!(">>> Checking whether we can merge to {} ", root.display());
        let _ = std::io::stdout().flush();
    }

    /// The check pass entered another directory.
    fn check_progress(&mut self) {
        print!(".");
        let _ = std::io::stdout().flush();
    }

    /// The check pass found a fatal problem.
    fn check_problem(&mut self, message: &str) {
        println!(".");
        println!("!!! {message}");
    }

    /// The check pass is done.
    fn check_finished(&mut self, _ok: bool) {
        println!();
    }

    /// The merge pass is starting.
    fn merge_started(&mut self, root: &Path) {
        println!(">>> Merging to {}", root.display());
    }
}

/// A recorder that keeps everything in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryRecorder {
    /// Recorded entries, in install order.
    pub entries: Vec<RecordedEntry>,
    /// Status lines, in output order.
    pub lines: Vec<String>,
    /// Problems reported by the check pass.
    pub problems: Vec<String>,
    /// Number of directories the check pass visited.
    pub dirs_checked: usize,
}

impl MemoryRecorder {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded entry for a root-relative path, if any.
    #[must_use]
    pub fn entry(&self, path: &str) -> Option<&RecordedEntry> {
        self.entries.iter().find(|e| e.path == Path::new(path))
    }

    /// How many times a root-relative path was recorded.
    #[must_use]
    pub fn count(&self, path: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.path == Path::new(path))
            .count()
    }
}

impl Recorder for MemoryRecorder {
    fn record(&mut self, entry: &RecordedEntry) -> Result<(), String> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn status_line(&mut self, line: &str) {
        self.lines.push(line.to_owned());
    }

    fn check_started(&mut self, _root: &Path) {}

    fn check_progress(&mut self) {
        self.dirs_checked += 1;
    }

    fn check_problem(&mut self, message: &str) {
        self.problems.push(message.to_owned());
    }

    fn check_finished(&mut self, _ok: bool) {}

    fn merge_started(&mut self, _root: &Path) {}
}
