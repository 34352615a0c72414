//! Security-labeling collaborator.
//!
//! The engine asks for a label before it creates or renames any filesystem
//! object and applies whatever comes back. Computing labels (SELinux file
//! contexts and the like) is the collaborator's business; [`NoLabels`] is the
//! disabled implementation.

use std::path::Path;

/// An opaque security label (e.g. `system_u:object_r:etc_t:s0`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SecurityLabel(pub String);

impl SecurityLabel {
    /// The raw label string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Label lookup and application.
///
/// Errors are plain strings; the engine wraps them into
/// [`MergeError::Label`](crate::MergeError::Label) with the path attached.
pub trait SecurityLabeler {
    /// Whether labeling is active. Subtree relabeling before a directory
    /// rename is only performed when this returns `true`.
    fn enabled(&self) -> bool;

    /// The label an object of `mode` should carry at `dest`, or `None` when
    /// no label applies.
    ///
    /// # Errors
    /// Returns a description of the lookup failure.
    fn label_for(&self, dest: &Path, mode: u32) -> Result<Option<SecurityLabel>, String>;

    /// Apply `label` to the object at `path` (not following symlinks).
    ///
    /// # Errors
    /// Returns a description of the failure.
    fn apply(&self, path: &Path, label: &SecurityLabel) -> Result<(), String>;
}

/// Labeling disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLabels;

impl SecurityLabeler for NoLabels {
    fn enabled(&self) -> bool {
        false
    }

    fn label_for(&self, _dest: &Path, _mode: u32) -> Result<Option<SecurityLabel>, String> {
        Ok(None)
    }

    fn apply(&self, _path: &Path, _label: &SecurityLabel) -> Result<(), String> {
        Ok(())
    }
}
