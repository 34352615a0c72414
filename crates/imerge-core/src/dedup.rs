//! Content identity and the hardlink dedup index.
//!
//! Two image entries sharing a (device, inode) pair are the same bytes. Once
//! one of them has been installed, later ones can be hardlinked to the
//! installed copy instead of being copied again.

use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt as _;
use std::path::PathBuf;

/// The (device, inode) pair identifying a source entry's content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentIdentity {
    /// Device id (`st_dev`).
    pub dev: u64,
    /// Inode number (`st_ino`).
    pub ino: u64,
}

impl ContentIdentity {
    /// Identity of already-fetched metadata.
    #[must_use]
    pub fn of(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

/// Destination paths already populated from each content identity during
/// the lifetime of one merge engine.
#[derive(Debug, Default)]
pub struct DedupIndex {
    merged: HashMap<ContentIdentity, Vec<PathBuf>>,
}

impl DedupIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `dest` now holds the content of `identity`.
    pub fn insert(&mut self, identity: ContentIdentity, dest: PathBuf) {
        let paths = self.merged.entry(identity).or_default();
        if !paths.contains(&dest) {
            paths.push(dest);
        }
    }

    /// Destinations installed from `identity`, oldest first.
    #[must_use]
    pub fn candidates(&self, identity: &ContentIdentity) -> &[PathBuf] {
        self.merged.get(identity).map_or(&[], Vec::as_slice)
    }

    /// Number of distinct identities tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.merged.len()
    }

    /// Returns `true` if nothing has been installed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ContentIdentity = ContentIdentity { dev: 1, ino: 10 };
    const B: ContentIdentity = ContentIdentity { dev: 1, ino: 11 };

    #[test]
    fn empty_index_has_no_candidates() {
        let index = DedupIndex::new();
        assert!(index.is_empty());
        assert!(index.candidates(&A).is_empty());
    }

    #[test]
    fn candidates_keep_insertion_order_without_duplicates() {
        let mut index = DedupIndex::new();
        index.insert(A, PathBuf::from("/root/usr/bin/a"));
        index.insert(A, PathBuf::from("/root/usr/bin/b"));
        index.insert(A, PathBuf::from("/root/usr/bin/a"));
        index.insert(B, PathBuf::from("/root/usr/bin/c"));

        assert_eq!(index.len(), 2);
        assert_eq!(
            index.candidates(&A),
            &[PathBuf::from("/root/usr/bin/a"), PathBuf::from("/root/usr/bin/b")]
        );
        assert_eq!(index.candidates(&B), &[PathBuf::from("/root/usr/bin/c")]);
    }

    #[test]
    fn hardlinked_files_share_identity() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        std::fs::write(&a, "same").unwrap();
        std::fs::hard_link(&a, &b).unwrap();
        std::fs::write(&c, "same").unwrap();

        let ia = ContentIdentity::of(&std::fs::symlink_metadata(&a).unwrap());
        assert_eq!(ia, ContentIdentity::of(&std::fs::symlink_metadata(&b).unwrap()));
        assert_ne!(ia, ContentIdentity::of(&std::fs::symlink_metadata(&c).unwrap()));
    }
}
