//! Per-entry install and unlink operations.
//!
//! Files go through an ordered chain of attempts: rename out of the image,
//! hardlink to an already installed copy of the same content, then a byte
//! copy through a temporary file renamed over the final name. Directories
//! are renamed wholesale when possible (followed by one pass over the moved
//! subtree) and created fresh otherwise.

use std::ffi::OsStr;
use std::fs::{self, File, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt as _, MetadataExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::dedup::ContentIdentity;
use crate::entry::EntryKind;
use crate::error::{MergeError, Result};
use crate::flags::MergeStatus;
use crate::label::SecurityLabel;
use crate::merger::{Merger, sorted_entries};
use crate::record::Recorder;

const S_IFDIR: u32 = 0o040_000;
const S_IFLNK: u32 = 0o120_000;
const PERMISSION_BITS: u32 = 0o7777;
const SETID_BITS: u32 = 0o7000;

/// How a directory ended up in place.
#[derive(Debug)]
pub(crate) struct DirInstall {
    pub status: MergeStatus,
    /// The whole source subtree was moved by one rename.
    pub relocated: bool,
}

/// Which step of the file fallback chain succeeded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FileMethod {
    Rename,
    Hardlink,
    Copy,
}

impl FileMethod {
    const fn status(self) -> MergeStatus {
        match self {
            Self::Rename => MergeStatus::RENAMED,
            Self::Hardlink => MergeStatus::AS_HARDLINK,
            Self::Copy => MergeStatus::COPIED,
        }
    }
}

impl<R: Recorder> Merger<R> {
    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    /// Install `src` into `dst_dir` under `dst_name` (which differs from the
    /// source name when config protection redirected it).
    pub(crate) fn install_file(
        &mut self,
        src: &Path,
        dst_dir: &Path,
        dst_name: &OsStr,
    ) -> Result<MergeStatus> {
        let logical = dst_dir.join(src.file_name().unwrap_or(dst_name));
        self.warn_hook(&self.entry_hook("merger_install_file_pre", src, &logical));

        let dst = dst_dir.join(dst_name);
        let meta = fs::symlink_metadata(src).map_err(MergeError::io("lstat", src))?;
        let perms = meta.mode() & PERMISSION_BITS;
        let preserve = self.request.options.preserve_image;
        let label = self.lookup_label(&dst, meta.mode())?;

        let mut status = MergeStatus::empty();
        if perms & SETID_BITS != 0 {
            status |= MergeStatus::SETID_BITS;
        }

        let own = self.ownership_for(meta.uid(), meta.gid());
        let (uid, gid) = own.resolve(meta.uid(), meta.gid());
        if own.changes() {
            status |= MergeStatus::FIXED_OWNERSHIP;
        }

        if !preserve {
            self.apply_label(src, label.as_ref())?;
            if own.changes() {
                std::os::unix::fs::chown(src, own.uid, own.gid)
                    .map_err(MergeError::io("chown", src))?;
            }
        }

        let identity = ContentIdentity::of(&meta);
        let method = if !preserve && Self::rename_into_place(src, &dst) {
            FileMethod::Rename
        } else if self.link_from_index(identity, &dst) {
            FileMethod::Hardlink
        } else {
            let ids = (!self.request.options.no_chown).then_some((uid, gid));
            if self.copy_into_place(src, &dst, perms, ids, label.as_ref())? {
                status |= MergeStatus::XATTR;
            }
            FileMethod::Copy
        };
        tracing::debug!(src = %src.display(), dst = %dst.display(), ?method, "installed file");

        if method != FileMethod::Hardlink {
            self.dedup.insert(identity, dst.clone());
        }
        if method == FileMethod::Rename {
            let now = FileTime::now();
            filetime::set_file_times(&dst, now, now).map_err(MergeError::io("utime", &dst))?;
            // rename can clear set-id bits on some filesystems
            fs::set_permissions(&dst, Permissions::from_mode(perms))
                .map_err(MergeError::io("chmod", &dst))?;
        }

        self.warn_hook(&self.entry_hook("merger_install_file_post", src, &logical));
        Ok(status | method.status())
    }

    /// `false` when the rename failed and the caller should fall back.
    fn rename_into_place(src: &Path, dst: &Path) -> bool {
        match fs::rename(src, dst) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(src = %src.display(), dst = %dst.display(), error = %e, "rename failed, falling back");
                false
            }
        }
    }

    fn link_from_index(&self, identity: ContentIdentity, dst: &Path) -> bool {
        for candidate in self.dedup.candidates(&identity) {
            match fs::hard_link(candidate, dst) {
                Ok(()) => return true,
                Err(e) => tracing::debug!(
                    from = %candidate.display(),
                    to = %dst.display(),
                    error = %e,
                    "link failed"
                ),
            }
        }
        false
    }

    /// Copy through a temporary file in the destination directory, then
    /// rename it over `dst`. Returns whether any extended attribute was
    /// copied.
    fn copy_into_place(
        &self,
        src: &Path,
        dst: &Path,
        perms: u32,
        ids: Option<(u32, u32)>,
        label: Option<&SecurityLabel>,
    ) -> Result<bool> {
        let dir = dst.parent().unwrap_or(Path::new("."));
        let mut input = File::open(src).map_err(MergeError::io("open", src))?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".imerge-midmerge.")
            .tempfile_in(dir)
            .map_err(MergeError::io("create temporary file in", dir))?;

        if let Some((uid, gid)) = ids {
            std::os::unix::fs::fchown(tmp.as_file(), Some(uid), Some(gid))
                .map_err(MergeError::io("fchown", tmp.path()))?;
        }
        tmp.as_file()
            .set_permissions(Permissions::from_mode(perms))
            .map_err(MergeError::io("fchmod", tmp.path()))?;
        let copied_xattrs = copy_xattrs(src, tmp.path());
        self.apply_label(tmp.path(), label)?;

        io::copy(&mut input, tmp.as_file_mut()).map_err(MergeError::io("write", tmp.path()))?;
        tmp.persist(dst)
            .map_err(|e| MergeError::io("rename", dst)(e.error))?;
        Ok(copied_xattrs)
    }

    // -----------------------------------------------------------------------
    // Directories
    // -----------------------------------------------------------------------

    pub(crate) fn install_dir(&mut self, src: &Path, dst_dir: &Path) -> Result<DirInstall> {
        let dst = dst_dir.join(src.file_name().unwrap_or_default());
        self.warn_hook(&self.entry_hook("merger_install_dir_pre", src, &dst));

        let meta = fs::symlink_metadata(src).map_err(MergeError::io("lstat", src))?;
        let mut mode = meta.mode() & PERMISSION_BITS;
        let preserve = self.request.options.preserve_image;

        let mut status = MergeStatus::empty();
        if mode & SETID_BITS != 0 {
            status |= MergeStatus::SETID_BITS;
        }

        let own = self.ownership_for(meta.uid(), meta.gid());
        let (uid, gid) = own.resolve(meta.uid(), meta.gid());
        if own.changes() {
            mode = own.strip_setid(mode);
            status |= MergeStatus::FIXED_OWNERSHIP;
            if !preserve {
                std::os::unix::fs::chown(src, own.uid, own.gid)
                    .map_err(MergeError::io("chown", src))?;
                fs::set_permissions(src, Permissions::from_mode(mode))
                    .map_err(MergeError::io("chmod", src))?;
            }
        }

        let label = self.lookup_label(&dst, S_IFDIR | mode)?;
        let relocated = if preserve {
            false
        } else {
            self.apply_label(src, label.as_ref())?;
            if self.env.labeler.enabled() {
                self.relabel_tree(src, &dst)?;
            }
            Self::rename_into_place(src, &dst)
        };

        if relocated {
            status |= MergeStatus::RENAMED;
        } else {
            fs::DirBuilder::new()
                .mode(mode)
                .create(&dst)
                .map_err(MergeError::io("mkdir", &dst))?;
            let handle = File::open(&dst).map_err(MergeError::io("open", &dst))?;
            if !self.request.options.no_chown {
                std::os::unix::fs::fchown(&handle, Some(uid), Some(gid))
                    .map_err(MergeError::io("fchown", &dst))?;
            }
            // mkdir applies the umask and drops set-id bits
            handle
                .set_permissions(Permissions::from_mode(mode))
                .map_err(MergeError::io("fchmod", &dst))?;
            if copy_xattrs(src, &dst) {
                status |= MergeStatus::XATTR;
            }
            self.apply_label(&dst, label.as_ref())?;
        }

        self.warn_hook(&self.entry_hook("merger_install_dir_post", src, &dst));
        Ok(DirInstall { status, relocated })
    }

    /// Label every entry of the source subtree for where it is about to land.
    fn relabel_tree(&self, src: &Path, dst: &Path) -> Result<()> {
        for entry in sorted_entries(src)? {
            let Some(name) = entry.file_name() else {
                continue;
            };
            let target = dst.join(name);
            let meta = fs::symlink_metadata(&entry).map_err(MergeError::io("lstat", &entry))?;
            let label = self.lookup_label(&target, meta.mode())?;
            self.apply_label(&entry, label.as_ref())?;
            if meta.is_dir() {
                self.relabel_tree(&entry, &target)?;
            }
        }
        Ok(())
    }

    /// The single pass over a subtree that was just moved into place:
    /// normalize ownership, repair symlinks into the image, and record every
    /// entry as installed by its parent's rename.
    pub(crate) fn record_relocated(&mut self, dir: &Path) -> Result<()> {
        for entry in sorted_entries(dir)? {
            let meta = fs::symlink_metadata(&entry).map_err(MergeError::io("lstat", &entry))?;
            let kind = EntryKind::from_file_type(meta.file_type());
            let mut status = MergeStatus::PARENT_RENAME;

            let own = self.ownership_for(meta.uid(), meta.gid());
            if own.changes() {
                std::os::unix::fs::lchown(&entry, own.uid, own.gid)
                    .map_err(MergeError::io("lchown", &entry))?;
                if kind == EntryKind::Directory {
                    let mode = own.strip_setid(meta.mode() & PERMISSION_BITS);
                    fs::set_permissions(&entry, Permissions::from_mode(mode))
                        .map_err(MergeError::io("chmod", &entry))?;
                }
                status |= MergeStatus::FIXED_OWNERSHIP;
            }

            let identity = ContentIdentity::of(&meta);
            match kind {
                EntryKind::Symlink => {
                    if let Some(fixed) = self.rewritten_target(&entry)? {
                        self.write_rewritten_symlink(&entry, &entry, &fixed)?;
                    }
                    self.record_sym(&entry, status)?;
                    self.dedup.insert(identity, entry);
                }
                EntryKind::RegularFile => {
                    let name = entry.file_name().unwrap_or_default();
                    self.record_file(dir, name, name, status)?;
                    self.dedup.insert(identity, entry);
                }
                EntryKind::Directory => {
                    self.record_dir(&entry, status)?;
                    self.record_relocated(&entry)?;
                }
                EntryKind::Other | EntryKind::Absent => {
                    return Err(MergeError::UnexpectedEntry { path: entry });
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Symlinks
    // -----------------------------------------------------------------------

    pub(crate) fn install_sym(&mut self, src: &Path, dst_dir: &Path) -> Result<MergeStatus> {
        let dst = dst_dir.join(src.file_name().unwrap_or_default());
        self.warn_hook(&self.entry_hook("merger_install_sym_pre", src, &dst));

        let meta = fs::symlink_metadata(src).map_err(MergeError::io("lstat", src))?;
        let own = self.ownership_for(meta.uid(), meta.gid());
        let label = self.lookup_label(&dst, S_IFLNK | 0o777)?;
        let identity = ContentIdentity::of(&meta);
        let mut status = MergeStatus::empty();

        if let Some(fixed) = self.rewritten_target(src)? {
            self.write_rewritten_symlink(src, &dst, &fixed)?;
            self.apply_label(&dst, label.as_ref())?;
        } else if self.link_from_index(identity, &dst) {
            status |= MergeStatus::AS_HARDLINK;
        } else {
            let target = fs::read_link(src).map_err(MergeError::io("readlink", src))?;
            std::os::unix::fs::symlink(&target, &dst).map_err(MergeError::io("symlink", &dst))?;
            self.apply_label(&dst, label.as_ref())?;
            self.dedup.insert(identity, dst.clone());
        }

        if own.changes() {
            std::os::unix::fs::lchown(&dst, own.uid, own.gid)
                .map_err(MergeError::io("lchown", &dst))?;
            status |= MergeStatus::FIXED_OWNERSHIP;
        }

        self.warn_hook(&self.entry_hook("merger_install_sym_post", src, &dst));
        Ok(status)
    }

    /// For a symlink whose target lies inside the image, the equivalent
    /// absolute target under the destination root.
    pub(crate) fn rewritten_target(&self, link: &Path) -> Result<Option<PathBuf>> {
        let target = fs::read_link(link).map_err(MergeError::io("readlink", link))?;
        Ok(target
            .strip_prefix(&self.real_image)
            .ok()
            .map(|rest| Path::new("/").join(rest)))
    }

    /// Replace whatever is at `dst` with a symlink to `fixed`.
    fn write_rewritten_symlink(&self, src: &Path, dst: &Path, fixed: &Path) -> Result<()> {
        let original = fs::read_link(src).map_err(MergeError::io("readlink", src))?;
        if !self.request.options.rewrite_broken_symlinks {
            return Err(MergeError::Conflict {
                message: format!(
                    "Symlink to image detected at: {} ({})",
                    src.display(),
                    original.display()
                ),
            });
        }
        tracing::warn!(
            link = %src.display(),
            from = %original.display(),
            to = %fixed.display(),
            "rewriting symlink that points into the image"
        );
        match fs::remove_file(dst) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(MergeError::io("unlink", dst)(e)),
        }
        std::os::unix::fs::symlink(fixed, dst).map_err(MergeError::io("symlink", dst))
    }

    // -----------------------------------------------------------------------
    // Unlink
    // -----------------------------------------------------------------------

    /// Remove the existing destination entry of `kind` at `path`.
    pub(crate) fn unlink(&self, path: &Path, kind: EntryKind) -> Result<()> {
        let noun = match kind {
            EntryKind::RegularFile => "file",
            EntryKind::Symlink => "sym",
            EntryKind::Directory => "dir",
            EntryKind::Other => "misc",
            EntryKind::Absent => return Ok(()),
        };
        let target = path.display().to_string();
        self.warn_hook(
            &self
                .hook(&format!("merger_unlink_{noun}_pre"))
                .with("UNLINK_TARGET", target.clone()),
        );

        if kind == EntryKind::RegularFile
            && let Ok(meta) = fs::symlink_metadata(path)
            && meta.mode() & 0o6000 != 0
        {
            fs::set_permissions(path, Permissions::from_mode(meta.mode() & 0o400))
                .map_err(MergeError::io("chmod", path))?;
        }

        let removed = if kind == EntryKind::Directory {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        match removed {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(MergeError::io("unlink", path)(e)),
        }

        self.warn_hook(
            &self
                .hook(&format!("merger_unlink_{noun}_post"))
                .with("UNLINK_TARGET", target),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Labels
    // -----------------------------------------------------------------------

    fn lookup_label(&self, dest: &Path, mode: u32) -> Result<Option<SecurityLabel>> {
        self.env
            .labeler
            .label_for(dest, mode)
            .map_err(|message| MergeError::Label {
                path: dest.to_owned(),
                message,
            })
    }

    fn apply_label(&self, path: &Path, label: Option<&SecurityLabel>) -> Result<()> {
        let Some(label) = label else {
            return Ok(());
        };
        self.env
            .labeler
            .apply(path, label)
            .map_err(|message| MergeError::Label {
                path: path.to_owned(),
                message,
            })
    }
}

/// Copy every extended attribute of `src` onto `dst`. Failures are logged
/// and never fatal. Returns whether anything was copied.
fn copy_xattrs(src: &Path, dst: &Path) -> bool {
    let names = match xattr::list(src) {
        Ok(names) => names,
        Err(e) => {
            if e.kind() != io::ErrorKind::Unsupported {
                tracing::warn!(path = %src.display(), error = %e, "could not list extended attributes");
            }
            return false;
        }
    };

    let mut copied = false;
    for name in names {
        let value = match xattr::get(src, &name) {
            Ok(Some(value)) => value,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(path = %src.display(), attr = ?name, error = %e, "could not read extended attribute");
                continue;
            }
        };
        match xattr::set(dst, &name, &value) {
            Ok(()) => copied = true,
            Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                tracing::warn!(path = %src.display(), "could not copy extended attributes");
                return copied;
            }
            Err(e) => {
                tracing::warn!(path = %src.display(), attr = ?name, error = %e, "could not set extended attribute");
            }
        }
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merger::{MergeEnv, MergeOptions, MergeRequest};
    use crate::record::MemoryRecorder;

    fn merger_in(image: &Path, root: &Path, options: MergeOptions) -> Merger<MemoryRecorder> {
        let mut merger = Merger::new(
            MergeRequest::new(image, root).with_options(options),
            MergeEnv::default(),
            MemoryRecorder::new(),
        );
        merger.real_image = fs::canonicalize(image).unwrap();
        merger.real_root = fs::canonicalize(root).unwrap();
        merger
    }

    #[test]
    fn unlink_strips_setid_before_removing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("su");
        fs::write(&path, "x").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o4755)).unwrap();
        let merger = merger_in(dir.path(), dir.path(), MergeOptions::default());
        merger.unlink(&path, EntryKind::RegularFile).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn unlink_of_missing_entry_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let merger = merger_in(dir.path(), dir.path(), MergeOptions::default());
        merger
            .unlink(&dir.path().join("gone"), EntryKind::Symlink)
            .unwrap();
    }

    #[test]
    fn rewritten_target_is_component_wise() {
        let image = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let real_image = fs::canonicalize(image.path()).unwrap();

        let inside = image.path().join("inside");
        std::os::unix::fs::symlink(real_image.join("usr/lib/libfoo.so.1"), &inside).unwrap();
        let sibling = image.path().join("sibling");
        let mut lookalike = real_image.clone().into_os_string();
        lookalike.push("-other/file");
        std::os::unix::fs::symlink(&lookalike, &sibling).unwrap();
        let relative = image.path().join("relative");
        std::os::unix::fs::symlink("libfoo.so.1", &relative).unwrap();

        let merger = merger_in(image.path(), root.path(), MergeOptions::default());
        assert_eq!(
            merger.rewritten_target(&inside).unwrap(),
            Some(PathBuf::from("/usr/lib/libfoo.so.1"))
        );
        assert_eq!(merger.rewritten_target(&sibling).unwrap(), None);
        assert_eq!(merger.rewritten_target(&relative).unwrap(), None);
    }

    #[test]
    fn copy_path_preserves_mode_and_content() {
        let image = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let src = image.path().join("tool");
        fs::write(&src, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&src, Permissions::from_mode(0o750)).unwrap();

        let options = MergeOptions {
            preserve_image: true,
            no_chown: true,
            ..MergeOptions::default()
        };
        let mut merger = merger_in(image.path(), root.path(), options);
        let status = merger
            .install_file(&src, root.path(), OsStr::new("tool"))
            .unwrap();

        assert!(status.contains(MergeStatus::COPIED));
        assert!(src.exists(), "image entry must survive");
        let dst = root.path().join("tool");
        assert_eq!(fs::read_to_string(&dst).unwrap(), "#!/bin/sh\n");
        assert_eq!(fs::metadata(&dst).unwrap().mode() & PERMISSION_BITS, 0o750);
        assert_eq!(merger.dedup_index().len(), 1);
    }

    #[test]
    fn rename_path_moves_and_indexes() {
        let image = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir_in(image.path().parent().unwrap()).unwrap();
        let src = image.path().join("data");
        fs::write(&src, "payload").unwrap();

        let options = MergeOptions {
            no_chown: true,
            ..MergeOptions::default()
        };
        let mut merger = merger_in(image.path(), root.path(), options);
        let status = merger
            .install_file(&src, root.path(), OsStr::new("data"))
            .unwrap();

        assert!(status.contains(MergeStatus::RENAMED));
        assert!(!src.exists());
        assert_eq!(fs::read_to_string(root.path().join("data")).unwrap(), "payload");
    }
}
