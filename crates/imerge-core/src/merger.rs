//! The merge engine.
//!
//! A [`Merger`] is bound to one image, one destination root and one set of
//! collaborators. [`Merger::check`] walks the image read-only and collects
//! every problem; [`Merger::merge`] performs the same walk against the same
//! decision table with side effects, aborting on the first fatal condition.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::instrument;

use crate::dedup::DedupIndex;
use crate::digest::file_sha256;
use crate::dispatch::{Action, action_for};
use crate::entry::{EntryKind, classify, classify_resolved};
use crate::error::{MergeError, Result};
use crate::flags::MergeStatus;
use crate::hooks::{Hook, HookRunner, NoHooks, PackageIdentity, SKIP};
use crate::label::{NoLabels, SecurityLabeler};
use crate::ownership::{NoSandbox, Ownership, SandboxIdentity};
use crate::protect::{ConfigProtect, protected_name};
use crate::record::{RecordKind, RecordedEntry, Recorder};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Behaviour switches for one merge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct MergeOptions {
    /// Empty image directories warn instead of failing the check.
    pub allow_empty_directories: bool,
    /// Never change ownership of anything.
    pub no_chown: bool,
    /// Rewrite symlinks that point into the image instead of failing.
    pub rewrite_broken_symlinks: bool,
    /// Never move entries out of the image: files are hardlinked or copied,
    /// directories are created fresh.
    pub preserve_image: bool,
}

/// Immutable description of one install.
#[derive(Clone, Debug)]
pub struct MergeRequest {
    /// The staged tree to install.
    pub image: PathBuf,
    /// The live filesystem root to install into.
    pub root: PathBuf,
    /// Subpath of `root` the image lands under; created before the walk.
    pub install_under: PathBuf,
    /// Behaviour switches.
    pub options: MergeOptions,
    /// Config protection lists.
    pub protect: ConfigProtect,
    /// Package being installed, exported to hooks when present.
    pub package: Option<PackageIdentity>,
}

impl MergeRequest {
    /// Install `image` directly into `root` with default options.
    #[must_use]
    pub fn new(image: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            root: root.into(),
            install_under: PathBuf::new(),
            options: MergeOptions::default(),
            protect: ConfigProtect::default(),
            package: None,
        }
    }

    /// Install under a subpath of the root.
    #[must_use]
    pub fn with_install_under(mut self, install_under: impl Into<PathBuf>) -> Self {
        self.install_under = install_under.into();
        self
    }

    /// Replace the option set.
    #[must_use]
    pub const fn with_options(mut self, options: MergeOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the config protection lists.
    #[must_use]
    pub fn with_protect(mut self, protect: ConfigProtect) -> Self {
        self.protect = protect;
        self
    }

    /// Attach a package identity.
    #[must_use]
    pub fn with_package(mut self, package: PackageIdentity) -> Self {
        self.package = Some(package);
        self
    }
}

/// The collaborators a merge talks to.
pub struct MergeEnv {
    /// Hook gateway.
    pub hooks: Box<dyn HookRunner>,
    /// Security labeling.
    pub labeler: Box<dyn SecurityLabeler>,
    /// Build-sandbox ownership policy.
    pub sandbox: Box<dyn SandboxIdentity>,
}

impl Default for MergeEnv {
    fn default() -> Self {
        Self {
            hooks: Box::new(NoHooks),
            labeler: Box::new(NoLabels),
            sandbox: Box::new(NoSandbox),
        }
    }
}

impl MergeEnv {
    /// Use `hooks` as the hook gateway.
    #[must_use]
    pub fn with_hooks(mut self, hooks: impl HookRunner + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Use `labeler` for security labels.
    #[must_use]
    pub fn with_labeler(mut self, labeler: impl SecurityLabeler + 'static) -> Self {
        self.labeler = Box::new(labeler);
        self
    }

    /// Use `sandbox` to decide which ids to remap.
    #[must_use]
    pub fn with_sandbox(mut self, sandbox: impl SandboxIdentity + 'static) -> Self {
        self.sandbox = Box::new(sandbox);
        self
    }
}

// ---------------------------------------------------------------------------
// Merger
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Check,
    Merge,
}

/// What the walk does after one entry has been dispatched.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Visit {
    /// Not a directory, or nothing further to do.
    Leaf,
    /// Walk the image directory's children into this destination.
    Descend(PathBuf),
    /// The directory was moved wholesale and its subtree already recorded.
    Relocated,
    /// An override hook bypassed the entry.
    Skipped,
    /// A conflict was reported; do not descend.
    Refused,
}

/// The merge engine for one image.
pub struct Merger<R> {
    pub(crate) request: MergeRequest,
    pub(crate) env: MergeEnv,
    pub(crate) recorder: R,
    pub(crate) dedup: DedupIndex,
    pub(crate) phase: Phase,
    pub(crate) real_image: PathBuf,
    pub(crate) real_root: PathBuf,
    check_ok: bool,
    problems: Vec<String>,
    warnings: Vec<String>,
}

impl<R: Recorder> Merger<R> {
    /// Bind an engine to a request, its collaborators and a recorder.
    pub fn new(request: MergeRequest, env: MergeEnv, recorder: R) -> Self {
        let real_image = request.image.clone();
        let real_root = request.root.clone();
        Self {
            request,
            env,
            recorder,
            dedup: DedupIndex::new(),
            phase: Phase::Check,
            real_image,
            real_root,
            check_ok: true,
            problems: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// The request this engine was built for.
    pub const fn request(&self) -> &MergeRequest {
        &self.request
    }

    /// The recorder.
    pub const fn recorder(&self) -> &R {
        &self.recorder
    }

    /// Consume the engine, returning the recorder.
    pub fn into_recorder(self) -> R {
        self.recorder
    }

    /// Problems found by the last check pass.
    pub fn problems(&self) -> &[String] {
        &self.problems
    }

    /// Non-fatal oddities seen by the last pass.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// The hardlink dedup index built so far.
    pub const fn dedup_index(&self) -> &DedupIndex {
        &self.dedup
    }

    /// Run the read-only check pass.
    ///
    /// Returns `Ok(false)` when any problem was found; [`Self::problems`]
    /// lists them all.
    ///
    /// # Errors
    /// Filesystem failures while inspecting the trees are fatal even here.
    #[instrument(skip_all, fields(image = %self.request.image.display(), root = %self.request.root.display()))]
    pub fn check(&mut self) -> Result<bool> {
        self.phase = Phase::Check;
        self.check_ok = true;
        self.problems.clear();
        self.warnings.clear();
        self.resolve_roots()?;
        self.recorder.check_started(&self.request.root);

        if !self.run_hook(&self.boundary_hook("merger_check_pre")) {
            self.fail_check("merger_check_pre hooks returned non-zero".to_owned());
        }

        if let Some(message) = self.install_under_escape() {
            self.on_error(message)?;
        } else {
            let image = self.real_image.clone();
            let dst = self.install_under_dest();
            self.walk(&image, &dst, true)?;
        }

        if !self.run_hook(&self.boundary_hook("merger_check_post")) {
            self.fail_check("merger_check_post hooks returned non-zero".to_owned());
        }

        self.recorder.check_finished(self.check_ok);
        tracing::info!(ok = self.check_ok, problems = self.problems.len(), "check finished");
        Ok(self.check_ok)
    }

    /// Run the mutating merge pass.
    ///
    /// # Errors
    /// The first conflict or filesystem failure aborts the walk, leaving the
    /// root partially merged.
    #[instrument(skip_all, fields(image = %self.request.image.display(), root = %self.request.root.display()))]
    pub fn merge(&mut self) -> Result<()> {
        self.phase = Phase::Merge;
        self.warnings.clear();
        self.resolve_roots()?;
        self.recorder.merge_started(&self.request.root);

        let pre = self.boundary_hook("merger_install_pre");
        if !self.run_hook(&pre) {
            tracing::warn!("merge pre hooks returned non-zero");
        }

        let dst = self.prepare_install_under()?;
        let image = self.real_image.clone();
        self.walk(&image, &dst, true)?;

        let post = self.boundary_hook("merger_install_post");
        if !self.run_hook(&post) {
            tracing::warn!("merge post hooks returned non-zero");
        }
        tracing::info!(identities = self.dedup.len(), "merge finished");
        Ok(())
    }

    fn resolve_roots(&mut self) -> Result<()> {
        self.real_image = fs::canonicalize(&self.request.image)
            .map_err(MergeError::io("realpath", &self.request.image))?;
        self.real_root = fs::canonicalize(&self.request.root)
            .map_err(MergeError::io("realpath", &self.request.root))?;
        Ok(())
    }

    /// Create every missing component of `root/install_under`, recording
    /// each one, and return the resolved directory.
    fn prepare_install_under(&mut self) -> Result<PathBuf> {
        if let Some(message) = self.install_under_escape() {
            return Err(MergeError::Conflict { message });
        }
        let mut dir = self.real_root.clone();
        let install_under = self.request.install_under.clone();
        for component in install_under.components() {
            let Component::Normal(name) = component else {
                continue;
            };
            dir.push(name);
            if classify(&dir)? == EntryKind::Absent {
                fs::create_dir(&dir).map_err(MergeError::io("mkdir", &dir))?;
                self.record_dir(&dir, MergeStatus::empty())?;
            } else {
                self.record_dir(&dir, MergeStatus::USED_EXISTING)?;
            }
        }
        fs::canonicalize(&dir).map_err(MergeError::io("realpath", &dir))
    }

    /// `root/install_under`, treating a leading `/` as root-relative.
    fn install_under_dest(&self) -> PathBuf {
        let mut dir = self.real_root.clone();
        dir.extend(self.request.install_under.components().filter_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        }));
        dir
    }

    /// The problem with `install_under`, if it would leave the root.
    fn install_under_escape(&self) -> Option<String> {
        let install_under = &self.request.install_under;
        install_under
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
            .then(|| {
                format!(
                    "install-under path '{}' must stay inside the root",
                    install_under.display()
                )
            })
    }

    // -----------------------------------------------------------------------
    // Walk
    // -----------------------------------------------------------------------

    fn walk(&mut self, src: &Path, dst: &Path, top: bool) -> Result<()> {
        if classify(src)? != EntryKind::Directory {
            return Err(MergeError::NotADirectory {
                role: "source",
                path: src.to_owned(),
            });
        }
        if self.phase == Phase::Merge && !dst.is_dir() {
            return Err(MergeError::NotADirectory {
                role: "destination",
                path: dst.to_owned(),
            });
        }
        if self.phase == Phase::Check {
            self.recorder.check_progress();
        }

        let entries = sorted_entries(src)?;
        if self.phase == Phase::Check && entries.is_empty() && !top {
            if self.request.options.allow_empty_directories {
                tracing::warn!(path = %dst.display(), "installing empty directory");
            } else {
                self.on_error(format!(
                    "Attempted to install empty directory '{}'",
                    dst.display()
                ))?;
            }
        }

        for entry in entries {
            if let Visit::Descend(next) = self.visit(&entry, dst)? {
                self.walk(&entry, &next, false)?;
            }
        }
        Ok(())
    }

    fn visit(&mut self, src: &Path, dst_dir: &Path) -> Result<Visit> {
        let Some(name) = src.file_name() else {
            return Ok(Visit::Leaf);
        };
        let dst = dst_dir.join(name);
        let src_kind = classify(src)?;
        let dst_kind = classify(&dst)?;
        let action = action_for(src_kind, dst_kind);
        tracing::debug!(
            src = %src.display(),
            dst = %dst.display(),
            %src_kind,
            %dst_kind,
            %action,
            "dispatch"
        );

        let noun = hook_noun(src_kind);
        if let Some(noun) = noun {
            match self.phase {
                Phase::Check => {
                    let hook = self.entry_hook(&format!("merger_check_{noun}_pre"), src, &dst);
                    if !self.run_hook(&hook) {
                        tracing::warn!(hook = hook.name(), path = %dst.display(), "check hooks returned non-zero");
                    }
                }
                Phase::Merge => {
                    if self.override_skips(noun, src, &dst) {
                        let line = format!("--- [skp] {}", self.tidy(&dst).display());
                        self.recorder.status_line(&line);
                        return Ok(Visit::Skipped);
                    }
                }
            }
        }

        if self.phase == Phase::Check
            && src_kind == EntryKind::Symlink
            && !self.request.options.rewrite_broken_symlinks
            && self.rewritten_target(src)?.is_some()
        {
            let target = fs::read_link(src).map_err(MergeError::io("readlink", src))?;
            self.on_error(format!(
                "Symlink to image detected at: {} ({})",
                src.display(),
                target.display()
            ))?;
        }

        let visit = self.apply(action, src, dst_dir, name, src_kind, dst_kind)?;

        if self.phase == Phase::Check
            && let Some(noun) = noun
        {
            let hook = self.entry_hook(&format!("merger_check_{noun}_post"), src, &dst);
            if !self.run_hook(&hook) {
                tracing::warn!(hook = hook.name(), path = %dst.display(), "check hooks returned non-zero");
            }
        }
        Ok(visit)
    }

    fn apply(
        &mut self,
        action: Action,
        src: &Path,
        dst_dir: &Path,
        name: &OsStr,
        src_kind: EntryKind,
        dst_kind: EntryKind,
    ) -> Result<Visit> {
        let dst = dst_dir.join(name);
        match action {
            Action::Install => self.install(src, dst_dir, name, src_kind, MergeStatus::empty()),
            Action::Replace => {
                if self.phase == Phase::Merge {
                    self.unlink(&dst, dst_kind)?;
                }
                self.install(src, dst_dir, name, src_kind, MergeStatus::UNLINKED_FIRST)
            }
            Action::ProtectOrReplace => {
                if self.phase == Phase::Check {
                    return Ok(Visit::Leaf);
                }
                let tidy = self.tidy(&dst);
                if self.request.protect.is_protected(&tidy.to_string_lossy()) {
                    let installed = protected_name(src, dst_dir, name)?;
                    tracing::debug!(path = %tidy.display(), installed = %installed.to_string_lossy(), "config protected");
                    let status = self.install_file(src, dst_dir, &installed)?;
                    self.record_file(dst_dir, name, &installed, status)?;
                } else {
                    self.unlink(&dst, dst_kind)?;
                    let status = self.install_file(src, dst_dir, name)? | MergeStatus::UNLINKED_FIRST;
                    self.record_file(dst_dir, name, name, status)?;
                }
                Ok(Visit::Leaf)
            }
            Action::MergeInPlace => self.reuse_dir(&dst),
            Action::MergeThroughSymlink => {
                if classify_resolved(&dst) == EntryKind::Directory {
                    self.on_warn(format!(
                        "Expected '{}' to be a directory but found a symlink to a directory",
                        dst.display()
                    ));
                    self.reuse_dir(&dst)
                } else {
                    self.on_error(format!(
                        "Expected '{}' to be a directory but found a symlink to a non-directory",
                        dst.display()
                    ))?;
                    Ok(Visit::Refused)
                }
            }
            Action::Conflict(kind) => {
                self.on_error(kind.message(src, &dst))?;
                Ok(Visit::Refused)
            }
            Action::Unrecognised => {
                self.on_error(format!(
                    "Cannot write '{}' to '{}' because it is not a recognised file type",
                    src.display(),
                    dst_dir.display()
                ))?;
                Ok(Visit::Refused)
            }
            Action::SourceVanished => Err(MergeError::SourceVanished {
                path: src.to_owned(),
            }),
        }
    }

    fn install(
        &mut self,
        src: &Path,
        dst_dir: &Path,
        name: &OsStr,
        src_kind: EntryKind,
        extra: MergeStatus,
    ) -> Result<Visit> {
        let dst = dst_dir.join(name);
        if self.phase == Phase::Check {
            return Ok(if src_kind == EntryKind::Directory {
                Visit::Descend(dst)
            } else {
                Visit::Leaf
            });
        }
        match src_kind {
            EntryKind::RegularFile => {
                let status = self.install_file(src, dst_dir, name)? | extra;
                self.record_file(dst_dir, name, name, status)?;
                Ok(Visit::Leaf)
            }
            EntryKind::Symlink => {
                let status = self.install_sym(src, dst_dir)? | extra;
                self.record_sym(&dst, status)?;
                Ok(Visit::Leaf)
            }
            EntryKind::Directory => {
                let installed = self.install_dir(src, dst_dir)?;
                self.record_dir(&dst, installed.status | extra)?;
                if installed.relocated {
                    self.record_relocated(&dst)?;
                    Ok(Visit::Relocated)
                } else {
                    let real = fs::canonicalize(&dst).map_err(MergeError::io("realpath", &dst))?;
                    Ok(Visit::Descend(real))
                }
            }
            EntryKind::Absent | EntryKind::Other => Ok(Visit::Leaf),
        }
    }

    fn reuse_dir(&mut self, dst: &Path) -> Result<Visit> {
        if self.phase == Phase::Check {
            return Ok(Visit::Descend(dst.to_owned()));
        }
        self.record_dir(dst, MergeStatus::USED_EXISTING)?;
        let real = fs::canonicalize(dst).map_err(MergeError::io("realpath", dst))?;
        Ok(Visit::Descend(real))
    }

    /// Fatal in merge; recorded and survived in check.
    fn on_error(&mut self, message: String) -> Result<()> {
        match self.phase {
            Phase::Check => {
                self.fail_check(message);
                Ok(())
            }
            Phase::Merge => Err(MergeError::Conflict { message }),
        }
    }

    /// Logged and kept in either phase; never fatal.
    fn on_warn(&mut self, message: String) {
        match self.phase {
            Phase::Check => tracing::warn!(phase = "check", "{message}"),
            Phase::Merge => tracing::warn!(phase = "merge", "{message}"),
        }
        self.warnings.push(message);
    }

    fn fail_check(&mut self, message: String) {
        self.check_ok = false;
        self.recorder.check_problem(&message);
        self.problems.push(message);
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    /// A hook carrying the fields every merger hook exports.
    pub(crate) fn hook(&self, name: &str) -> Hook {
        let mut hook = Hook::new(name)
            .with("ROOT", self.request.root.display().to_string())
            .with("IMAGE", self.request.image.display().to_string())
            .with("CONFIG_PROTECT", self.request.protect.protect_string())
            .with("CONFIG_PROTECT_MASK", self.request.protect.mask_string());
        if let Some(package) = &self.request.package {
            for (key, value) in package.hook_fields() {
                hook = hook.with(key, value);
            }
        }
        hook
    }

    fn boundary_hook(&self, name: &str) -> Hook {
        self.hook(name)
            .with("INSTALL_SOURCE", self.request.image.display().to_string())
            .with("INSTALL_DESTINATION", self.request.root.display().to_string())
    }

    pub(crate) fn entry_hook(&self, name: &str, src: &Path, dst: &Path) -> Hook {
        self.hook(name)
            .with("INSTALL_SOURCE", src.display().to_string())
            .with("INSTALL_DESTINATION", dst.display().to_string())
    }

    /// Run `hook`; `true` when every handler exited zero.
    pub(crate) fn run_hook(&self, hook: &Hook) -> bool {
        let result = self.env.hooks.run(hook);
        if !result.succeeded() {
            tracing::debug!(hook = hook.name(), status = result.max_exit_status, "hook returned non-zero");
        }
        result.succeeded()
    }

    /// Run `hook`, logging a warning on failure.
    pub(crate) fn warn_hook(&self, hook: &Hook) {
        if !self.run_hook(hook) {
            tracing::warn!(hook = hook.name(), "hooks returned non-zero");
        }
    }

    fn override_skips(&self, noun: &str, src: &Path, dst: &Path) -> bool {
        let hook = self
            .entry_hook(&format!("merger_install_{noun}_override"), src, dst)
            .grab_output(&[SKIP]);
        let result = self.env.hooks.run(&hook);
        if !result.succeeded() {
            tracing::warn!(
                hook = hook.name(),
                src = %src.display(),
                "override hooks returned non-zero"
            );
            return false;
        }
        result.is_skip() && hook.accepts_output(&result.output)
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// `path` relative to the destination root, with a leading `/`.
    pub(crate) fn tidy(&self, path: &Path) -> PathBuf {
        Path::new("/").join(path.strip_prefix(&self.real_root).unwrap_or(path))
    }

    pub(crate) fn ownership_for(&self, uid: u32, gid: u32) -> Ownership {
        if self.request.options.no_chown {
            Ownership::default()
        } else {
            self.env.sandbox.normalize(uid, gid)
        }
    }

    fn record(&mut self, entry: &RecordedEntry) -> Result<()> {
        self.recorder
            .record(entry)
            .map_err(|message| MergeError::Record {
                path: entry.path.clone(),
                message,
            })?;
        self.recorder.status_line(&entry.progress_line());
        Ok(())
    }

    pub(crate) fn record_dir(&mut self, dst: &Path, status: MergeStatus) -> Result<()> {
        let entry = RecordedEntry {
            path: self.tidy(dst),
            status,
            kind: RecordKind::Dir,
        };
        self.record(&entry)
    }

    pub(crate) fn record_file(
        &mut self,
        dst_dir: &Path,
        name: &OsStr,
        installed: &OsStr,
        status: MergeStatus,
    ) -> Result<()> {
        use std::os::unix::fs::MetadataExt as _;

        let installed_path = dst_dir.join(installed);
        let meta = fs::symlink_metadata(&installed_path)
            .map_err(MergeError::io("lstat", &installed_path))?;
        let content_hash =
            file_sha256(&installed_path).map_err(MergeError::io("read", &installed_path))?;
        let entry = RecordedEntry {
            path: self.tidy(&dst_dir.join(name)),
            status,
            kind: RecordKind::File {
                installed_as: (installed != name).then(|| installed.to_owned()),
                content_hash,
                mtime: meta.mtime(),
            },
        };
        self.record(&entry)
    }

    pub(crate) fn record_sym(&mut self, dst: &Path, status: MergeStatus) -> Result<()> {
        use std::os::unix::fs::MetadataExt as _;

        let meta = fs::symlink_metadata(dst).map_err(MergeError::io("lstat", dst))?;
        let target = fs::read_link(dst).map_err(MergeError::io("readlink", dst))?;
        let entry = RecordedEntry {
            path: self.tidy(dst),
            status,
            kind: RecordKind::Symlink {
                target,
                mtime: meta.mtime(),
            },
        };
        self.record(&entry)
    }
}

const fn hook_noun(kind: EntryKind) -> Option<&'static str> {
    match kind {
        EntryKind::RegularFile => Some("file"),
        EntryKind::Directory => Some("dir"),
        EntryKind::Symlink => Some("sym"),
        EntryKind::Absent | EntryKind::Other => None,
    }
}

/// Entries of `dir` (dotfiles included), sorted by file name.
pub(crate) fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .map_err(MergeError::io("opendir", dir))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()
        .map_err(MergeError::io("readdir", dir))?;
    entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(entries)
}
