use std::io::{self, BufWriter, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::Args;
use serde::Serialize;

use imerge::config::{DEFAULT_CONFIG_PATH, ImergeConfig};
use imerge::contents::ContentsRecorder;
use imerge_core::{MemoryRecorder, MergeEnv, MergeRequest, Merger, PackageIdentity};

/// Arguments shared by `check` and `merge`.
#[derive(Args, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub struct MergeArgs {
    /// Staged image directory
    #[arg(long)]
    image: PathBuf,

    /// Root filesystem to install into
    #[arg(long, env = "ROOT", default_value = "/")]
    root: PathBuf,

    /// Subpath of the root the image lands under
    #[arg(
        long,
        default_value = "",
        value_parser = clap::builder::TypedValueParser::map(clap::builder::OsStringValueParser::new(), PathBuf::from)
    )]
    install_under: PathBuf,

    /// Configuration file
    #[arg(long, env = "IMERGE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Let empty image directories through with a warning
    #[arg(long)]
    allow_empty_directories: bool,

    /// Never change ownership
    #[arg(long)]
    no_chown: bool,

    /// Rewrite symlinks that point into the image
    #[arg(long)]
    rewrite_broken_symlinks: bool,

    /// Copy or hardlink instead of moving entries out of the image
    #[arg(long)]
    preserve_image: bool,

    /// Package category, exported to hooks
    #[arg(long, default_value = "")]
    category: String,

    /// Package name, exported to hooks (hooks see no package without it)
    #[arg(long)]
    name: Option<String>,

    /// Package version, exported to hooks
    #[arg(long, default_value = "")]
    pkg_version: String,

    /// Package slot, exported to hooks
    #[arg(long, default_value = "0")]
    slot: String,
}

impl MergeArgs {
    /// The package identity to export to hooks; `None` without `--name`.
    pub fn package(&self) -> Option<PackageIdentity> {
        self.name.as_ref().map(|name| {
            PackageIdentity::new(&self.category, name, &self.pkg_version, &self.slot)
        })
    }

    /// Load the config, fold in environment and flags, and build the
    /// request with its collaborators.
    fn prepare(&self) -> Result<(MergeRequest, MergeEnv)> {
        let mut config = ImergeConfig::load(&self.config)?;
        config.apply_env();

        let merge = &mut config.merge;
        merge.allow_empty_directories |= self.allow_empty_directories;
        merge.no_chown |= self.no_chown;
        merge.rewrite_broken_symlinks |= self.rewrite_broken_symlinks;
        merge.preserve_image |= self.preserve_image;

        let mut request = MergeRequest::new(&self.image, &self.root)
            .with_install_under(&self.install_under)
            .with_options(config.merge.options())
            .with_protect(config.config_protect());
        if let Some(package) = self.package() {
            request = request.with_package(package);
        }
        tracing::debug!(
            image = %self.image.display(),
            root = %self.root.display(),
            config = %self.config.display(),
            "merge request prepared"
        );
        Ok((request, config.merge_env()))
    }
}

#[derive(Serialize)]
struct CheckReport {
    ok: bool,
    image: PathBuf,
    root: PathBuf,
    problems: Vec<String>,
    dirs_checked: usize,
}

/// Run the check phase. Returns whether the image can be merged.
pub fn check(args: &MergeArgs, json: bool) -> Result<bool> {
    let (request, env) = args.prepare()?;
    let image = request.image.clone();
    let root = request.root.clone();

    if json {
        let mut merger = Merger::new(request, env, MemoryRecorder::new());
        let ok = merger.check()?;
        let recorder = merger.into_recorder();
        let report = CheckReport {
            ok,
            image,
            root,
            problems: recorder.problems,
            dirs_checked: recorder.dirs_checked,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ok);
    }

    let mut merger = Merger::new(request, env, ContentsRecorder::new(io::sink()));
    Ok(merger.check()?)
}

/// Run check (unless skipped) and merge, then persist the contents file.
pub fn merge(args: &MergeArgs, contents: Option<&Path>, skip_check: bool) -> Result<()> {
    let (request, env) = args.prepare()?;

    let Some(contents) = contents else {
        let mut merger = Merger::new(request, env, ContentsRecorder::new(io::sink()));
        return run_merge(&mut merger, skip_check);
    };

    // Written beside the target and renamed into place once the merge is done.
    let dir = contents
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix(".imerge-contents.")
        .tempfile_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;

    let mut merger = Merger::new(request, env, ContentsRecorder::new(BufWriter::new(tmp)));
    run_merge(&mut merger, skip_check)?;

    let recorder = merger.into_recorder();
    let entries = recorder.entries();
    let writer = recorder
        .finish()
        .with_context(|| format!("failed to write {}", contents.display()))?;
    let mut tmp = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("failed to write {}", contents.display()))?;
    tmp.flush()?;
    tmp.persist(contents)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to persist {}", contents.display()))?;
    tracing::info!(path = %contents.display(), entries, "contents written");
    Ok(())
}

fn run_merge<W: io::Write>(merger: &mut Merger<ContentsRecorder<W>>, skip_check: bool) -> Result<()> {
    if !skip_check && !merger.check()? {
        bail!(
            "refusing to merge {}: check failed with {} problem(s)",
            merger.request().image.display(),
            merger.problems().len()
        );
    }
    merger.merge()?;
    Ok(())
}
