//! imerge configuration (`config.toml`).
//!
//! Defines the typed configuration for `/etc/imerge/config.toml`: merge
//! options, config protection lists, build-sandbox ids and hook sources.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use imerge_core::{ConfigProtect, MergeEnv, MergeOptions, ReducedIds};

use crate::hook_commands::CommandHooks;

/// Where the binary looks for its configuration when `--config` is absent.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/imerge/config.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level imerge configuration.
///
/// Missing fields use defaults. Missing file → all defaults (no error).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImergeConfig {
    /// Merge behaviour switches.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Config protection.
    #[serde(default)]
    pub protect: ProtectConfig,

    /// Build-sandbox identity to normalize at install time.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Hook sources.
    #[serde(default)]
    pub hooks: HooksConfig,
}

// ---------------------------------------------------------------------------
// MergeConfig
// ---------------------------------------------------------------------------

/// `[merge]`: mirrors [`MergeOptions`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
#[allow(clippy::struct_excessive_bools)]
pub struct MergeConfig {
    /// Empty image directories warn instead of failing the check.
    #[serde(default)]
    pub allow_empty_directories: bool,

    /// Never change ownership.
    #[serde(default)]
    pub no_chown: bool,

    /// Rewrite symlinks pointing into the image.
    #[serde(default)]
    pub rewrite_broken_symlinks: bool,

    /// Leave the image untouched (copy/hardlink only).
    #[serde(default)]
    pub preserve_image: bool,
}

impl MergeConfig {
    /// The engine option set.
    #[must_use]
    pub const fn options(&self) -> MergeOptions {
        MergeOptions {
            allow_empty_directories: self.allow_empty_directories,
            no_chown: self.no_chown,
            rewrite_broken_symlinks: self.rewrite_broken_symlinks,
            preserve_image: self.preserve_image,
        }
    }
}

// ---------------------------------------------------------------------------
// ProtectConfig
// ---------------------------------------------------------------------------

/// `[protect]`: root-relative prefixes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtectConfig {
    /// Protected prefixes (e.g. `"/etc"`).
    #[serde(default)]
    pub paths: Vec<String>,

    /// Prefixes that veto protection (e.g. `"/etc/env.d"`).
    #[serde(default)]
    pub mask: Vec<String>,
}

// ---------------------------------------------------------------------------
// SandboxConfig
// ---------------------------------------------------------------------------

/// `[sandbox]`: the reduced ids builds run under.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    /// Build uid, remapped to `target_uid`.
    pub uid: Option<u32>,

    /// Build gid, remapped to `target_gid`.
    pub gid: Option<u32>,

    /// Owner to remap to (default: `0`).
    #[serde(default)]
    pub target_uid: u32,

    /// Group to remap to (default: `0`).
    #[serde(default)]
    pub target_gid: u32,
}

impl SandboxConfig {
    /// The remapping policy, or `None` when no build ids are configured.
    #[must_use]
    pub const fn identity(&self) -> Option<ReducedIds> {
        if self.uid.is_none() && self.gid.is_none() {
            return None;
        }
        Some(ReducedIds {
            uid: self.uid,
            gid: self.gid,
            target_uid: self.target_uid,
            target_gid: self.target_gid,
        })
    }
}

// ---------------------------------------------------------------------------
// HooksConfig
// ---------------------------------------------------------------------------

/// `[hooks]`: where hook handlers come from.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HooksConfig {
    /// Directories holding `<hook_name>/` subdirectories of executables.
    #[serde(default)]
    pub dirs: Vec<PathBuf>,

    /// Per-handler timeout in seconds (default: 60).
    #[serde(default = "default_hook_timeout")]
    pub timeout_seconds: u32,

    /// Shell commands per hook name, run with `sh -c`.
    #[serde(default)]
    pub commands: BTreeMap<String, Vec<String>>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            timeout_seconds: default_hook_timeout(),
            commands: BTreeMap::new(),
        }
    }
}

const fn default_hook_timeout() -> u32 {
    60
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading an imerge configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl ImergeConfig {
    /// Load configuration from a TOML file.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - Invalid TOML or unknown fields give a [`ConfigError`] carrying the
    ///   path and line.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found) or parse errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML or unknown fields.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })
    }

    /// Fold in `CONFIG_PROTECT`, `CONFIG_PROTECT_MASK` and `IMERGE_NO_CHOWN`
    /// from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Fold in environment overrides from `lookup`.
    ///
    /// The protect lists are appended to, whitespace-separated. Any
    /// non-empty `IMERGE_NO_CHOWN` forces `no_chown`.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(extra) = lookup("CONFIG_PROTECT") {
            self.protect
                .paths
                .extend(extra.split_whitespace().map(str::to_owned));
        }
        if let Some(extra) = lookup("CONFIG_PROTECT_MASK") {
            self.protect
                .mask
                .extend(extra.split_whitespace().map(str::to_owned));
        }
        if lookup("IMERGE_NO_CHOWN").is_some_and(|v| !v.is_empty()) {
            self.merge.no_chown = true;
        }
    }

    /// The config protection lists.
    #[must_use]
    pub fn config_protect(&self) -> ConfigProtect {
        ConfigProtect::new(self.protect.paths.clone(), self.protect.mask.clone())
    }

    /// Collaborators for a merge: command hooks and, when build ids are
    /// configured, sandbox ownership remapping.
    #[must_use]
    pub fn merge_env(&self) -> MergeEnv {
        let env = MergeEnv::default().with_hooks(CommandHooks::new(&self.hooks));
        match self.sandbox.identity() {
            Some(ids) => env.with_sandbox(ids),
            None => env,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
