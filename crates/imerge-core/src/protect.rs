//! Config protection.
//!
//! A destination file under a protected prefix (and under no mask prefix) is
//! never overwritten in place. The incoming version is installed next to it
//! as `._cfgNNNN_<name>`, reusing an existing candidate whose content hash
//! matches so that repeated installs of the same file do not pile up copies.

use std::ffi::{OsStr, OsString};
use std::path::Path;

use crate::digest::file_sha256;
use crate::error::{MergeError, Result};

/// Highest four-digit suffix tried before giving up.
const MAX_CANDIDATES: u32 = 10_000;

/// Protect and mask prefix lists, matched against root-relative paths
/// (`/etc/foo.conf`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigProtect {
    protect: Vec<String>,
    mask: Vec<String>,
}

impl ConfigProtect {
    /// Build from explicit lists.
    #[must_use]
    pub const fn new(protect: Vec<String>, mask: Vec<String>) -> Self {
        Self { protect, mask }
    }

    /// Build from whitespace-separated strings, as found in
    /// `CONFIG_PROTECT` / `CONFIG_PROTECT_MASK`.
    #[must_use]
    pub fn from_env_strings(protect: &str, mask: &str) -> Self {
        let split = |s: &str| s.split_whitespace().map(str::to_owned).collect();
        Self {
            protect: split(protect),
            mask: split(mask),
        }
    }

    /// Protected prefixes.
    #[must_use]
    pub fn protect(&self) -> &[String] {
        &self.protect
    }

    /// Mask prefixes.
    #[must_use]
    pub fn mask(&self) -> &[String] {
        &self.mask
    }

    /// Space-joined protect list, as exported to hooks.
    #[must_use]
    pub fn protect_string(&self) -> String {
        self.protect.join(" ")
    }

    /// Space-joined mask list, as exported to hooks.
    #[must_use]
    pub fn mask_string(&self) -> String {
        self.mask.join(" ")
    }

    /// Whether the root-relative path `tidy` must not be overwritten.
    #[must_use]
    pub fn is_protected(&self, tidy: &str) -> bool {
        self.protect.iter().any(|p| under_prefix(tidy, p))
            && !self.mask.iter().any(|m| under_prefix(tidy, m))
    }
}

fn under_prefix(tidy: &str, prefix: &str) -> bool {
    let trimmed = prefix.trim_end_matches('/');
    if tidy == prefix || tidy == trimmed {
        return true;
    }
    tidy.strip_prefix(trimmed)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// The `._cfgNNNN_` name for suffix `n`.
#[must_use]
pub fn cfg_name(n: u32, basename: &OsStr) -> OsString {
    let mut name = OsString::from(format!("._cfg{n:04}_"));
    name.push(basename);
    name
}

/// Choose the name under which `src` should be installed into `dst_dir`
/// when `dst_dir/<basename>` is protected.
///
/// Tries `basename`, then `._cfg0000_<basename>`, `._cfg0001_<basename>`, ...
/// and returns the first candidate that does not exist, or whose content
/// already matches `src`.
///
/// # Errors
/// Fails if `src` cannot be hashed, or if every four-digit suffix is taken.
pub fn protected_name(src: &Path, dst_dir: &Path, basename: &OsStr) -> Result<OsString> {
    let ours = file_sha256(src).map_err(MergeError::io("read", src))?;

    let mut candidate = basename.to_owned();
    let mut n = 0;
    loop {
        let path = dst_dir.join(&candidate);
        if std::fs::symlink_metadata(&path).is_err() {
            return Ok(candidate);
        }
        let is_file = std::fs::metadata(&path).is_ok_and(|m| m.is_file());
        if is_file && file_sha256(&path).is_ok_and(|theirs| theirs == ours) {
            return Ok(candidate);
        }
        if n >= MAX_CANDIDATES {
            return Err(MergeError::Conflict {
                message: format!(
                    "no free config protection name left for '{}'",
                    dst_dir.join(basename).display()
                ),
            });
        }
        candidate = cfg_name(n, basename);
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn etc() -> ConfigProtect {
        ConfigProtect::new(
            vec!["/etc".to_owned(), "/usr/share/config/".to_owned()],
            vec!["/etc/env.d".to_owned()],
        )
    }

    #[test]
    fn protect_prefix_matches_whole_components() {
        let cp = etc();
        assert!(cp.is_protected("/etc/foo.conf"));
        assert!(cp.is_protected("/etc"));
        assert!(cp.is_protected("/usr/share/config/kdeglobals"));
        assert!(!cp.is_protected("/etcetera/foo"));
        assert!(!cp.is_protected("/usr/bin/foo"));
    }

    #[test]
    fn mask_vetoes_protection() {
        let cp = etc();
        assert!(!cp.is_protected("/etc/env.d/00basic"));
        assert!(!cp.is_protected("/etc/env.d"));
        assert!(cp.is_protected("/etc/env.dx"));
    }

    #[test]
    fn mask_without_protect_is_unprotected() {
        let cp = ConfigProtect::new(vec![], vec!["/etc".to_owned()]);
        assert!(!cp.is_protected("/etc/foo"));
    }

    #[test]
    fn env_strings_split_on_whitespace() {
        let cp = ConfigProtect::from_env_strings(" /etc  /var/lib/foo\n", "/etc/env.d");
        assert_eq!(cp.protect(), ["/etc", "/var/lib/foo"]);
        assert_eq!(cp.mask(), ["/etc/env.d"]);
        assert_eq!(cp.protect_string(), "/etc /var/lib/foo");
    }

    #[test]
    fn cfg_name_is_zero_padded() {
        assert_eq!(cfg_name(0, OsStr::new("foo.conf")), "._cfg0000_foo.conf");
        assert_eq!(cfg_name(42, OsStr::new("x")), "._cfg0042_x");
    }

    #[test]
    fn differing_content_gets_first_cfg_name() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.conf");
        let dst = dir.path().join("dst");
        std::fs::create_dir(&dst).unwrap();
        std::fs::write(&src, "new").unwrap();
        std::fs::write(dst.join("foo.conf"), "old").unwrap();

        let name = protected_name(&src, &dst, OsStr::new("foo.conf")).unwrap();
        assert_eq!(name, "._cfg0000_foo.conf");
    }

    #[test]
    fn identical_content_reuses_existing_name() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.conf");
        let dst = dir.path().join("dst");
        std::fs::create_dir(&dst).unwrap();
        std::fs::write(&src, "same").unwrap();
        std::fs::write(dst.join("foo.conf"), "same").unwrap();

        let name = protected_name(&src, &dst, OsStr::new("foo.conf")).unwrap();
        assert_eq!(name, "foo.conf");
    }

    #[test]
    fn skips_taken_names_and_reuses_matching_one() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.conf");
        let dst = dir.path().join("dst");
        std::fs::create_dir(&dst).unwrap();
        std::fs::write(&src, "v3").unwrap();
        std::fs::write(dst.join("foo.conf"), "v1").unwrap();
        std::fs::write(dst.join("._cfg0000_foo.conf"), "v2").unwrap();

        let name = protected_name(&src, &dst, OsStr::new("foo.conf")).unwrap();
        assert_eq!(name, "._cfg0001_foo.conf");

        std::fs::write(dst.join("._cfg0001_foo.conf"), "v3").unwrap();
        let again = protected_name(&src, &dst, OsStr::new("foo.conf")).unwrap();
        assert_eq!(again, "._cfg0001_foo.conf");
    }
}
