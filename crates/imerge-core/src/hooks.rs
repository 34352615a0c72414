//! Hook gateway.
//!
//! Every phase boundary and every per-entry operation of the engine is
//! bracketed by named hooks. The engine builds a [`Hook`] (name plus
//! key/value context), hands it to the injected [`HookRunner`], and
//! interprets the aggregated [`HookResult`]:
//!
//! - `merger_check_pre` / `merger_check_post`: non-zero fails the check.
//! - `merger_install_{file,dir,sym}_override`: may answer `skip`.
//! - everything else: non-zero is logged as a warning.

use std::collections::BTreeMap;

/// Answer an override hook may give to bypass one entry.
pub const SKIP: &str = "skip";

/// A named hook invocation with its context fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hook {
    name: String,
    fields: BTreeMap<String, String>,
    allowed_outputs: Vec<String>,
}

impl Hook {
    /// Create a hook with no context.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
            allowed_outputs: Vec::new(),
        }
    }

    /// Add a context field. Later values replace earlier ones.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Capture output from the hook, accepting only the listed answers.
    #[must_use]
    pub fn grab_output(mut self, allowed: &[&str]) -> Self {
        self.allowed_outputs = allowed.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    /// Hook name (`merger_install_file_pre`, ...).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Context fields, sorted by key.
    #[must_use]
    pub const fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Look up one context field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Outputs the runner should pass back; empty means output is ignored.
    #[must_use]
    pub fn allowed_outputs(&self) -> &[String] {
        &self.allowed_outputs
    }

    /// Whether `output` is one of the allowed answers.
    #[must_use]
    pub fn accepts_output(&self, output: &str) -> bool {
        self.allowed_outputs.iter().any(|a| a == output)
    }
}

/// Aggregated outcome of running every handler registered for a hook.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HookResult {
    /// Highest exit status of any handler (0 when none ran).
    pub max_exit_status: i32,
    /// Captured answer, empty unless the hook grabs output.
    pub output: String,
}

impl HookResult {
    /// A successful result with no output.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// A result with the given exit status.
    #[must_use]
    pub fn exit(status: i32) -> Self {
        Self {
            max_exit_status: status,
            output: String::new(),
        }
    }

    /// A successful result carrying an answer.
    #[must_use]
    pub fn answer(output: impl Into<String>) -> Self {
        Self {
            max_exit_status: 0,
            output: output.into(),
        }
    }

    /// Returns `true` for a zero exit status.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.max_exit_status == 0
    }

    /// Returns `true` if the hook exited cleanly and answered `skip`.
    #[must_use]
    pub fn is_skip(&self) -> bool {
        self.succeeded() && self.output == SKIP
    }
}

/// External policy invoked around every engine step.
pub trait HookRunner {
    /// Run every handler registered for `hook`.
    fn run(&self, hook: &Hook) -> HookResult;
}

/// A runner with no handlers: every hook succeeds silently.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl HookRunner for NoHooks {
    fn run(&self, _hook: &Hook) -> HookResult {
        HookResult::ok()
    }
}

impl<F> HookRunner for F
where
    F: Fn(&Hook) -> HookResult,
{
    fn run(&self, hook: &Hook) -> HookResult {
        self(hook)
    }
}

// ---------------------------------------------------------------------------
// PackageIdentity
// ---------------------------------------------------------------------------

/// Identity of the package being merged, exported to hooks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageIdentity {
    /// Category (`app-editors`).
    pub category: String,
    /// Package name (`vim`).
    pub name: String,
    /// Full version, optionally with a `-rN` revision (`9.0.1-r2`).
    pub version: String,
    /// Slot (`0`).
    pub slot: String,
}

impl PackageIdentity {
    /// Create a package identity.
    #[must_use]
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        slot: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            version: version.into(),
            slot: slot.into(),
        }
    }

    /// Version without revision (`9.0.1`).
    #[must_use]
    pub fn version_without_revision(&self) -> &str {
        self.split_revision().0
    }

    /// Revision part (`r2`), `r0` when absent.
    #[must_use]
    pub fn revision(&self) -> &str {
        self.split_revision().1.unwrap_or("r0")
    }

    fn split_revision(&self) -> (&str, Option<&str>) {
        if let Some((pv, rev)) = self.version.rsplit_once("-r")
            && !rev.is_empty()
            && rev.bytes().all(|b| b.is_ascii_digit())
        {
            return (pv, Some(&self.version[pv.len() + 1..]));
        }
        (&self.version, None)
    }

    /// Hook fields describing this package.
    #[must_use]
    pub fn hook_fields(&self) -> Vec<(&'static str, String)> {
        let pv = self.version_without_revision();
        vec![
            ("CATEGORY", self.category.clone()),
            ("PN", self.name.clone()),
            ("PV", pv.to_owned()),
            ("PR", self.revision().to_owned()),
            ("PVR", self.version.clone()),
            ("P", format!("{}-{pv}", self.name)),
            ("PF", format!("{}-{}", self.name, self.version)),
            ("SLOT", self.slot.clone()),
        ]
    }
}
