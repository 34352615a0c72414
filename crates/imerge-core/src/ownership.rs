//! Build-sandbox ownership normalization.
//!
//! Images built under a reduced-privilege uid/gid carry that identity on
//! every file. At install time those ids are remapped to the privileged
//! identity. The mapping is a collaborator so the engine never hardcodes
//! which ids are special.

/// Ownership change to apply; `None` leaves that id untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ownership {
    /// New owner, if it must change.
    pub uid: Option<u32>,
    /// New group, if it must change.
    pub gid: Option<u32>,
}

impl Ownership {
    /// Returns `true` if either id changes.
    #[must_use]
    pub const fn changes(&self) -> bool {
        self.uid.is_some() || self.gid.is_some()
    }

    /// The ids the entry ends up with, given its current ones.
    #[must_use]
    pub fn resolve(&self, uid: u32, gid: u32) -> (u32, u32) {
        (self.uid.unwrap_or(uid), self.gid.unwrap_or(gid))
    }

    /// Strip set-uid / set-gid from `mode` for each id being remapped.
    #[must_use]
    pub const fn strip_setid(&self, mut mode: u32) -> u32 {
        if self.uid.is_some() {
            mode &= !0o4000;
        }
        if self.gid.is_some() {
            mode &= !0o2000;
        }
        mode
    }
}

/// Decides which ids belong to the build sandbox.
pub trait SandboxIdentity {
    /// Ownership change for an entry currently owned by `uid:gid`.
    fn normalize(&self, uid: u32, gid: u32) -> Ownership;
}

/// No sandbox: ownership is never remapped.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSandbox;

impl SandboxIdentity for NoSandbox {
    fn normalize(&self, _uid: u32, _gid: u32) -> Ownership {
        Ownership::default()
    }
}

/// Remaps a reduced build uid and/or gid to a privileged target (root by
/// default).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReducedIds {
    /// Build-time uid, if builds ran under one.
    pub uid: Option<u32>,
    /// Build-time gid, if builds ran under one.
    pub gid: Option<u32>,
    /// Owner to remap to.
    pub target_uid: u32,
    /// Group to remap to.
    pub target_gid: u32,
}

impl ReducedIds {
    /// Remap `uid`/`gid` to `0:0`.
    #[must_use]
    pub const fn new(uid: Option<u32>, gid: Option<u32>) -> Self {
        Self {
            uid,
            gid,
            target_uid: 0,
            target_gid: 0,
        }
    }
}

impl SandboxIdentity for ReducedIds {
    fn normalize(&self, uid: u32, gid: u32) -> Ownership {
        Ownership {
            uid: (self.uid == Some(uid)).then_some(self.target_uid),
            gid: (self.gid == Some(gid)).then_some(self.target_gid),
        }
    }
}
