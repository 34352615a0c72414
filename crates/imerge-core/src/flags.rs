//! How an entry was installed.
//!
//! [`MergeStatus`] is a small bitset attached to every recorder notification.
//! [`MergeStatus::arrows`] renders it as the three-column marker that prefixes
//! each progress line (`>>>`, `<-*`, `=>>`, ...).

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bitset describing how one entry was installed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MergeStatus(u16);

impl MergeStatus {
    /// An existing destination entry was unlinked first.
    pub const UNLINKED_FIRST: Self = Self(1 << 0);
    /// A pre-existing directory was reused.
    pub const USED_EXISTING: Self = Self(1 << 1);
    /// Moved into place with `rename(2)`.
    pub const RENAMED: Self = Self(1 << 2);
    /// Copied byte-for-byte through a temporary file.
    pub const COPIED: Self = Self(1 << 3);
    /// Hardlinked to an already installed entry with the same content.
    pub const AS_HARDLINK: Self = Self(1 << 4);
    /// Installed as part of a directory moved by a single rename.
    pub const PARENT_RENAME: Self = Self(1 << 5);
    /// Build-sandbox ownership was normalized.
    pub const FIXED_OWNERSHIP: Self = Self(1 << 6);
    /// Set-uid, set-gid or sticky bits are present.
    pub const SETID_BITS: Self = Self(1 << 7);
    /// Extended attributes were copied.
    pub const XATTR: Self = Self(1 << 8);

    const NAMED: [(Self, &'static str); 9] = [
        (Self::UNLINKED_FIRST, "unlinked-first"),
        (Self::USED_EXISTING, "used-existing"),
        (Self::RENAMED, "renamed"),
        (Self::COPIED, "copied"),
        (Self::AS_HARDLINK, "as-hardlink"),
        (Self::PARENT_RENAME, "parent-rename"),
        (Self::FIXED_OWNERSHIP, "fixed-ownership"),
        (Self::SETID_BITS, "setid-bits"),
        (Self::XATTR, "xattr"),
    ];

    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns `true` if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Set every flag in `other`.
    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Render the three-column progress marker.
    ///
    /// Column 0 is `<` (unlinked first) or `=` (used existing); column 1 is
    /// `-` (renamed), `&` (hardlink) or `^` (parent rename); column 2 is `~`
    /// (fixed ownership) or `*` (set-id bits). When two flags share a column
    /// the later one in declaration order wins.
    #[must_use]
    pub fn arrows(self) -> String {
        let mut marker = *b">>>";
        for (flag, _) in Self::NAMED {
            if !self.contains(flag) {
                continue;
            }
            match flag {
                Self::UNLINKED_FIRST => marker[0] = b'<',
                Self::USED_EXISTING => marker[0] = b'=',
                Self::RENAMED => marker[1] = b'-',
                Self::AS_HARDLINK => marker[1] = b'&',
                Self::PARENT_RENAME => marker[1] = b'^',
                Self::FIXED_OWNERSHIP => marker[2] = b'~',
                Self::SETID_BITS => marker[2] = b'*',
                _ => {}
            }
        }
        String::from_utf8_lossy(&marker).into_owned()
    }

    /// Names of the set flags, in declaration order.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        Self::NAMED
            .into_iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, name)| name)
    }
}

impl BitOr for MergeStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for MergeStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.names().collect();
        write!(f, "[{}]", names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn plain_install_is_three_arrows() {
        assert_eq!(MergeStatus::empty().arrows(), ">>>");
        assert_eq!(MergeStatus::COPIED.arrows(), ">>>");
        assert_eq!(MergeStatus::XATTR.arrows(), ">>>");
    }

    #[test]
    fn columns_render_independently() {
        let s = MergeStatus::UNLINKED_FIRST | MergeStatus::RENAMED | MergeStatus::SETID_BITS;
        assert_eq!(s.arrows(), "<-*");
        assert_eq!(MergeStatus::USED_EXISTING.arrows(), "=>>");
        assert_eq!(MergeStatus::AS_HARDLINK.arrows(), ">&>");
        assert_eq!(MergeStatus::PARENT_RENAME.arrows(), ">^>");
        assert_eq!(MergeStatus::FIXED_OWNERSHIP.arrows(), ">>~");
    }

    #[test]
    fn later_flag_wins_shared_column() {
        let s = MergeStatus::FIXED_OWNERSHIP | MergeStatus::SETID_BITS;
        assert_eq!(s.arrows(), ">>*");
        let s = MergeStatus::UNLINKED_FIRST | MergeStatus::USED_EXISTING;
        assert_eq!(s.arrows(), "=>>");
    }

    #[test]
    fn display_lists_names() {
        let s = MergeStatus::RENAMED | MergeStatus::XATTR;
        assert_eq!(s.to_string(), "[renamed,xattr]");
        assert_eq!(MergeStatus::empty().to_string(), "[]");
    }

    fn arb_status() -> impl Strategy<Value = MergeStatus> {
        (0u16..(1 << 9)).prop_map(MergeStatus)
    }

    proptest! {
        #[test]
        fn marker_is_always_three_known_columns(s in arb_status()) {
            let marker = s.arrows();
            let cols: Vec<char> = marker.chars().collect();
            prop_assert_eq!(cols.len(), 3);
            prop_assert!("><=".contains(cols[0]));
            prop_assert!(">-&^".contains(cols[1]));
            prop_assert!(">~*".contains(cols[2]));
        }

        #[test]
        fn insert_is_union(a in arb_status(), b in arb_status()) {
            let mut c = a;
            c.insert(b);
            prop_assert_eq!(c, a | b);
            prop_assert!(c.contains(a));
            prop_assert!(c.contains(b));
        }
    }
}
