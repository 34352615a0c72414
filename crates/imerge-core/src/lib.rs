//! Merge engine: install a staged image tree into a root filesystem.
//!
//! A [`Merger`] runs a read-only [`check`](Merger::check) pass and a mutating
//! [`merge`](Merger::merge) pass over the same image, driven by one
//! source-kind × destination-kind [decision table](dispatch::TABLE). Policy
//! lives behind injected collaborators: [`HookRunner`] for extension points,
//! [`SecurityLabeler`] for labels, [`SandboxIdentity`] for ownership
//! remapping, and [`Recorder`] for the durable record of what was installed.
//!
//! ```no_run
//! use imerge_core::{MemoryRecorder, MergeEnv, MergeRequest, Merger};
//!
//! let request = MergeRequest::new("/var/tmp/image", "/");
//! let mut merger = Merger::new(request, MergeEnv::default(), MemoryRecorder::new());
//! if merger.check()? {
//!     merger.merge()?;
//! }
//! # Ok::<(), imerge_core::MergeError>(())
//! ```

pub mod dedup;
pub mod digest;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod flags;
pub mod hooks;
mod install;
pub mod label;
pub mod merger;
pub mod ownership;
pub mod protect;
pub mod record;

pub use dedup::{ContentIdentity, DedupIndex};
pub use dispatch::{Action, ConflictKind, action_for};
pub use entry::{EntryKind, classify};
pub use error::{MergeError, Result};
pub use flags::MergeStatus;
pub use hooks::{Hook, HookResult, HookRunner, NoHooks, PackageIdentity};
pub use label::{NoLabels, SecurityLabel, SecurityLabeler};
pub use merger::{MergeEnv, MergeOptions, MergeRequest, Merger};
pub use ownership::{NoSandbox, Ownership, ReducedIds, SandboxIdentity};
pub use protect::ConfigProtect;
pub use record::{MemoryRecorder, RecordKind, RecordedEntry, Recorder};
