//! imerge library crate: the pieces of the `imerge` binary that sit around
//! the engine in `imerge-core`.
//!
//! The primary interface is the `imerge` binary. This lib.rs exposes the
//! configuration, contents recorder and command hooks so that integration
//! tests can drive a full merge without going through the CLI.

pub mod config;
pub mod contents;
pub mod hook_commands;
pub mod telemetry;
