//! Command-backed hook runner.
//!
//! For a hook name, runs every `[hooks.commands]` entry (via `sh -c`) and
//! then every executable in `<dir>/<hook_name>/` of each configured hook
//! directory, sorted by file name. Hook fields are exported as environment
//! variables. The aggregated exit status is the maximum over all handlers.
//!
//! Stdout is only passed back when the hook grabs output and the trimmed
//! text is one of its allowed answers.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use imerge_core::{Hook, HookResult, HookRunner};

use crate::config::HooksConfig;

/// Exit status reported for a handler that was killed or could not start.
const FAILED_STATUS: i32 = 127;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// One thing to run for a hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Handler {
    /// A configured shell command.
    Shell(String),
    /// An executable file from a hook directory.
    Executable(PathBuf),
}

impl Handler {
    fn command(&self) -> Command {
        match self {
            Self::Shell(cmd) => {
                let mut c = Command::new("sh");
                c.args(["-c", cmd]);
                c
            }
            Self::Executable(path) => Command::new(path),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Shell(cmd) => format!("sh -c {cmd:?}"),
            Self::Executable(path) => path.display().to_string(),
        }
    }
}

/// What one handler produced.
#[derive(Clone, Debug, PartialEq, Eq)]
struct HandlerOutcome {
    status: i32,
    stdout: String,
    stderr: String,
}

// ---------------------------------------------------------------------------
// CommandHooks
// ---------------------------------------------------------------------------

/// A [`HookRunner`] that runs configured commands and hook-dir executables.
#[derive(Clone, Debug, Default)]
pub struct CommandHooks {
    commands: BTreeMap<String, Vec<String>>,
    dirs: Vec<PathBuf>,
    timeout: Duration,
}

impl CommandHooks {
    /// Build from the `[hooks]` section.
    #[must_use]
    pub fn new(config: &HooksConfig) -> Self {
        Self {
            commands: config.commands.clone(),
            dirs: config.dirs.clone(),
            timeout: Duration::from_secs(config.timeout_seconds.into()),
        }
    }

    /// Handlers for `hook_name`, in run order.
    #[must_use]
    pub fn handlers(&self, hook_name: &str) -> Vec<Handler> {
        let mut handlers: Vec<Handler> = self
            .commands
            .get(hook_name)
            .into_iter()
            .flatten()
            .map(|c| Handler::Shell(c.clone()))
            .collect();
        for dir in &self.dirs {
            handlers.extend(
                executables_in(&dir.join(hook_name))
                    .into_iter()
                    .map(Handler::Executable),
            );
        }
        handlers
    }

    fn run_handler(&self, handler: &Handler, hook: &Hook) -> HandlerOutcome {
        let mut command = handler.command();
        command
            .envs(hook.fields())
            .env("IMERGE_HOOK", hook.name())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return HandlerOutcome {
                    status: FAILED_STATUS,
                    stdout: String::new(),
                    stderr: format!("{}: {e}", handler.describe()),
                };
            }
        };
        wait_with_timeout(child, self.timeout)
    }
}

impl HookRunner for CommandHooks {
    fn run(&self, hook: &Hook) -> HookResult {
        let mut result = HookResult::ok();
        for handler in self.handlers(hook.name()) {
            let outcome = self.run_handler(&handler, hook);
            if outcome.status != 0 {
                tracing::warn!(
                    hook = hook.name(),
                    handler = %handler.describe(),
                    status = outcome.status,
                    stderr = outcome.stderr.trim_end(),
                    "hook handler failed"
                );
            } else {
                tracing::debug!(hook = hook.name(), handler = %handler.describe(), "hook handler ran");
            }
            result.max_exit_status = result.max_exit_status.max(outcome.status);

            let answer = outcome.stdout.trim();
            if !answer.is_empty() && hook.accepts_output(answer) {
                answer.clone_into(&mut result.output);
            }
        }
        result
    }
}

/// Executable regular files directly under `dir`, sorted by name.
///
/// A missing directory has no handlers.
fn executables_in(dir: &Path) -> Vec<PathBuf> {
    let Ok(read) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = read
        .filter_map(std::result::Result::ok)
        .filter(|entry| {
            entry
                .path()
                .metadata()
                .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        })
        .map(|entry| entry.path())
        .collect();
    found.sort();
    found
}

/// Wait for `child`, draining both pipes on reader threads so a chatty
/// handler never blocks on a full pipe.
///
/// A handler killed at the timeout may leave grandchildren holding the
/// pipes open; its readers are detached rather than joined.
fn wait_with_timeout(mut child: Child, timeout: Duration) -> HandlerOutcome {
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return HandlerOutcome {
                    status: status.code().unwrap_or(FAILED_STATUS),
                    stdout: join_reader(stdout),
                    stderr: join_reader(stderr),
                };
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return HandlerOutcome {
                        status: FAILED_STATUS,
                        stdout: String::new(),
                        stderr: format!("killed by timeout after {}s", timeout.as_secs()),
                    };
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                let _ = child.kill();
                return HandlerOutcome {
                    status: FAILED_STATUS,
                    stdout: String::new(),
                    stderr: format!("failed to wait for hook handler: {e}"),
                };
            }
        }
    }
}

fn spawn_reader(mut stream: impl Read + Send + 'static) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap_or(0);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(reader: Option<JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn hooks(commands: &[(&str, &[&str])], dirs: Vec<PathBuf>, timeout_seconds: u32) -> CommandHooks {
        CommandHooks::new(&HooksConfig {
            dirs,
            timeout_seconds,
            commands: commands
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.iter().map(|s| (*s).to_owned()).collect()))
                .collect(),
        })
    }

    fn write_script(dir: &Path, name: &str, body: &str, mode: u32) {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn unconfigured_hook_succeeds() {
        let runner = hooks(&[], Vec::new(), 5);
        assert_eq!(runner.run(&Hook::new("merger_install_pre")), HookResult::ok());
    }

    #[test]
    fn max_exit_status_is_aggregated() {
        let runner = hooks(&[("merger_check_pre", &["exit 2", "exit 5", "true"])], Vec::new(), 5);
        let result = runner.run(&Hook::new("merger_check_pre"));
        assert_eq!(result.max_exit_status, 5);
        assert!(!result.succeeded());
    }

    #[test]
    fn fields_are_exported_as_environment() {
        let runner = hooks(
            &[(
                "merger_install_file_pre",
                &["test \"$INSTALL_DESTINATION\" = /etc/foo && test \"$IMERGE_HOOK\" = merger_install_file_pre"],
            )],
            Vec::new(),
            5,
        );
        let hook = Hook::new("merger_install_file_pre").with("INSTALL_DESTINATION", "/etc/foo");
        assert!(runner.run(&hook).succeeded());

        let other = Hook::new("merger_install_file_pre").with("INSTALL_DESTINATION", "/etc/bar");
        assert!(!runner.run(&other).succeeded());
    }

    #[test]
    fn allowed_output_is_captured() {
        let runner = hooks(&[("merger_install_file_override", &["echo skip"])], Vec::new(), 5);
        let hook = Hook::new("merger_install_file_override").grab_output(&["skip"]);
        assert!(runner.run(&hook).is_skip());
    }

    #[test]
    fn unexpected_output_is_dropped() {
        let runner = hooks(&[("merger_install_file_override", &["echo maybe"])], Vec::new(), 5);
        let hook = Hook::new("merger_install_file_override").grab_output(&["skip"]);
        let result = runner.run(&hook);
        assert!(result.succeeded());
        assert_eq!(result.output, "");
    }

    #[test]
    fn output_ignored_when_not_grabbed() {
        let runner = hooks(&[("merger_install_post", &["echo skip"])], Vec::new(), 5);
        assert_eq!(runner.run(&Hook::new("merger_install_post")).output, "");
    }

    #[test]
    fn timeout_kills_handler() {
        let runner = hooks(&[("merger_install_pre", &["sleep 10"])], Vec::new(), 1);
        let start = Instant::now();
        let result = runner.run(&Hook::new("merger_install_pre"));
        assert_eq!(result.max_exit_status, FAILED_STATUS);
        assert!(start.elapsed() < Duration::from_secs(8));
    }

    #[test]
    fn large_output_does_not_stall_handler() {
        let runner = hooks(
            &[("merger_check_pre", &["yes | head -c 200000; echo done >&2; exit 0"])],
            Vec::new(),
            5,
        );
        let start = Instant::now();
        let outcome = runner.run_handler(
            &Handler::Shell("yes | head -c 200000; echo done >&2; exit 0".to_owned()),
            &Hook::new("merger_check_pre"),
        );
        assert_eq!(outcome.status, 0, "{}", outcome.stderr);
        assert_eq!(outcome.stdout.len(), 200_000);
        assert_eq!(outcome.stderr, "done\n");
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(runner.run(&Hook::new("merger_check_pre")).succeeded());
    }

    #[test]
    fn hook_dir_executables_run_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let hook_dir = dir.path().join("merger_install_post");
        fs::create_dir(&hook_dir).unwrap();
        let log = dir.path().join("log");
        write_script(&hook_dir, "20-second", &format!("echo second >> {}", log.display()), 0o755);
        write_script(&hook_dir, "10-first", &format!("echo first >> {}", log.display()), 0o755);
        write_script(&hook_dir, "30-disabled", &format!("echo disabled >> {}", log.display()), 0o644);

        let runner = hooks(&[], vec![dir.path().to_owned()], 5);
        assert_eq!(
            runner.handlers("merger_install_post"),
            [
                Handler::Executable(hook_dir.join("10-first")),
                Handler::Executable(hook_dir.join("20-second")),
            ]
        );
        assert!(runner.run(&Hook::new("merger_install_post")).succeeded());
        assert_eq!(fs::read_to_string(&log).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn configured_commands_run_before_hook_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let hook_dir = dir.path().join("merger_check_post");
        fs::create_dir(&hook_dir).unwrap();
        write_script(&hook_dir, "check", "exit 0", 0o755);

        let runner = hooks(&[("merger_check_post", &["true"])], vec![dir.path().to_owned()], 5);
        assert_eq!(
            runner.handlers("merger_check_post"),
            [
                Handler::Shell("true".to_owned()),
                Handler::Executable(hook_dir.join("check")),
            ]
        );
    }

    #[test]
    fn missing_executable_counts_as_failure() {
        let runner = CommandHooks::default();
        let outcome = runner.run_handler(
            &Handler::Executable(PathBuf::from("/nonexistent/hook")),
            &Hook::new("merger_install_pre"),
        );
        assert_eq!(outcome.status, FAILED_STATUS);
        assert!(outcome.stderr.contains("/nonexistent/hook"));
    }
}
