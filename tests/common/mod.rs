//! Shared test helpers for imerge CLI tests.
//!
//! Every test gets its own image, root and config directory under a
//! `TempDir`. The binary never sees the host configuration: `--config`
//! always points into the temp dir and the protection env vars are cleared.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        for sub in ["image", "root", "etc"] {
            fs::create_dir(dir.path().join(sub)).unwrap();
        }
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn image(&self) -> PathBuf {
        self.path().join("image")
    }

    pub fn root(&self) -> PathBuf {
        self.path().join("root")
    }

    pub fn config(&self) -> PathBuf {
        self.path().join("etc/config.toml")
    }

    pub fn write_config(&self, toml: &str) {
        fs::write(self.config(), toml).unwrap();
    }

    pub fn image_file(&self, rel: &str, content: &str) -> PathBuf {
        write_file(&self.image(), rel, content)
    }

    pub fn root_file(&self, rel: &str, content: &str) -> PathBuf {
        write_file(&self.root(), rel, content)
    }

    /// Run `imerge <subcommand> --image .. --root .. --config .. <extra>`.
    pub fn imerge(&self, subcommand: &str, extra: &[&str]) -> Output {
        let image = self.image();
        let root = self.root();
        let config = self.config();
        Command::new(env!("CARGO_BIN_EXE_imerge"))
            .arg(subcommand)
            .arg("--image")
            .arg(&image)
            .arg("--root")
            .arg(&root)
            .arg("--config")
            .arg(&config)
            .args(extra)
            .env_remove("CONFIG_PROTECT")
            .env_remove("CONFIG_PROTECT_MASK")
            .env_remove("IMERGE_NO_CHOWN")
            .env_remove("IMERGE_LOG_FORMAT")
            .current_dir(self.path())
            .output()
            .expect("failed to execute imerge")
    }

    /// Run imerge and assert it succeeds. Returns stdout.
    pub fn imerge_ok(&self, subcommand: &str, extra: &[&str]) -> String {
        let out = self.imerge(subcommand, extra);
        assert!(
            out.status.success(),
            "imerge {subcommand} failed:\nstdout: {}\nstderr: {}",
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr),
        );
        String::from_utf8_lossy(&out.stdout).to_string()
    }

    /// Run imerge and assert it fails. Returns the output.
    pub fn imerge_fails(&self, subcommand: &str, extra: &[&str]) -> Output {
        let out = self.imerge(subcommand, extra);
        assert!(
            !out.status.success(),
            "Expected imerge {subcommand} to fail, but it succeeded.\nstdout: {}",
            String::from_utf8_lossy(&out.stdout),
        );
        out
    }
}

pub fn write_file(base: &Path, rel: &str, content: &str) -> PathBuf {
    let path = base.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    path
}
