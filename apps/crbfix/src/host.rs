// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Narrow host capabilities used by remediation strategies.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

const PROC_STATUS: &str = "/proc/self/status";
/// sysfs directory listing loaded kernel modules.
pub const SYS_MODULE: &str = "/sys/module";

/// Captured result of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, `None` when terminated by a signal.
    pub status: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output carrying `stdout`.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with exit `status` and `stderr`.
    #[must_use]
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns `true` when the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Short single-line failure description.
    #[must_use]
    pub fn failure_detail(&self) -> String {
        let reason = self
            .stderr
            .lines()
            .chain(self.stdout.lines())
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("no output");
        match self.status {
            Some(code) => format!("exit {code}: {reason}"),
            None => format!("terminated by signal: {reason}"),
        }
    }
}

/// Effects on the surrounding system.
///
/// Device initialization state is owned by the host; strategies and log
/// sources only reach it through this seam.
pub trait Host {
    /// Run `program` with `args` to completion and capture its output.
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;
    /// Locate `name` on the search path.
    fn find_program(&self, name: &str) -> Option<PathBuf>;
    /// Returns `true` when the process may modify system configuration.
    fn is_privileged(&self) -> bool;
    /// Read a text file.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    /// Create or replace a text file.
    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()>;
    /// Recursively create a directory.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    /// List the entries of a directory.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
    /// Copy a file.
    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()>;
    /// Returns `true` when `path` exists.
    fn path_exists(&self, path: &Path) -> bool;
}

/// Host implementation backed by the running system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl Host for SystemHost {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        log::debug!("exec {program} {}", args.join(" "));
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn find_program(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }

    fn is_privileged(&self) -> bool {
        fs::read_to_string(PROC_STATUS)
            .ok()
            .and_then(|status| effective_uid(&status))
            .map_or(false, |uid| uid == 0)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        fs::write(path, contents)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(path)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::copy(from, to).map(|_| ())
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// sysfs entry for kernel module `name`; the kernel spells dashes as underscores.
#[must_use]
pub fn module_path(name: &str) -> PathBuf {
    Path::new(SYS_MODULE).join(name.replace('-', "_"))
}

/// Returns `true` when kernel module `name` is loaded.
pub fn module_loaded<H: Host + ?Sized>(host: &H, name: &str) -> bool {
    host.path_exists(&module_path(name))
}

/// Parse the effective uid from a `/proc/<pid>/status` document.
fn effective_uid(status: &str) -> Option<u32> {
    let line = status.lines().find(|line| line.starts_with("Uid:"))?;
    line.split_whitespace().nth(2)?.parse().ok()
}
