// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Read kernel log output incrementally for detection and verification.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::host::Host;

/// Failure to read the log at all.
#[derive(Debug, Error)]
pub enum LogSourceError {
    /// The log reader could not be executed or the file could not be read.
    #[error("read {source_name}: {error}")]
    Io {
        /// Description of the source.
        source_name: String,
        /// Underlying IO failure.
        #[source]
        error: io::Error,
    },
    /// The log command ran but reported failure.
    #[error("{source_name} failed: {detail}")]
    Command {
        /// Description of the source.
        source_name: String,
        /// Failure detail.
        detail: String,
    },
}

/// Finite, already-materialized event stream.
///
/// Every call returns only the lines produced since the previous call, so a
/// verification pass never re-reads the lines that triggered detection.
pub trait LogSource {
    /// Human-readable name used in logs and audit output.
    fn describe(&self) -> String;
    /// Return lines appended since the previous read.
    fn read(&mut self) -> Result<Vec<String>, LogSourceError>;
}

const ANCHOR_LINES: usize = 3;

/// Content cursor shared by the concrete sources.
///
/// Remembers the newest lines already returned. A bounded ring buffer drops
/// its oldest lines while keeping its length, so position alone cannot tell
/// fresh output apart; the anchor is located by content instead.
#[derive(Debug, Default, Clone)]
struct Cursor {
    anchor: Vec<String>,
}

impl Cursor {
    fn advance(&mut self, mut lines: Vec<String>) -> Vec<String> {
        let start = self.resume_at(&lines);
        if !lines.is_empty() {
            let keep = lines.len().min(ANCHOR_LINES);
            self.anchor = lines[lines.len() - keep..].to_vec();
        }
        lines.split_off(start)
    }

    /// Index of the first line after the anchor, or `0` when it is gone.
    fn resume_at(&self, lines: &[String]) -> usize {
        // Oldest anchor lines may have been dropped; try the newest suffixes.
        for skip in 0..self.anchor.len() {
            let suffix = &self.anchor[skip..];
            if let Some(found) = lines
                .windows(suffix.len())
                .position(|window| window == suffix)
            {
                return found + suffix.len();
            }
        }
        if !self.anchor.is_empty() {
            log::debug!("log anchor not found in {} lines; rescanning", lines.len());
        }
        0
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_owned).collect()
}

/// Kernel ring buffer read through `dmesg`.
pub struct DmesgLog<'h, H: Host> {
    host: &'h H,
    cursor: Cursor,
}

impl<'h, H: Host> DmesgLog<'h, H> {
    /// Read the ring buffer through `host`.
    pub fn new(host: &'h H) -> Self {
        Self {
            host,
            cursor: Cursor::default(),
        }
    }
}

impl<H: Host> LogSource for DmesgLog<'_, H> {
    fn describe(&self) -> String {
        "dmesg".to_owned()
    }

    fn read(&mut self) -> Result<Vec<String>, LogSourceError> {
        let output = self
            .host
            .run("dmesg", &[])
            .map_err(|error| LogSourceError::Io {
                source_name: self.describe(),
                error,
            })?;
        if !output.success() {
            return Err(LogSourceError::Command {
                source_name: self.describe(),
                detail: output.failure_detail(),
            });
        }
        Ok(self.cursor.advance(split_lines(&output.stdout)))
    }
}

/// Log exported to a file, e.g. `journalctl -k` output.
pub struct FileLog<'h, H: Host> {
    host: &'h H,
    path: PathBuf,
    cursor: Cursor,
}

impl<'h, H: Host> FileLog<'h, H> {
    /// Read `path` through `host`.
    pub fn new(host: &'h H, path: impl AsRef<Path>) -> Self {
        Self {
            host,
            path: path.as_ref().to_path_buf(),
            cursor: Cursor::default(),
        }
    }
}

impl<H: Host> LogSource for FileLog<'_, H> {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    fn read(&mut self) -> Result<Vec<String>, LogSourceError> {
        let text = self
            .host
            .read_to_string(&self.path)
            .map_err(|error| LogSourceError::Io {
                source_name: self.describe(),
                error,
            })?;
        Ok(self.cursor.advance(split_lines(&text)))
    }
}
