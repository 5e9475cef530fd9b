// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Keep the defective CRB driver from binding via a modprobe denylist.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::io;
use std::path::PathBuf;

use log::info;

use super::{RemediationStrategy, StrategyError, StrategyKind};
use crate::host::Host;

/// Denylist location and the driver it excludes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionSettings {
    /// modprobe.d file owned by crbfix.
    pub denylist_path: PathBuf,
    /// Driver to exclude.
    pub driver: String,
}

/// Safety net: the device stays unusable through the default driver until a
/// real fix is installed.
pub struct DeviceExclusion<'h, H: Host> {
    host: &'h H,
    settings: ExclusionSettings,
}

impl<'h, H: Host> DeviceExclusion<'h, H> {
    /// Prepare the strategy.
    pub fn new(host: &'h H, settings: ExclusionSettings) -> Self {
        Self { host, settings }
    }

    /// Denylist entry for the excluded driver.
    #[must_use]
    pub fn entry(&self) -> String {
        format!("blacklist {}", self.settings.driver)
    }

    /// Render the denylist file.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "# Written by crbfix: {} refuses devices whose overlapping CRB buffers\n\
             # report different sizes. Remove once a corrected driver is installed.\n\
             {}\n",
            self.settings.driver,
            self.entry()
        )
    }

    fn denied(&self, path: &std::path::Path, err: io::Error) -> StrategyError {
        StrategyError::PermissionDenied(format!("write {}: {err}", path.display()))
    }
}

impl<H: Host> RemediationStrategy for DeviceExclusion<'_, H> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DeviceExclusion
    }

    fn is_active(&self) -> bool {
        let entry = self.entry();
        self.host
            .read_to_string(&self.settings.denylist_path)
            .map(|text| text.lines().any(|line| line.trim() == entry))
            .unwrap_or(false)
    }

    fn is_available(&self) -> bool {
        true
    }

    fn apply(&mut self) -> Result<(), StrategyError> {
        let path = &self.settings.denylist_path;
        if !self.host.is_privileged() {
            return Err(StrategyError::PermissionDenied(format!(
                "writing {} requires root",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            self.host
                .create_dir_all(parent)
                .map_err(|err| self.denied(parent, err))?;
        }
        self.host
            .write_file(path, &self.render())
            .map_err(|err| self.denied(path, err))?;
        info!("excluded {} via {}", self.settings.driver, path.display());
        Ok(())
    }
}
