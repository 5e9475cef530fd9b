// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Inspect the TPM device after a remediation run.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Post-run device inspection.
//!
//! The report is informational: it never changes a run's terminal state.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::config::CrbfixConfig;
use crate::host::{module_loaded, Host};

const GETCAP: &str = "tpm2_getcap";

/// Which CRB driver is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverBinding {
    /// The corrected driver is loaded.
    Patched,
    /// The default driver is loaded.
    Default,
    /// Neither driver is loaded.
    Absent,
}

impl DriverBinding {
    /// Stable machine-readable label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            DriverBinding::Patched => "patched",
            DriverBinding::Default => "default",
            DriverBinding::Absent => "absent",
        }
    }
}

impl fmt::Display for DriverBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of querying the TPM through `tpm2_getcap`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Liveness {
    /// The TPM answered a fixed-properties query.
    Responding,
    /// The query ran and failed.
    Failed {
        /// Command failure detail.
        detail: String,
    },
    /// `tpm2_getcap` is not installed.
    ToolMissing,
    /// No device node to query.
    NoDevice,
    /// Disabled in configuration.
    Skipped,
}

impl Liveness {
    /// Stable machine-readable label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Liveness::Responding => "responding",
            Liveness::Failed { .. } => "failed",
            Liveness::ToolMissing => "tool_missing",
            Liveness::NoDevice => "no_device",
            Liveness::Skipped => "skipped",
        }
    }
}

/// Device state observed after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceReport {
    /// A TPM character node exists.
    pub node_present: bool,
    /// Loaded CRB driver.
    pub driver: DriverBinding,
    /// TPM liveness.
    pub liveness: Liveness,
}

/// Inspects the device after a run.
pub trait DeviceProbe {
    /// Observe the current device state.
    fn inspect(&self) -> DeviceReport;
}

/// [`DeviceProbe`] reading device nodes, sysfs and `tpm2_getcap` through a [`Host`].
pub struct HostDeviceProbe<'h, H: Host> {
    host: &'h H,
    nodes: Vec<PathBuf>,
    default_driver: String,
    patched_driver: String,
    liveness_check: bool,
}

impl<'h, H: Host> HostDeviceProbe<'h, H> {
    /// Probe using the `[device]` and `[driver]` sections of `config`.
    pub fn new(host: &'h H, config: &CrbfixConfig) -> Self {
        Self {
            host,
            nodes: config.device.nodes.clone(),
            default_driver: config.driver.name.clone(),
            patched_driver: config.driver.patched_name.clone(),
            liveness_check: config.device.liveness_check,
        }
    }

    fn node_present(&self) -> bool {
        self.nodes.iter().any(|node| self.host.path_exists(node))
    }

    fn driver(&self) -> DriverBinding {
        if module_loaded(self.host, &self.patched_driver) {
            DriverBinding::Patched
        } else if module_loaded(self.host, &self.default_driver) {
            DriverBinding::Default
        } else {
            DriverBinding::Absent
        }
    }

    fn liveness(&self, node_present: bool) -> Liveness {
        if !self.liveness_check {
            return Liveness::Skipped;
        }
        if !node_present {
            return Liveness::NoDevice;
        }
        if self.host.find_program(GETCAP).is_none() {
            log::debug!("{GETCAP} not installed; skipping liveness query");
            return Liveness::ToolMissing;
        }
        match self.host.run(GETCAP, &["properties-fixed"]) {
            Ok(output) if output.success() => Liveness::Responding,
            Ok(output) => Liveness::Failed {
                detail: output.failure_detail(),
            },
            Err(err) => Liveness::Failed {
                detail: format!("{GETCAP}: {err}"),
            },
        }
    }
}

impl<H: Host> DeviceProbe for HostDeviceProbe<'_, H> {
    fn inspect(&self) -> DeviceReport {
        let node_present = self.node_present();
        DeviceReport {
            node_present,
            driver: self.driver(),
            liveness: self.liveness(node_present),
        }
    }
}
