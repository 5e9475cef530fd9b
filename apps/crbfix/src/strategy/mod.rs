// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Remediation strategy capability interface and the closed strategy set.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::config::CrbfixConfig;
use crate::host::Host;

/// Exclusion of the default CRB driver through a modprobe denylist.
pub mod device_exclusion;
/// Persistent corrected driver registered through DKMS.
pub mod persistent_patch;

pub use device_exclusion::DeviceExclusion;
pub use persistent_patch::PersistentPatch;

/// Closed set of remediation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Install the corrected probe procedure as a standing driver.
    PersistentPatch,
    /// Keep the defective driver from binding the device.
    DeviceExclusion,
}

impl StrategyKind {
    /// Strategies in the order they are attempted.
    pub const PRIORITY: [StrategyKind; 2] =
        [StrategyKind::PersistentPatch, StrategyKind::DeviceExclusion];

    /// Position in [`StrategyKind::PRIORITY`]; lower runs first.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            StrategyKind::PersistentPatch => 0,
            StrategyKind::DeviceExclusion => 1,
        }
    }

    /// Stable machine-readable label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            StrategyKind::PersistentPatch => "persistent_patch",
            StrategyKind::DeviceExclusion => "device_exclusion",
        }
    }

    /// Returns `true` when an active strategy of this kind restores the device.
    #[must_use]
    pub fn restores_device(self) -> bool {
        matches!(self, StrategyKind::PersistentPatch)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Strategy-level failure; always recoverable by falling through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyError {
    /// The host lacks the prerequisites for the strategy.
    #[error("strategy unavailable: {0}")]
    Unavailable(String),
    /// The corrected procedure could not be assembled into a loadable module.
    #[error("build failure: {0}")]
    BuildFailure(String),
    /// The module could not be registered for automatic loading.
    #[error("install failure: {0}")]
    InstallFailure(String),
    /// The configuration could not be written.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// Capability set shared by every remediation strategy.
pub trait RemediationStrategy {
    /// Which strategy this is.
    fn kind(&self) -> StrategyKind;
    /// Returns `true` when the strategy is already in effect.
    fn is_active(&self) -> bool;
    /// Returns `true` when the host has the strategy's prerequisites.
    fn is_available(&self) -> bool;
    /// Install the strategy. Blocks until the external steps finish.
    fn apply(&mut self) -> Result<(), StrategyError>;
}

/// Production strategies behind one capability interface.
pub enum Strategy<'h, H: Host> {
    /// See [`PersistentPatch`].
    PersistentPatch(PersistentPatch<'h, H>),
    /// See [`DeviceExclusion`].
    DeviceExclusion(DeviceExclusion<'h, H>),
}

impl<H: Host> RemediationStrategy for Strategy<'_, H> {
    fn kind(&self) -> StrategyKind {
        match self {
            Strategy::PersistentPatch(strategy) => strategy.kind(),
            Strategy::DeviceExclusion(strategy) => strategy.kind(),
        }
    }

    fn is_active(&self) -> bool {
        match self {
            Strategy::PersistentPatch(strategy) => strategy.is_active(),
            Strategy::DeviceExclusion(strategy) => strategy.is_active(),
        }
    }

    fn is_available(&self) -> bool {
        match self {
            Strategy::PersistentPatch(strategy) => strategy.is_available(),
            Strategy::DeviceExclusion(strategy) => strategy.is_available(),
        }
    }

    fn apply(&mut self) -> Result<(), StrategyError> {
        match self {
            Strategy::PersistentPatch(strategy) => strategy.apply(),
            Strategy::DeviceExclusion(strategy) => strategy.apply(),
        }
    }
}

/// Build every production strategy in priority order.
pub fn default_strategies<'h, H: Host>(host: &'h H, config: &CrbfixConfig) -> Vec<Strategy<'h, H>> {
    StrategyKind::PRIORITY
        .iter()
        .map(|kind| match kind {
            StrategyKind::PersistentPatch => {
                Strategy::PersistentPatch(PersistentPatch::new(host, config.patch_settings()))
            }
            StrategyKind::DeviceExclusion => {
                Strategy::DeviceExclusion(DeviceExclusion::new(host, config.exclusion_settings()))
            }
        })
        .collect()
}
