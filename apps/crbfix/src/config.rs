// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Load crbfix TOML configuration with built-in defaults.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::detector::DEFAULT_DRIVER;
use crate::strategy::device_exclusion::ExclusionSettings;
use crate::strategy::persistent_patch::PatchSettings;

/// Environment variable naming an alternate configuration file.
pub const CONFIG_ENV: &str = "CRBFIX_CONFIG";
/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/crbfix/crbfix.toml";

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("read config {path}: {error}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying IO failure.
        #[source]
        error: io::Error,
    },
    /// The file is not valid crbfix TOML.
    #[error("parse config {path}: {error}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Parser failure.
        #[source]
        error: toml::de::Error,
    },
}

/// Where kernel log text comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogSourceKind {
    /// `dmesg` output.
    #[default]
    Dmesg,
    /// A file containing exported kernel log lines.
    File,
}

/// Driver identity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverSection {
    /// Default (defective) CRB driver.
    pub name: String,
    /// Corrected driver module name.
    pub patched_name: String,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            name: DEFAULT_DRIVER.to_owned(),
            patched_name: "tpm_crb_patched".to_owned(),
        }
    }
}

/// Persistent patch settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatchSection {
    /// DKMS package name.
    pub dkms_name: String,
    /// DKMS package version.
    pub version: String,
    /// DKMS source root.
    pub source_root: PathBuf,
    /// Shipped corrected driver sources.
    pub module_source: PathBuf,
    /// modprobe options file.
    pub options_path: PathBuf,
    /// modules-load.d entry.
    pub load_path: PathBuf,
    /// Workaround toggle written to the options file.
    pub workaround_enabled: bool,
}

impl Default for PatchSection {
    fn default() -> Self {
        Self {
            dkms_name: "tpm-crb-patched".to_owned(),
            version: "1.0".to_owned(),
            source_root: PathBuf::from("/usr/src"),
            module_source: PathBuf::from("/usr/share/crbfix/tpm_crb_patched"),
            options_path: PathBuf::from("/etc/modprobe.d/tpm-crb-patched.conf"),
            load_path: PathBuf::from("/etc/modules-load.d/tpm-crb-patched.conf"),
            workaround_enabled: true,
        }
    }
}

/// Device exclusion settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExclusionSection {
    /// Denylist file.
    pub denylist_path: PathBuf,
}

impl Default for ExclusionSection {
    fn default() -> Self {
        Self {
            denylist_path: PathBuf::from("/etc/modprobe.d/blacklist-tpm-crb.conf"),
        }
    }
}

/// Log source settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogsSection {
    /// Source kind.
    pub source: LogSourceKind,
    /// File path for [`LogSourceKind::File`].
    pub path: Option<PathBuf>,
}

/// Post-run device inspection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSection {
    /// Character devices exposed once the TPM is bound.
    pub nodes: Vec<PathBuf>,
    /// Query the TPM with `tpm2_getcap` after a run.
    pub liveness_check: bool,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            nodes: vec![PathBuf::from("/dev/tpm0"), PathBuf::from("/dev/tpmrm0")],
            liveness_check: true,
        }
    }
}

/// Complete crbfix configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrbfixConfig {
    /// `[driver]`
    pub driver: DriverSection,
    /// `[patch]`
    pub patch: PatchSection,
    /// `[exclusion]`
    pub exclusion: ExclusionSection,
    /// `[logs]`
    pub logs: LogsSection,
    /// `[device]`
    pub device: DeviceSection,
}

impl CrbfixConfig {
    /// Parse configuration text; `origin` is used in error messages.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|error| ConfigError::Parse {
            path: origin.to_path_buf(),
            error,
        })
    }

    /// Settings for the persistent patch strategy.
    #[must_use]
    pub fn patch_settings(&self) -> PatchSettings {
        PatchSettings {
            dkms_name: self.patch.dkms_name.clone(),
            version: self.patch.version.clone(),
            module_name: self.driver.patched_name.clone(),
            source_root: self.patch.source_root.clone(),
            module_source: self.patch.module_source.clone(),
            options_path: self.patch.options_path.clone(),
            load_path: self.patch.load_path.clone(),
            workaround_enabled: self.patch.workaround_enabled,
        }
    }

    /// Settings for the device exclusion strategy.
    #[must_use]
    pub fn exclusion_settings(&self) -> ExclusionSettings {
        ExclusionSettings {
            denylist_path: self.exclusion.denylist_path.clone(),
            driver: self.driver.name.clone(),
        }
    }
}

/// Resolve the configuration path: `CRBFIX_CONFIG`, then the system path.
///
/// Returns the path and whether it was named explicitly.
#[must_use]
pub fn default_config_path() -> (PathBuf, bool) {
    if let Ok(value) = env::var(CONFIG_ENV) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return (PathBuf::from(trimmed), true);
        }
    }
    (PathBuf::from(SYSTEM_CONFIG_PATH), false)
}

/// Load configuration from `path`.
pub fn load_config(path: &Path) -> Result<CrbfixConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|error| ConfigError::Read {
        path: path.to_path_buf(),
        error,
    })?;
    CrbfixConfig::from_toml(&text, path)
}

/// Load configuration, falling back to defaults when an implicit path is absent.
pub fn resolve_config(explicit: Option<&Path>) -> Result<CrbfixConfig, ConfigError> {
    let (path, named) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => default_config_path(),
    };
    if !named && !path.exists() {
        log::debug!("no config at {}; using defaults", path.display());
        return Ok(CrbfixConfig::default());
    }
    load_config(&path)
}
