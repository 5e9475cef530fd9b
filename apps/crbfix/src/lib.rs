// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Library surface for the crbfix TPM CRB remediation tool.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Detection and remediation of TPM CRB firmware that reports overlapping
//! command and response buffers with different sizes.
//!
//! The default CRB driver refuses such devices. crbfix recognises the failure
//! in kernel logs, installs a corrected driver when it can, and otherwise
//! excludes the defective driver so the system boots without it.

/// TOML configuration with built-in defaults.
pub mod config;
/// Kernel log signature detection.
pub mod detector;
/// Post-run device inspection.
pub mod device;
/// Host effect seam.
pub mod host;
/// Incremental kernel log sources.
pub mod logs;
/// Detection, remediation and verification state machine.
pub mod orchestrator;
/// Audit transcript rendering.
pub mod report;
/// Remediation strategies.
pub mod strategy;

pub use config::{resolve_config, CrbfixConfig};
pub use detector::{FailureDetector, FailureSignature};
pub use device::{DeviceProbe, DeviceReport, HostDeviceProbe};
pub use host::{Host, SystemHost};
pub use orchestrator::{
    FinalState, Orchestrator, RemediationOutcome, RunError, EXIT_ABORTED, EXIT_DEGRADED,
    EXIT_UNRESOLVED, EXIT_VERIFIED,
};
pub use report::{summarize, AuditRecord};
pub use strategy::{default_strategies, RemediationStrategy, StrategyError, StrategyKind};
