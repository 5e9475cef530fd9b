// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate and normalize TPM CRB command/response buffer geometry.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Buffer-compliance decisions for TPM command/response buffer (CRB) devices.
//!
//! A CRB device exposes a command buffer and a response buffer. When both are
//! mapped at the same physical address they form one shared window and the
//! device must report identical sizes for them. Defective firmware reports
//! mismatched sizes; [`normalize`] derives a compliant geometry from such a
//! report without touching the device.

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Versioned description of the device probe decision procedure.
pub mod procedure;

pub use procedure::{OverlapPolicy, ProbeDecision, ProbeProcedure, WorkaroundParam};

/// Buffer geometry reported by a CRB device.
///
/// Values are never mutated in place; a corrected geometry is a new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferGeometry {
    /// Physical address of the command buffer.
    pub command_address: u64,
    /// Physical address of the response buffer.
    pub response_address: u64,
    /// Command buffer size in bytes.
    pub command_size: u32,
    /// Response buffer size in bytes.
    pub response_size: u32,
}

impl BufferGeometry {
    /// Construct a geometry from raw device-reported values.
    #[must_use]
    pub const fn new(
        command_address: u64,
        response_address: u64,
        command_size: u32,
        response_size: u32,
    ) -> Self {
        Self {
            command_address,
            response_address,
            command_size,
            response_size,
        }
    }

    /// Construct a geometry whose command and response buffers share `address`.
    #[must_use]
    pub const fn overlapping(address: u64, command_size: u32, response_size: u32) -> Self {
        Self::new(address, address, command_size, response_size)
    }

    /// Returns `true` when both buffers are mapped at the same physical address.
    #[must_use]
    pub const fn is_overlapping(&self) -> bool {
        self.command_address == self.response_address
    }

    /// Returns `true` when the overlap invariant holds.
    #[must_use]
    pub const fn is_compliant(&self) -> bool {
        !self.is_overlapping() || self.command_size == self.response_size
    }

    /// Classify the geometry against the overlap invariant.
    #[must_use]
    pub fn compliance(&self) -> Compliance {
        if !self.is_overlapping() {
            Compliance::Disjoint
        } else if self.command_size == self.response_size {
            Compliance::Matched
        } else {
            Compliance::Mismatched
        }
    }

    /// Return a new geometry with both buffer sizes set to `size`.
    #[must_use]
    pub const fn with_sizes(self, size: u32) -> Self {
        Self {
            command_size: size,
            response_size: size,
            ..self
        }
    }
}

impl fmt::Display for BufferGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cmd_pa=0x{:x} rsp_pa=0x{:x} cmd_size={} rsp_size={}",
            self.command_address, self.response_address, self.command_size, self.response_size
        )
    }
}

/// Classification of a geometry against the overlap invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compliance {
    /// Buffers live at different addresses; sizes are unconstrained.
    Disjoint,
    /// Buffers overlap and report identical sizes.
    Matched,
    /// Buffers overlap but report different sizes (the firmware defect).
    Mismatched,
}

/// Internal-consistency failure raised when a corrected geometry still breaks
/// the overlap invariant.
///
/// This is never a device-level failure and must not be swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("normalized geometry ({candidate}) derived from ({original}) still violates the overlap invariant")]
pub struct FatalIncompatibility {
    /// Geometry reported by the device.
    pub original: BufferGeometry,
    /// Geometry produced by the normalizer.
    pub candidate: BufferGeometry,
}

/// Derive a compliant geometry from a device report.
///
/// Disjoint buffers and overlapping buffers with matching sizes are returned
/// unchanged. Overlapping buffers with mismatched sizes are widened to the
/// larger of the two sizes so neither buffer is truncated.
pub fn normalize(geometry: BufferGeometry) -> Result<BufferGeometry, FatalIncompatibility> {
    match geometry.compliance() {
        Compliance::Disjoint | Compliance::Matched => Ok(geometry),
        Compliance::Mismatched => {
            let size = geometry.command_size.max(geometry.response_size);
            ensure_compliant(geometry, geometry.with_sizes(size))
        }
    }
}

fn ensure_compliant(
    original: BufferGeometry,
    candidate: BufferGeometry,
) -> Result<BufferGeometry, FatalIncompatibility> {
    if candidate.is_compliant() {
        Ok(candidate)
    } else {
        Err(FatalIncompatibility {
            original,
            candidate,
        })
    }
}
