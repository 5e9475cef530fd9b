// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Describe the CRB probe decision procedure and derive its corrected revision.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{normalize, BufferGeometry, Compliance, FatalIncompatibility};

/// Module parameter that toggles the corrected overlap handling.
pub const WORKAROUND_PARAM: &str = "enable_workaround";

const MANIFEST_PREFIX: &str = "procedure.";

/// How a probe procedure treats overlapping buffers with mismatched sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Refuse the device (upstream behaviour).
    RejectMismatch,
    /// Widen both buffers to the larger reported size.
    NormalizeToMax,
}

impl OverlapPolicy {
    fn label(self) -> &'static str {
        match self {
            OverlapPolicy::RejectMismatch => "reject_mismatch",
            OverlapPolicy::NormalizeToMax => "normalize_to_max",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "reject_mismatch" => Some(OverlapPolicy::RejectMismatch),
            "normalize_to_max" => Some(OverlapPolicy::NormalizeToMax),
            _ => None,
        }
    }
}

/// Boolean module parameter exposed by a corrected procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkaroundParam {
    /// Parameter name as seen by the module loader.
    pub name: String,
    /// Value used when the loader does not supply one.
    pub default_enabled: bool,
}

impl Default for WorkaroundParam {
    fn default() -> Self {
        Self {
            name: WORKAROUND_PARAM.to_owned(),
            default_enabled: true,
        }
    }
}

/// Outcome of evaluating a probe procedure against a device report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecision {
    /// The geometry is compliant as reported.
    Accept(BufferGeometry),
    /// The geometry was corrected before initialization continues.
    AcceptNormalized {
        /// Geometry reported by the device.
        original: BufferGeometry,
        /// Geometry handed to initialization.
        normalized: BufferGeometry,
    },
    /// The device is refused.
    Reject(BufferGeometry),
}

/// Versioned description of the probe decision procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeProcedure {
    /// Monotonic revision; each correction produces a new revision.
    pub revision: u32,
    /// Handling of mismatched overlapping buffers.
    pub overlap_policy: OverlapPolicy,
    /// Optional runtime toggle for the corrected path.
    pub workaround_param: Option<WorkaroundParam>,
}

impl ProbeProcedure {
    /// The defective upstream procedure.
    #[must_use]
    pub fn upstream() -> Self {
        Self {
            revision: 1,
            overlap_policy: OverlapPolicy::RejectMismatch,
            workaround_param: None,
        }
    }

    /// Returns `true` when the procedure already normalizes mismatched overlaps.
    #[must_use]
    pub fn is_corrected(&self) -> bool {
        self.overlap_policy == OverlapPolicy::NormalizeToMax && self.workaround_param.is_some()
    }

    /// Produce the corrected revision of this procedure.
    ///
    /// Correcting an already-corrected procedure returns it unchanged.
    #[must_use]
    pub fn correct(&self) -> Self {
        if self.is_corrected() {
            return self.clone();
        }
        Self {
            revision: self.revision.saturating_add(1),
            overlap_policy: OverlapPolicy::NormalizeToMax,
            workaround_param: Some(WorkaroundParam::default()),
        }
    }

    /// Effective toggle state given an optional loader-supplied value.
    #[must_use]
    pub fn workaround_enabled(&self, supplied: Option<bool>) -> bool {
        match &self.workaround_param {
            Some(param) => supplied.unwrap_or(param.default_enabled),
            None => false,
        }
    }

    /// Decide whether a device with `geometry` may proceed to initialization.
    pub fn evaluate(
        &self,
        geometry: BufferGeometry,
        workaround_enabled: bool,
    ) -> Result<ProbeDecision, FatalIncompatibility> {
        if geometry.compliance() != Compliance::Mismatched {
            return Ok(ProbeDecision::Accept(geometry));
        }
        let normalizing = self.overlap_policy == OverlapPolicy::NormalizeToMax
            && self.workaround_param.is_some()
            && workaround_enabled;
        if !normalizing {
            return Ok(ProbeDecision::Reject(geometry));
        }
        let normalized = normalize(geometry)?;
        Ok(ProbeDecision::AcceptNormalized {
            original: geometry,
            normalized,
        })
    }

    /// Render the procedure as `key=value` lines for install manifests.
    #[must_use]
    pub fn render_manifest(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{MANIFEST_PREFIX}revision={}\n", self.revision));
        out.push_str(&format!(
            "{MANIFEST_PREFIX}overlap_policy={}\n",
            self.overlap_policy.label()
        ));
        if let Some(param) = &self.workaround_param {
            out.push_str(&format!(
                "{MANIFEST_PREFIX}param.{}={}\n",
                param.name,
                u8::from(param.default_enabled)
            ));
        }
        out
    }

    /// Parse a manifest produced by [`ProbeProcedure::render_manifest`].
    ///
    /// Unknown keys are ignored; a missing revision or policy yields `None`.
    #[must_use]
    pub fn parse_manifest(text: &str) -> Option<Self> {
        let mut revision = None;
        let mut overlap_policy = None;
        let mut workaround_param = None;
        for line in text.lines() {
            let Some(entry) = line.trim().strip_prefix(MANIFEST_PREFIX) else {
                continue;
            };
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            match key {
                "revision" => revision = value.parse().ok(),
                "overlap_policy" => overlap_policy = OverlapPolicy::from_label(value),
                _ => {
                    if let Some(name) = key.strip_prefix("param.") {
                        workaround_param = Some(WorkaroundParam {
                            name: name.to_owned(),
                            default_enabled: value == "1",
                        });
                    }
                }
            }
        }
        Some(Self {
            revision: revision?,
            overlap_policy: overlap_policy?,
            workaround_param,
        })
    }
}
