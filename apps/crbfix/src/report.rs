// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Render remediation outcomes as audit transcripts and JSON.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;

use serde::Serialize;

use crate::detector::FailureSignature;
use crate::device::{DeviceReport, Liveness};
pub use crate::orchestrator::NormalizedSizes;
use crate::orchestrator::{
    AttemptOutcome, FinalState, InEffect, RemediationOutcome, Verification,
};
use crate::strategy::StrategyKind;

/// One attempt line of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    /// Strategy tried.
    pub strategy: StrategyKind,
    /// Recorded outcome.
    pub outcome: AttemptOutcome,
    /// Detail text.
    pub detail: String,
}

/// Operator-facing summary of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    /// Terminal state.
    pub final_state: FinalState,
    /// Process exit code for the terminal state.
    pub exit_code: u8,
    /// Signature that triggered remediation.
    pub detection: Option<FailureSignature>,
    /// Attempts in order.
    pub attempts: Vec<AuditEntry>,
    /// Normalized sizes, when known.
    pub normalized: Option<NormalizedSizes>,
    /// Verification result.
    pub verification: Verification,
    /// Strategy in effect.
    pub in_effect: Option<InEffect>,
    /// Device state after the run.
    pub device: Option<DeviceReport>,
}

/// Build the audit record for `outcome`.
#[must_use]
pub fn summarize(outcome: &RemediationOutcome) -> AuditRecord {
    AuditRecord {
        final_state: outcome.final_state,
        exit_code: outcome.final_state.exit_code(),
        detection: outcome.signature.clone(),
        attempts: outcome
            .attempts
            .iter()
            .map(|attempt| AuditEntry {
                strategy: attempt.strategy(),
                outcome: attempt.outcome(),
                detail: attempt.detail().to_owned(),
            })
            .collect(),
        normalized: outcome.normalized_sizes,
        verification: outcome.verification.clone(),
        in_effect: outcome.in_effect,
        device: outcome.device.clone(),
    }
}

fn verification_label(verification: &Verification) -> String {
    match verification {
        Verification::NotRequired => "not_required".to_owned(),
        Verification::Clean => "clean".to_owned(),
        Verification::Contained => "contained".to_owned(),
        Verification::NoRemediation => "no_remediation".to_owned(),
        Verification::SignatureReappeared => "signature_reappeared".to_owned(),
        Verification::Mismatch {
            record,
            expected_size,
        } => format!(
            "mismatch used={} expected={}",
            record.normalized_size, expected_size
        ),
    }
}

impl AuditRecord {
    /// Flatten the record into `key=value` lines.
    #[must_use]
    pub fn key_values(&self) -> Vec<String> {
        let mut lines = vec![
            format!("final_state={}", self.final_state),
            format!("exit_code={}", self.exit_code),
        ];
        match &self.detection {
            Some(signature) => {
                lines.push("detected=true".to_owned());
                if let Some(device) = &signature.device_id {
                    lines.push(format!("device={device}"));
                }
                if let Some(errno) = signature.probe_error {
                    lines.push(format!("probe_error={errno}"));
                }
                if let (Some(cmd), Some(rsp)) = (
                    signature.reported_command_size,
                    signature.reported_response_size,
                ) {
                    lines.push(format!("reported.cmd_size={cmd}"));
                    lines.push(format!("reported.rsp_size={rsp}"));
                }
            }
            None => lines.push("detected=false".to_owned()),
        }
        for (index, entry) in self.attempts.iter().enumerate() {
            lines.push(format!("attempt.{index}.strategy={}", entry.strategy));
            lines.push(format!("attempt.{index}.outcome={}", entry.outcome.label()));
            lines.push(format!("attempt.{index}.detail={}", entry.detail));
        }
        if let Some(effect) = self.in_effect {
            lines.push(format!("in_effect={}", effect.strategy));
            lines.push(format!("in_effect.newly_applied={}", effect.newly_applied));
        }
        if let Some(sizes) = self.normalized {
            lines.push(format!("normalized.cmd_size={}", sizes.command_size));
            lines.push(format!("normalized.rsp_size={}", sizes.response_size));
        }
        lines.push(format!("verification={}", verification_label(&self.verification)));
        if let Some(device) = &self.device {
            lines.push(format!("device.node_present={}", device.node_present));
            lines.push(format!("device.driver={}", device.driver));
            lines.push(format!("device.liveness={}", device.liveness.label()));
        }
        lines
    }

    /// Render as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "crbfix: {} (exit {})", self.final_state, self.exit_code)?;
        match &self.detection {
            Some(signature) => writeln!(
                f,
                "  detected: overlapping buffer size mismatch on {}",
                signature.device_id.as_deref().unwrap_or("unknown device")
            )?,
            None => writeln!(f, "  detected: none")?,
        }
        for entry in &self.attempts {
            writeln!(
                f,
                "  attempt: {} {} ({})",
                entry.strategy,
                entry.outcome.label(),
                entry.detail
            )?;
        }
        if let Some(effect) = self.in_effect {
            let how = if effect.newly_applied {
                "applied this run"
            } else {
                "already active"
            };
            writeln!(f, "  in effect: {} ({how})", effect.strategy)?;
        }
        if let Some(sizes) = self.normalized {
            writeln!(
                f,
                "  normalized: cmd_size={} rsp_size={}",
                sizes.command_size, sizes.response_size
            )?;
        }
        write!(f, "  verification: {}", verification_label(&self.verification))?;
        if let Some(device) = &self.device {
            write!(
                f,
                "\n  device: {} driver={} liveness={}",
                if device.node_present { "present" } else { "absent" },
                device.driver,
                device.liveness.label()
            )?;
            if let Liveness::Failed { detail } = &device.liveness {
                write!(f, " ({detail})")?;
            }
        }
        Ok(())
    }
}
