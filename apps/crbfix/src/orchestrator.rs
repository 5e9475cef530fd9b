// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Drive detection, strategy fallback and verification for one remediation run.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Single-pass remediation state machine.
//!
//! `Idle → Detecting → Remediating → Verifying → {Verified, DegradedFallback,
//! Unresolved}`. A run never revisits a phase. Callers must serialise runs
//! against the same device; the orchestrator holds no lock of its own.

use std::fmt;

use crb_compliance::{normalize, BufferGeometry, FatalIncompatibility};
use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::detector::{FailureDetector, FailureSignature, WorkaroundRecord};
use crate::device::{DeviceProbe, DeviceReport, DriverBinding, Liveness};
use crate::logs::{LogSource, LogSourceError};
use crate::strategy::{RemediationStrategy, StrategyError, StrategyKind};

/// Exit code for [`FinalState::Verified`].
pub const EXIT_VERIFIED: u8 = 0;
/// Exit code for [`FinalState::Unresolved`].
pub const EXIT_UNRESOLVED: u8 = 1;
/// Exit code for [`FinalState::DegradedFallback`].
pub const EXIT_DEGRADED: u8 = 2;
/// Exit code for a run aborted by [`RunError`].
pub const EXIT_ABORTED: u8 = 3;

/// Orchestrator phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Not started.
    Idle,
    /// Scanning logs for the defect signature.
    Detecting,
    /// Trying strategies in priority order.
    Remediating,
    /// Re-scanning fresh log output.
    Verifying,
    /// Terminal: device healthy or repaired.
    Verified,
    /// Terminal: device excluded, not usable.
    DegradedFallback,
    /// Terminal: defect persists.
    Unresolved,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalState {
    /// Nothing to remediate, or the corrected driver verified clean.
    Verified,
    /// The defective driver is excluded; the device is unavailable by design.
    DegradedFallback,
    /// No strategy resolved the defect.
    Unresolved,
}

impl FinalState {
    /// Process exit code for automation.
    #[must_use]
    pub fn exit_code(self) -> u8 {
        match self {
            FinalState::Verified => EXIT_VERIFIED,
            FinalState::Unresolved => EXIT_UNRESOLVED,
            FinalState::DegradedFallback => EXIT_DEGRADED,
        }
    }

    /// Stable machine-readable label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            FinalState::Verified => "verified",
            FinalState::DegradedFallback => "degraded_fallback",
            FinalState::Unresolved => "unresolved",
        }
    }

    fn phase(self) -> Phase {
        match self {
            FinalState::Verified => Phase::Verified,
            FinalState::DegradedFallback => Phase::DegradedFallback,
            FinalState::Unresolved => Phase::Unresolved,
        }
    }
}

impl fmt::Display for FinalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Recorded result of one strategy attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The strategy installed successfully.
    Applied,
    /// The host lacks the strategy's prerequisites.
    Unavailable,
    /// The strategy failed to install.
    Failed,
}

impl AttemptOutcome {
    /// Stable machine-readable label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            AttemptOutcome::Applied => "applied",
            AttemptOutcome::Unavailable => "unavailable",
            AttemptOutcome::Failed => "failed",
        }
    }
}

/// Attempt whose outcome is not yet known.
#[derive(Debug)]
struct PendingAttempt {
    strategy: StrategyKind,
}

impl PendingAttempt {
    fn start(strategy: StrategyKind) -> Self {
        info!("attempting {strategy}");
        Self { strategy }
    }

    fn finish(self, outcome: AttemptOutcome, detail: impl Into<String>) -> RemediationAttempt {
        let attempt = RemediationAttempt {
            strategy: self.strategy,
            outcome,
            detail: detail.into(),
        };
        match outcome {
            AttemptOutcome::Applied => info!("{}: {}", attempt.strategy, attempt.detail),
            _ => warn!("{} {}: {}", attempt.strategy, outcome.label(), attempt.detail),
        }
        attempt
    }
}

/// One strategy attempt in the audit trail. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemediationAttempt {
    strategy: StrategyKind,
    outcome: AttemptOutcome,
    detail: String,
}

impl RemediationAttempt {
    /// Strategy tried.
    #[must_use]
    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    /// Recorded outcome.
    #[must_use]
    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome
    }

    /// Free-form detail.
    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

/// Strategy considered in effect when verification starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InEffect {
    /// Strategy in effect.
    pub strategy: StrategyKind,
    /// `false` when the strategy was already active and was skipped.
    pub newly_applied: bool,
}

/// Result of the verification re-scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Verification {
    /// No signature was detected; nothing was remediated.
    NotRequired,
    /// Fresh log output carries no signature.
    Clean,
    /// The device is excluded by design.
    Contained,
    /// No strategy was in effect.
    NoRemediation,
    /// The signature reappeared after the corrected driver was installed.
    SignatureReappeared,
    /// The corrected driver's decision disagrees with the validator.
    Mismatch {
        /// Record logged by the corrected driver.
        record: WorkaroundRecord,
        /// Size the validator derives from the same report.
        expected_size: u32,
    },
}

/// Buffer sizes after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NormalizedSizes {
    /// Command buffer size.
    pub command_size: u32,
    /// Response buffer size.
    pub response_size: u32,
}

impl From<BufferGeometry> for NormalizedSizes {
    fn from(geometry: BufferGeometry) -> Self {
        Self {
            command_size: geometry.command_size,
            response_size: geometry.response_size,
        }
    }
}

/// Terminal value of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemediationOutcome {
    /// Terminal state.
    pub final_state: FinalState,
    /// Attempts in the order they were made.
    pub attempts: Vec<RemediationAttempt>,
    /// Corrected geometry, when the logs carried the buffer address and sizes.
    pub normalized_geometry: Option<BufferGeometry>,
    /// Corrected sizes, also known when only a workaround record named them.
    pub normalized_sizes: Option<NormalizedSizes>,
    /// Signature that triggered remediation.
    pub signature: Option<FailureSignature>,
    /// Strategy in effect at verification.
    pub in_effect: Option<InEffect>,
    /// Verification result.
    pub verification: Verification,
    /// Device state observed after the run.
    pub device: Option<DeviceReport>,
    /// Phases visited, in order.
    pub phases: Vec<Phase>,
}

/// Errors that abort a run before it reaches a terminal state.
#[derive(Debug, Error)]
pub enum RunError {
    /// The validator's post-condition guard tripped.
    #[error("internal consistency failure: {0}")]
    Fatal(#[from] FatalIncompatibility),
    /// The log could not be read at all.
    #[error("log unreadable: {0}")]
    LogSource(#[from] LogSourceError),
}

/// Drives one remediation run.
pub struct Orchestrator<'a> {
    logs: &'a mut dyn LogSource,
    detector: FailureDetector,
    probe: Option<&'a dyn DeviceProbe>,
    phases: Vec<Phase>,
}

impl<'a> Orchestrator<'a> {
    /// Orchestrate over `logs` using `detector`.
    pub fn new(logs: &'a mut dyn LogSource, detector: FailureDetector) -> Self {
        Self {
            logs,
            detector,
            probe: None,
            phases: vec![Phase::Idle],
        }
    }

    /// Inspect the device after each run.
    #[must_use]
    pub fn with_device_probe(mut self, probe: &'a dyn DeviceProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Idle)
    }

    fn enter(&mut self, phase: Phase) {
        info!("phase {:?} -> {:?}", self.phase(), phase);
        self.phases.push(phase);
    }

    /// Run detection, remediation and verification once.
    ///
    /// Strategy failures are recorded and fall through; only validator guard
    /// failures and unreadable logs abort.
    pub fn run<S: RemediationStrategy>(
        &mut self,
        strategies: &mut [S],
    ) -> Result<RemediationOutcome, RunError> {
        self.phases.clear();
        self.phases.push(Phase::Idle);

        self.enter(Phase::Detecting);
        info!("scanning {}", self.logs.describe());
        let batch = self.logs.read()?;
        let Some(signature) = self.detector.scan(batch.iter()) else {
            info!("no defect signature in {} line(s)", batch.len());
            return Ok(self.conclude(
                FinalState::Verified,
                Vec::new(),
                None,
                None,
                None,
                Verification::NotRequired,
            ));
        };
        info!(
            "defect signature found for {}",
            signature.device_id.as_deref().unwrap_or("unknown device")
        );
        let mut normalized = match signature.reported_geometry() {
            Some(reported) => Some(normalize(reported)?),
            None => None,
        };

        self.enter(Phase::Remediating);
        let (attempts, in_effect) = remediate(strategies);

        self.enter(Phase::Verifying);
        let fresh = self.logs.read()?;
        let (final_state, verification) = match in_effect {
            None => {
                warn!("no remediation strategy is in effect");
                (FinalState::Unresolved, Verification::NoRemediation)
            }
            Some(effect) if !effect.strategy.restores_device() => {
                warn!("{} in effect; the device is unavailable until a corrected driver is installed", effect.strategy);
                (FinalState::DegradedFallback, Verification::Contained)
            }
            Some(effect) => {
                if self.detector.scan(fresh.iter()).is_some() {
                    warn!("defect signature reappeared after {}", effect.strategy);
                    (FinalState::Unresolved, Verification::SignatureReappeared)
                } else if let Some(record) = self.detector.last_workaround(fresh.iter()) {
                    let rederived = normalize(record.reported_geometry(signature.shared_address()))?;
                    if rederived.command_size == record.normalized_size {
                        info!("corrected driver normalized buffers to {}", record.normalized_size);
                        normalized = Some(rederived);
                        (FinalState::Verified, Verification::Clean)
                    } else {
                        warn!(
                            "corrected driver used {} but the validator derives {}",
                            record.normalized_size, rederived.command_size
                        );
                        (
                            FinalState::Unresolved,
                            Verification::Mismatch {
                                record,
                                expected_size: rederived.command_size,
                            },
                        )
                    }
                } else {
                    (FinalState::Verified, Verification::Clean)
                }
            }
        };
        Ok(self.conclude(
            final_state,
            attempts,
            normalized,
            Some(signature),
            in_effect,
            verification,
        ))
    }

    fn conclude(
        &mut self,
        final_state: FinalState,
        attempts: Vec<RemediationAttempt>,
        normalized: Option<BufferGeometry>,
        signature: Option<FailureSignature>,
        in_effect: Option<InEffect>,
        verification: Verification,
    ) -> RemediationOutcome {
        self.enter(final_state.phase());
        let normalized_sizes = normalized.map(NormalizedSizes::from);
        let address_known = signature
            .as_ref()
            .is_some_and(FailureSignature::address_known);
        let normalized_geometry = normalized.filter(|_| address_known);
        let device = self.probe.map(|probe| probe.inspect());
        if let (FinalState::Verified, Some(report)) = (final_state, &device) {
            warn_unhealthy_device(report, in_effect);
        }
        info!("run finished: {final_state}");
        RemediationOutcome {
            final_state,
            attempts,
            normalized_geometry,
            normalized_sizes,
            signature,
            in_effect,
            verification,
            device,
            phases: self.phases.clone(),
        }
    }
}

fn warn_unhealthy_device(report: &DeviceReport, in_effect: Option<InEffect>) {
    if !report.node_present {
        warn!("run verified but no TPM device node is present");
    }
    let patched = in_effect.is_some_and(|effect| effect.strategy == StrategyKind::PersistentPatch);
    if patched && report.driver != DriverBinding::Patched {
        warn!("corrected driver in effect but the loaded driver is {}", report.driver);
    }
    if let Liveness::Failed { detail } = &report.liveness {
        warn!("TPM did not answer a capability query: {detail}");
    }
}

/// Walk strategies in priority order until one is in effect.
///
/// An already-active strategy is skipped without an attempt record and ends
/// the walk: it is the remediation in effect.
fn remediate<S: RemediationStrategy>(
    strategies: &mut [S],
) -> (Vec<RemediationAttempt>, Option<InEffect>) {
    let mut order: Vec<usize> = (0..strategies.len()).collect();
    order.sort_by_key(|&index| strategies[index].kind().priority());

    let mut attempts = Vec::new();
    for index in order {
        let strategy = &mut strategies[index];
        let kind = strategy.kind();
        if strategy.is_active() {
            info!("{kind} already active; skipping");
            return (
                attempts,
                Some(InEffect {
                    strategy: kind,
                    newly_applied: false,
                }),
            );
        }
        let pending = PendingAttempt::start(kind);
        if !strategy.is_available() {
            attempts.push(pending.finish(AttemptOutcome::Unavailable, "prerequisites missing on host"));
            continue;
        }
        match strategy.apply() {
            Ok(()) => {
                attempts.push(pending.finish(AttemptOutcome::Applied, "applied"));
                return (
                    attempts,
                    Some(InEffect {
                        strategy: kind,
                        newly_applied: true,
                    }),
                );
            }
            Err(StrategyError::Unavailable(detail)) => {
                attempts.push(pending.finish(AttemptOutcome::Unavailable, detail));
            }
            Err(err) => {
                attempts.push(pending.finish(AttemptOutcome::Failed, err.to_string()));
            }
        }
    }
    (attempts, None)
}
