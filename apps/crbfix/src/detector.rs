// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Recognise the CRB overlapping-buffer defect signature in kernel logs.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Kernel log scraping for the CRB overlapping-buffer defect.
//!
//! Log text is an untyped channel: anything that does not match degrades to
//! "no signature" rather than an error.

use std::collections::VecDeque;
use std::sync::OnceLock;

use crb_compliance::BufferGeometry;
use regex::Regex;
use serde::Serialize;

/// Phrase the CRB driver logs when overlapping buffer sizes differ.
pub const OVERLAP_PHRASE: &str = "overlapping command and response buffer sizes are not identical";
/// Prefix of the record logged by the corrected probe procedure.
pub const WORKAROUND_MARKER: &str = "buffer size mismatch";
/// Driver whose probe failures are attributed to the defect.
pub const DEFAULT_DRIVER: &str = "tpm_crb";

const CONTEXT_LINES: usize = 2;
/// Overlap phrase and probe failure must be logged at most this many lines apart.
pub const PAIRING_WINDOW: usize = 8;

fn probe_of_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"probe of (\S+) failed with error (-?\d+)").expect("static probe regex")
    })
}

fn probe_with_driver_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\S+): probe with driver \S+ failed with error (-?\d+)")
            .expect("static probe regex")
    })
}

fn firmware_bug_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\S+): \[Firmware Bug\]").expect("static firmware regex"))
}

fn field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(cmd_size|rsp_size|cmd_pa|rsp_pa|cmd|rsp)=(0x[0-9a-fA-F]+|\d+)")
            .expect("static field regex")
    })
}

fn workaround_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"buffer size mismatch.*?\bcmd=(\d+).*?\brsp=(\d+).*?using max=(\d+)")
            .expect("static workaround regex")
    })
}

/// Defect signature extracted from log text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureSignature {
    /// Always `true` for a produced signature.
    pub detected: bool,
    /// Device identifier from the probe failure, e.g. `MSFT0101:00`.
    pub device_id: Option<String>,
    /// Errno reported by the probe failure.
    pub probe_error: Option<i32>,
    /// Command buffer size, when logged.
    pub reported_command_size: Option<u32>,
    /// Response buffer size, when logged.
    pub reported_response_size: Option<u32>,
    /// Command buffer physical address, when logged.
    pub command_address: Option<u64>,
    /// Response buffer physical address, when logged.
    pub response_address: Option<u64>,
}

impl FailureSignature {
    /// Address of the shared window.
    ///
    /// The overlap marker already establishes that both buffers share one
    /// address; when the log omits it the window is recorded at `0`.
    #[must_use]
    pub fn shared_address(&self) -> u64 {
        self.command_address
            .or(self.response_address)
            .unwrap_or_default()
    }

    /// Returns `true` when the log carried either buffer address.
    #[must_use]
    pub fn address_known(&self) -> bool {
        self.command_address.is_some() || self.response_address.is_some()
    }

    /// Reported geometry when both sizes were present in the log context.
    #[must_use]
    pub fn reported_geometry(&self) -> Option<BufferGeometry> {
        let command_size = self.reported_command_size?;
        let response_size = self.reported_response_size?;
        let shared = self.shared_address();
        Some(BufferGeometry::new(
            self.command_address.unwrap_or(shared),
            self.response_address.unwrap_or(shared),
            command_size,
            response_size,
        ))
    }

    fn merge(&mut self, fields: &Fields) {
        self.reported_command_size = self.reported_command_size.or(fields.command_size);
        self.reported_response_size = self.reported_response_size.or(fields.response_size);
        self.command_address = self.command_address.or(fields.command_address);
        self.response_address = self.response_address.or(fields.response_address);
    }
}

/// Decision announced by the corrected probe procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkaroundRecord {
    /// Command buffer size reported by the firmware.
    pub command_size: u32,
    /// Response buffer size reported by the firmware.
    pub response_size: u32,
    /// Size the procedure applied to both buffers.
    pub normalized_size: u32,
}

impl WorkaroundRecord {
    /// Geometry the firmware reported, placed at `address`.
    #[must_use]
    pub fn reported_geometry(&self, address: u64) -> BufferGeometry {
        BufferGeometry::overlapping(address, self.command_size, self.response_size)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Fields {
    command_size: Option<u32>,
    response_size: Option<u32>,
    command_address: Option<u64>,
    response_address: Option<u64>,
}

fn parse_number(value: &str) -> Option<u64> {
    match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn extract_fields(line: &str) -> Fields {
    let mut fields = Fields::default();
    for caps in field_regex().captures_iter(line) {
        let Some(value) = parse_number(&caps[2]) else {
            continue;
        };
        let size = u32::try_from(value).ok();
        match &caps[1] {
            "cmd_size" | "cmd" => fields.command_size = fields.command_size.or(size),
            "rsp_size" | "rsp" => fields.response_size = fields.response_size.or(size),
            "cmd_pa" => fields.command_address = fields.command_address.or(Some(value)),
            "rsp_pa" => fields.response_address = fields.response_address.or(Some(value)),
            _ => {}
        }
    }
    fields
}

#[derive(Debug, Clone)]
struct ProbeFailure {
    device_id: String,
    error: Option<i32>,
}

/// Scanner for the defect signature and the corrected procedure's records.
#[derive(Debug, Clone)]
pub struct FailureDetector {
    driver: String,
}

impl Default for FailureDetector {
    fn default() -> Self {
        Self::new(DEFAULT_DRIVER)
    }
}

impl FailureDetector {
    /// Attribute probe failures logged for `driver` to the defect.
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
        }
    }

    /// Driver name used to filter probe failures.
    #[must_use]
    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Lazily yield every signature found in `lines`.
    pub fn matches<I, S>(&self, lines: I) -> Matches<'_, I::IntoIter>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Matches {
            detector: self,
            lines: lines.into_iter(),
            recent: VecDeque::with_capacity(CONTEXT_LINES),
            seen: 0,
            pending: None,
            pending_at: 0,
            probe: None,
            probe_at: 0,
        }
    }

    /// First signature in `lines`, if any.
    pub fn scan<I, S>(&self, lines: I) -> Option<FailureSignature>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.matches(lines).next()
    }

    /// Most recent corrected-procedure record in `lines`, if any.
    pub fn last_workaround<I, S>(&self, lines: I) -> Option<WorkaroundRecord>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        lines
            .into_iter()
            .filter_map(|line| parse_workaround(line.as_ref()))
            .last()
    }

    fn probe_failure(&self, line: &str) -> Option<ProbeFailure> {
        if !line.contains(self.driver.as_str()) {
            return None;
        }
        let caps = probe_of_regex()
            .captures(line)
            .or_else(|| probe_with_driver_regex().captures(line))?;
        Some(ProbeFailure {
            device_id: caps[1].to_owned(),
            error: caps[2].parse().ok(),
        })
    }
}

fn parse_workaround(line: &str) -> Option<WorkaroundRecord> {
    if !line.contains(WORKAROUND_MARKER) {
        return None;
    }
    let caps = workaround_regex().captures(line)?;
    Some(WorkaroundRecord {
        command_size: caps[1].parse().ok()?,
        response_size: caps[2].parse().ok()?,
        normalized_size: caps[3].parse().ok()?,
    })
}

/// Lazy signature matches over a single pass of a log stream.
///
/// An overlap phrase and a probe failure pair only within [`PAIRING_WINDOW`]
/// lines of each other.
pub struct Matches<'d, I> {
    detector: &'d FailureDetector,
    lines: I,
    recent: VecDeque<Fields>,
    seen: usize,
    pending: Option<FailureSignature>,
    pending_at: usize,
    probe: Option<ProbeFailure>,
    probe_at: usize,
}

fn expire<T>(slot: &mut Option<T>, logged_at: usize, now: usize, what: &str) {
    if slot.is_some() && now - logged_at > PAIRING_WINDOW {
        log::debug!("dropping unpaired {what} logged {} lines earlier", now - logged_at);
        *slot = None;
    }
}

impl<I, S> Iterator for Matches<'_, I>
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    type Item = FailureSignature;

    fn next(&mut self) -> Option<Self::Item> {
        for line in self.lines.by_ref() {
            let line = line.as_ref();
            let fields = extract_fields(line);
            self.seen += 1;
            expire(&mut self.probe, self.probe_at, self.seen, "probe failure");
            expire(&mut self.pending, self.pending_at, self.seen, "overlap report");

            if line.contains(OVERLAP_PHRASE) {
                self.pending_at = self.seen;
                let signature = self.pending.get_or_insert_with(|| FailureSignature {
                    detected: true,
                    device_id: firmware_bug_regex()
                        .captures(line)
                        .map(|caps| caps[1].to_owned()),
                    ..FailureSignature::default()
                });
                signature.merge(&fields);
                for before in &self.recent {
                    signature.merge(before);
                }
            } else if let Some(signature) = self.pending.as_mut() {
                signature.merge(&fields);
            }

            if let Some(probe) = self.detector.probe_failure(line) {
                self.probe = Some(probe);
                self.probe_at = self.seen;
            }

            if self.recent.len() == CONTEXT_LINES {
                self.recent.pop_front();
            }
            self.recent.push_back(fields);

            if self.pending.is_some() && self.probe.is_some() {
                let mut signature = self.pending.take()?;
                let probe = self.probe.take()?;
                signature.device_id = Some(probe.device_id);
                signature.probe_error = probe.error;
                self.recent.clear();
                return Some(signature);
            }
        }
        None
    }
}
