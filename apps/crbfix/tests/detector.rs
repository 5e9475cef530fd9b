// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate CRB defect signature recognition against kernel log excerpts.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use crb_compliance::BufferGeometry;
use crbfix::detector::{FailureDetector, WorkaroundRecord, PAIRING_WINDOW};

const FIRMWARE_BUG: &str = "[    1.204311] tpm_crb STM0176:00: [Firmware Bug]: overlapping command and response buffer sizes are not identical";
const PROBE_OF: &str = "[    1.204390] tpm_crb: probe of STM0176:00 failed with error -22";
const PROBE_WITH_DRIVER: &str =
    "[    1.204390] tpm_crb STM0176:00: probe with driver tpm_crb failed with error -22";
const GEOMETRY: &str = "[    1.204280] tpm_crb STM0176:00: cmd_pa=0xfed40080 rsp_pa=0xfed40080 cmd_size=4096 rsp_size=4095";

#[test]
fn signature_without_numbers_still_detects() {
    let lines = ["[    0.000000] Linux version 6.8.0", FIRMWARE_BUG, PROBE_OF];
    let signature = FailureDetector::default()
        .scan(lines)
        .expect("signature");
    assert!(signature.detected);
    assert_eq!(signature.device_id.as_deref(), Some("STM0176:00"));
    assert_eq!(signature.probe_error, Some(-22));
    assert_eq!(signature.reported_command_size, None);
    assert_eq!(signature.reported_geometry(), None);
}

#[test]
fn preceding_context_supplies_geometry() {
    let lines = [GEOMETRY, FIRMWARE_BUG, PROBE_WITH_DRIVER];
    let signature = FailureDetector::default()
        .scan(lines)
        .expect("signature");
    assert_eq!(signature.reported_command_size, Some(4096));
    assert_eq!(signature.reported_response_size, Some(4095));
    assert_eq!(
        signature.reported_geometry(),
        Some(BufferGeometry::overlapping(0xfed4_0080, 4096, 4095))
    );
}

#[test]
fn probe_marker_may_precede_overlap_phrase() {
    let signature = FailureDetector::default()
        .scan([PROBE_OF, FIRMWARE_BUG])
        .expect("signature");
    assert_eq!(signature.device_id.as_deref(), Some("STM0176:00"));
}

#[test]
fn overlap_phrase_alone_is_not_a_signature() {
    assert!(FailureDetector::default().scan([FIRMWARE_BUG]).is_none());
    assert!(FailureDetector::default().scan([PROBE_OF]).is_none());
}

#[test]
fn matching_is_case_sensitive() {
    let shouted = FIRMWARE_BUG.to_uppercase();
    assert!(FailureDetector::default()
        .scan([shouted.as_str(), PROBE_OF])
        .is_none());
}

#[test]
fn probe_failures_of_other_drivers_are_ignored() {
    let other = "[    1.300000] tpm_tis: probe of MSFT0101:00 failed with error -19";
    assert!(FailureDetector::default()
        .scan([FIRMWARE_BUG, other])
        .is_none());
    let custom = FailureDetector::new("tpm_tis");
    assert!(custom.scan([FIRMWARE_BUG, other]).is_some());
}

fn with_filler(head: &str, filler: usize, tail: &[&str]) -> Vec<String> {
    let mut lines = vec![head.to_owned()];
    lines.extend((0..filler).map(|n| format!("[    1.{n:06}] pci 0000:00:1f.{n}: enabling device")));
    lines.extend(tail.iter().map(|line| (*line).to_owned()));
    lines
}

#[test]
fn stale_failure_marker_is_not_paired_with_later_overlap() {
    let stale = "[    0.900000] tpm_crb: probe of MSFT0101:00 failed with error -19";
    let lines = with_filler(stale, 20, &[FIRMWARE_BUG, PROBE_OF]);
    let signature = FailureDetector::default()
        .scan(lines.iter())
        .expect("signature");
    assert_eq!(signature.device_id.as_deref(), Some("STM0176:00"));
    assert_eq!(signature.probe_error, Some(-22));

    let lines = with_filler(stale, 20, &[FIRMWARE_BUG]);
    assert!(FailureDetector::default().scan(lines.iter()).is_none());
}

#[test]
fn pairing_window_bounds_both_orders() {
    let near = with_filler(PROBE_OF, PAIRING_WINDOW - 1, &[FIRMWARE_BUG]);
    assert!(FailureDetector::default().scan(near.iter()).is_some());
    let far = with_filler(PROBE_OF, PAIRING_WINDOW, &[FIRMWARE_BUG]);
    assert!(FailureDetector::default().scan(far.iter()).is_none());
    let overlap_first = with_filler(FIRMWARE_BUG, PAIRING_WINDOW, &[PROBE_OF]);
    assert!(FailureDetector::default().scan(overlap_first.iter()).is_none());
}

#[test]
fn matches_yields_each_signature_once() {
    let lines = vec![
        FIRMWARE_BUG.to_owned(),
        PROBE_OF.to_owned(),
        "[   12.000000] usb 1-1: new high-speed USB device".to_owned(),
        FIRMWARE_BUG.to_owned(),
        PROBE_WITH_DRIVER.to_owned(),
    ];
    let detector = FailureDetector::default();
    assert_eq!(detector.matches(lines.iter()).count(), 2);
}

#[test]
fn last_workaround_returns_most_recent_record() {
    let lines = [
        "[    2.000000] tpm_crb_patched MSFT0101:00: buffer size mismatch cmd=4096 rsp=4095 using max=4096",
        "[    3.000000] tpm_crb_patched MSFT0101:00: buffer size mismatch cmd=3968 rsp=4096 using max=4096",
    ];
    let record = FailureDetector::default()
        .last_workaround(lines)
        .expect("record");
    assert_eq!(
        record,
        WorkaroundRecord {
            command_size: 3968,
            response_size: 4096,
            normalized_size: 4096,
        }
    );
    assert_eq!(
        record.reported_geometry(0x1000),
        BufferGeometry::overlapping(0x1000, 3968, 4096)
    );
}
