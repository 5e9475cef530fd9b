// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Exercise remediation strategies and device inspection against a sandboxed host.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crb_compliance::ProbeProcedure;
use crbfix::config::CrbfixConfig;
use crbfix::detector::FailureDetector;
use crbfix::device::{DeviceProbe, DriverBinding, HostDeviceProbe, Liveness};
use crbfix::host::{module_path, CommandOutput, Host};
use crbfix::logs::{LogSource, LogSourceError};
use crbfix::orchestrator::{AttemptOutcome, FinalState, Orchestrator};
use crbfix::strategy::{
    default_strategies, DeviceExclusion, PersistentPatch, RemediationStrategy, StrategyError,
    StrategyKind,
};
use tempfile::TempDir;

const DKMS_ARGS: &str = "-m tpm-crb-patched -v 1.0";

/// Host whose filesystem is rooted in a temporary directory.
struct StubHost {
    root: TempDir,
    privileged: bool,
    has_dkms: bool,
    tools: Vec<String>,
    scripted: HashMap<String, CommandOutput>,
    calls: RefCell<Vec<String>>,
    read_only: RefCell<Vec<PathBuf>>,
}

impl StubHost {
    fn new() -> Self {
        Self {
            root: TempDir::new().expect("tempdir"),
            privileged: true,
            has_dkms: true,
            tools: Vec::new(),
            scripted: HashMap::new(),
            calls: RefCell::new(Vec::new()),
            read_only: RefCell::new(Vec::new()),
        }
    }

    fn read_only(self, prefix: &str) -> Self {
        self.read_only.borrow_mut().push(PathBuf::from(prefix));
        self
    }

    fn remount_writable(&self) {
        self.read_only.borrow_mut().clear();
    }

    fn guard(&self, path: &Path) -> io::Result<()> {
        if self.read_only.borrow().iter().any(|prefix| path.starts_with(prefix)) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only file system"));
        }
        Ok(())
    }

    fn with_tool(mut self, name: &str) -> Self {
        self.tools.push(name.to_owned());
        self
    }

    fn touch(self, path: &str) -> Self {
        let real = self.real(path);
        if let Some(parent) = real.parent() {
            fs::create_dir_all(parent).expect("parent dir");
        }
        fs::write(real, "").expect("touch");
        self
    }

    fn load_module(self, name: &str) -> Self {
        fs::create_dir_all(self.real(module_path(name))).expect("module dir");
        self
    }

    fn with_module_sources(self) -> Self {
        let dir = self.real("/usr/share/crbfix/tpm_crb_patched");
        fs::create_dir_all(&dir).expect("module dir");
        fs::write(dir.join("Makefile"), "obj-m += tpm_crb_patched.o\n").expect("makefile");
        fs::write(dir.join("tpm_crb_patched.c"), "/* corrected probe */\n").expect("source");
        self
    }

    fn script(mut self, command: &str, output: CommandOutput) -> Self {
        self.scripted.insert(command.to_owned(), output);
        self
    }

    fn real(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        let relative = path.strip_prefix("/").unwrap_or(path);
        self.root.path().join(relative)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn read(&self, path: &str) -> String {
        fs::read_to_string(self.real(path)).expect("read sandbox file")
    }
}

impl Host for StubHost {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.borrow_mut().push(line.clone());
        let output = self
            .scripted
            .get(&line)
            .cloned()
            .unwrap_or_else(|| CommandOutput::ok(""));
        if program == "modprobe" && output.success() {
            if let Some(module) = args.first() {
                fs::create_dir_all(self.real(module_path(module)))?;
            }
        }
        Ok(output)
    }

    fn find_program(&self, name: &str) -> Option<PathBuf> {
        if name == "dkms" {
            return self.has_dkms.then(|| PathBuf::from("/usr/sbin/dkms"));
        }
        self.tools
            .iter()
            .any(|tool| tool == name)
            .then(|| Path::new("/usr/bin").join(name))
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(self.real(path))
    }

    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        self.guard(path)?;
        fs::write(self.real(path), contents)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.guard(path)?;
        fs::create_dir_all(self.real(path))
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.real(path))? {
            entries.push(path.join(entry?.file_name()));
        }
        entries.sort();
        Ok(entries)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.guard(to)?;
        fs::copy(self.real(from), self.real(to)).map(|_| ())
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.real(path).exists()
    }
}

fn patch(host: &StubHost) -> PersistentPatch<'_, StubHost> {
    PersistentPatch::new(host, CrbfixConfig::default().patch_settings())
}

fn exclusion(host: &StubHost) -> DeviceExclusion<'_, StubHost> {
    DeviceExclusion::new(host, CrbfixConfig::default().exclusion_settings())
}

fn dkms(verb: &str) -> String {
    format!("dkms {verb} {DKMS_ARGS}")
}

fn dkms_reports_installed(host: StubHost) -> StubHost {
    host.script(
        &dkms("status"),
        CommandOutput::ok("tpm-crb-patched/1.0, 6.8.0-45-generic, x86_64: installed\n"),
    )
}

/// Kernel log replaying the defect at every detection pass.
struct RecurringDefectLog {
    reads: usize,
}

impl LogSource for RecurringDefectLog {
    fn describe(&self) -> String {
        "recurring".to_owned()
    }

    fn read(&mut self) -> Result<Vec<String>, LogSourceError> {
        self.reads += 1;
        if self.reads % 2 == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![
            "tpm_crb MSFT0101:00: [Firmware Bug]: overlapping command and response buffer sizes are not identical".to_owned(),
            "tpm_crb: probe of MSFT0101:00 failed with error -22".to_owned(),
        ])
    }
}

#[test]
fn persistent_patch_stages_builds_and_loads() {
    let host = StubHost::new().with_module_sources();
    let mut strategy = patch(&host);
    assert!(strategy.is_available());
    strategy.apply().expect("apply");

    assert_eq!(
        host.calls(),
        vec![
            dkms("add"),
            dkms("build"),
            dkms("install"),
            "modprobe tpm_crb_patched".to_owned(),
        ]
    );
    let conf = host.read("/usr/src/tpm-crb-patched-1.0/dkms.conf");
    assert!(conf.contains("PACKAGE_NAME=\"tpm-crb-patched\""));
    assert!(conf.contains("BUILT_MODULE_NAME[0]=\"tpm_crb_patched\""));
    assert_eq!(
        host.read("/usr/src/tpm-crb-patched-1.0/tpm_crb_patched.c"),
        "/* corrected probe */\n"
    );
    let manifest = host.read("/usr/src/tpm-crb-patched-1.0/procedure.manifest");
    assert_eq!(
        ProbeProcedure::parse_manifest(&manifest),
        Some(ProbeProcedure::upstream().correct())
    );
    assert_eq!(
        host.read("/etc/modprobe.d/tpm-crb-patched.conf"),
        "options tpm_crb_patched enable_workaround=1\n"
    );
    assert_eq!(
        host.read("/etc/modules-load.d/tpm-crb-patched.conf"),
        "tpm_crb_patched\n"
    );
}

#[test]
fn persistent_patch_is_active_only_with_current_procedure() {
    let host = dkms_reports_installed(StubHost::new().with_module_sources());
    let mut strategy = patch(&host);
    assert!(!strategy.is_active());
    strategy.apply().expect("apply");
    assert!(strategy.is_active());

    fs::write(
        host.real(Path::new("/usr/src/tpm-crb-patched-1.0/procedure.manifest")),
        ProbeProcedure::upstream().render_manifest(),
    )
    .expect("downgrade manifest");
    assert!(!strategy.is_active());
}

#[test]
fn persistent_patch_unavailable_without_dkms() {
    let mut host = StubHost::new();
    host.has_dkms = false;
    assert!(!patch(&host).is_available());
}

#[test]
fn build_failure_stops_before_install() {
    let host = StubHost::new().with_module_sources().script(
        &dkms("build"),
        CommandOutput::failed(10, "Error! Bad return status for module build on kernel: 6.8.0"),
    );
    let err = patch(&host).apply().expect_err("build failure");
    assert!(matches!(err, StrategyError::BuildFailure(ref detail) if detail.contains("exit 10")));
    assert!(!host.calls().contains(&dkms("install")));
    assert!(!host.real(Path::new("/etc/modprobe.d/tpm-crb-patched.conf")).exists());
}

#[test]
fn missing_module_sources_is_a_build_failure() {
    let host = StubHost::new();
    let err = patch(&host).apply().expect_err("no sources");
    assert!(matches!(err, StrategyError::BuildFailure(_)));
    assert!(host.calls().is_empty());
}

#[test]
fn already_added_package_is_tolerated() {
    let host = StubHost::new().with_module_sources().script(
        &dkms("add"),
        CommandOutput::failed(3, "Error! DKMS tree already contains: tpm-crb-patched-1.0\nYou cannot add the same module/version combo more than once.\nalready added"),
    );
    patch(&host).apply().expect("apply");
}

#[test]
fn modprobe_failure_is_an_install_failure() {
    let host = StubHost::new().with_module_sources().script(
        "modprobe tpm_crb_patched",
        CommandOutput::failed(1, "modprobe: ERROR: could not insert 'tpm_crb_patched': No such device"),
    );
    let err = patch(&host).apply().expect_err("install failure");
    assert!(matches!(err, StrategyError::InstallFailure(_)));
}

#[test]
fn install_interrupted_before_autoload_stays_inactive() {
    let host = dkms_reports_installed(StubHost::new().with_module_sources())
        .read_only("/etc/modules-load.d");
    let mut strategy = patch(&host);
    let err = strategy.apply().expect_err("autoload write");
    assert!(matches!(err, StrategyError::InstallFailure(ref detail) if detail.contains("modules-load.d")));
    assert!(host.calls().contains(&dkms("install")));
    assert!(!host.calls().contains(&"modprobe tpm_crb_patched".to_owned()));
    assert!(!strategy.is_active());

    host.remount_writable();
    strategy.apply().expect("retry");
    assert!(strategy.is_active());
}

#[test]
fn installed_but_unloaded_module_stays_inactive() {
    let host = dkms_reports_installed(StubHost::new().with_module_sources()).script(
        "modprobe tpm_crb_patched",
        CommandOutput::failed(1, "modprobe: ERROR: could not insert 'tpm_crb_patched': No such device"),
    );
    let mut strategy = patch(&host);
    strategy.apply().expect_err("modprobe");
    assert_eq!(
        host.read("/etc/modules-load.d/tpm-crb-patched.conf"),
        "tpm_crb_patched\n"
    );
    assert!(!strategy.is_active());
}

#[test]
fn changed_workaround_toggle_reads_inactive() {
    let host = dkms_reports_installed(StubHost::new().with_module_sources());
    patch(&host).apply().expect("apply");
    assert!(patch(&host).is_active());

    let mut config = CrbfixConfig::default();
    config.patch.workaround_enabled = false;
    let mut disabled = PersistentPatch::new(&host, config.patch_settings());
    assert!(!disabled.is_active());
    disabled.apply().expect("reapply");
    assert!(disabled.is_active());
    assert!(!patch(&host).is_active());
}

#[test]
fn rerun_after_partial_install_reapplies_patch() {
    let host = dkms_reports_installed(StubHost::new().with_module_sources())
        .read_only("/etc/modules-load.d");
    let config = CrbfixConfig::default();
    let mut logs = RecurringDefectLog { reads: 0 };

    let mut strategies = default_strategies(&host, &config);
    let first = Orchestrator::new(&mut logs, FailureDetector::default())
        .run(&mut strategies)
        .expect("first run");
    assert_eq!(first.final_state, FinalState::DegradedFallback);
    assert_eq!(first.attempts[0].outcome(), AttemptOutcome::Failed);

    host.remount_writable();
    let mut strategies = default_strategies(&host, &config);
    let second = Orchestrator::new(&mut logs, FailureDetector::default())
        .run(&mut strategies)
        .expect("second run");
    assert_eq!(second.final_state, FinalState::Verified);
    assert_eq!(second.attempts.len(), 1);
    assert_eq!(second.attempts[0].strategy(), StrategyKind::PersistentPatch);
    assert_eq!(second.attempts[0].outcome(), AttemptOutcome::Applied);
    assert_eq!(
        host.calls()
            .iter()
            .filter(|call| call.as_str() == "modprobe tpm_crb_patched")
            .count(),
        1
    );
}

#[test]
fn disabled_workaround_is_written_to_options() {
    let host = StubHost::new().with_module_sources();
    let mut config = CrbfixConfig::default();
    config.patch.workaround_enabled = false;
    PersistentPatch::new(&host, config.patch_settings())
        .apply()
        .expect("apply");
    assert_eq!(
        host.read("/etc/modprobe.d/tpm-crb-patched.conf"),
        "options tpm_crb_patched enable_workaround=0\n"
    );
}

#[test]
fn exclusion_requires_privilege() {
    let mut host = StubHost::new();
    host.privileged = false;
    let mut strategy = exclusion(&host);
    assert!(strategy.is_available());
    let err = strategy.apply().expect_err("unprivileged");
    assert!(matches!(err, StrategyError::PermissionDenied(_)));
    assert!(!strategy.is_active());
}

#[test]
fn exclusion_writes_denylist_entry() {
    let host = StubHost::new();
    let mut strategy = exclusion(&host);
    assert!(!strategy.is_active());
    strategy.apply().expect("apply");
    assert!(strategy.is_active());
    let denylist = host.read("/etc/modprobe.d/blacklist-tpm-crb.conf");
    assert!(denylist.lines().any(|line| line == "blacklist tpm_crb"));
    assert!(host.calls().is_empty());
}

#[test]
fn default_strategies_follow_priority() {
    let host = StubHost::new();
    let strategies = default_strategies(&host, &CrbfixConfig::default());
    let kinds: Vec<_> = strategies.iter().map(|strategy| strategy.kind()).collect();
    assert_eq!(kinds, StrategyKind::PRIORITY.to_vec());
}

#[test]
fn device_without_getcap_reports_tool_missing() {
    let host = StubHost::new().touch("/dev/tpm0").load_module("tpm_crb");
    let report = HostDeviceProbe::new(&host, &CrbfixConfig::default()).inspect();
    assert!(report.node_present);
    assert_eq!(report.driver, DriverBinding::Default);
    assert_eq!(report.liveness, Liveness::ToolMissing);
    assert!(host.calls().is_empty());
}

#[test]
fn patched_device_answering_getcap_is_responding() {
    let host = StubHost::new()
        .touch("/dev/tpmrm0")
        .load_module("tpm_crb_patched")
        .with_tool("tpm2_getcap");
    let report = HostDeviceProbe::new(&host, &CrbfixConfig::default()).inspect();
    assert_eq!(report.driver, DriverBinding::Patched);
    assert_eq!(report.liveness, Liveness::Responding);
    assert_eq!(host.calls(), vec!["tpm2_getcap properties-fixed"]);
}

#[test]
fn getcap_failure_is_reported_with_detail() {
    let host = StubHost::new()
        .touch("/dev/tpm0")
        .load_module("tpm_crb_patched")
        .with_tool("tpm2_getcap")
        .script(
            "tpm2_getcap properties-fixed",
            CommandOutput::failed(1, "ERROR:esys:src/tss2-esys/api/Esys_GetCapability.c:307"),
        );
    let report = HostDeviceProbe::new(&host, &CrbfixConfig::default()).inspect();
    match report.liveness {
        Liveness::Failed { detail } => assert!(detail.starts_with("exit 1: ERROR:esys")),
        other => panic!("unexpected liveness {other:?}"),
    }
}

#[test]
fn missing_node_skips_getcap() {
    let host = StubHost::new().with_tool("tpm2_getcap");
    let report = HostDeviceProbe::new(&host, &CrbfixConfig::default()).inspect();
    assert!(!report.node_present);
    assert_eq!(report.driver, DriverBinding::Absent);
    assert_eq!(report.liveness, Liveness::NoDevice);

    let mut config = CrbfixConfig::default();
    config.device.liveness_check = false;
    let host = StubHost::new().touch("/dev/tpm0").with_tool("tpm2_getcap");
    let report = HostDeviceProbe::new(&host, &config).inspect();
    assert_eq!(report.liveness, Liveness::Skipped);
    assert!(host.calls().is_empty());
}

#[test]
fn patch_run_records_loaded_driver() {
    let host = StubHost::new().with_module_sources().touch("/dev/tpm0");
    let config = CrbfixConfig::default();
    let probe = HostDeviceProbe::new(&host, &config);
    let mut logs = RecurringDefectLog { reads: 0 };
    let mut strategies = default_strategies(&host, &config);
    let outcome = Orchestrator::new(&mut logs, FailureDetector::default())
        .with_device_probe(&probe)
        .run(&mut strategies)
        .expect("run");
    assert_eq!(outcome.final_state, FinalState::Verified);
    let device = outcome.device.expect("device report");
    assert_eq!(device.driver, DriverBinding::Patched);
    assert_eq!(device.liveness, Liveness::ToolMissing);
}
