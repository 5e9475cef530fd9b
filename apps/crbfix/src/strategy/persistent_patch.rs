// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Register the corrected CRB probe procedure as a DKMS-managed driver.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use crb_compliance::ProbeProcedure;
use log::{debug, info, warn};

use super::{RemediationStrategy, StrategyError, StrategyKind};
use crate::host::{module_loaded, CommandOutput, Host};

const DKMS: &str = "dkms";
const DKMS_CONF: &str = "dkms.conf";
const MANIFEST_FILE: &str = "procedure.manifest";
const MODULE_LOCATION: &str = "/kernel/drivers/char/tpm";

/// Install locations and identity of the corrected driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSettings {
    /// DKMS package name.
    pub dkms_name: String,
    /// DKMS package version.
    pub version: String,
    /// Kernel module name of the corrected driver.
    pub module_name: String,
    /// Root under which DKMS expects `<name>-<version>` source trees.
    pub source_root: PathBuf,
    /// Directory holding the corrected driver sources shipped with crbfix.
    pub module_source: PathBuf,
    /// modprobe options file carrying the workaround toggle.
    pub options_path: PathBuf,
    /// modules-load.d entry loading the corrected driver at boot.
    pub load_path: PathBuf,
    /// Toggle value written to the options file.
    pub workaround_enabled: bool,
}

/// Corrected probe procedure installed as a standing driver replacement.
pub struct PersistentPatch<'h, H: Host> {
    host: &'h H,
    settings: PatchSettings,
    procedure: ProbeProcedure,
}

impl<'h, H: Host> PersistentPatch<'h, H> {
    /// Prepare the strategy; nothing touches the host until [`apply`](RemediationStrategy::apply).
    pub fn new(host: &'h H, settings: PatchSettings) -> Self {
        Self {
            host,
            settings,
            procedure: ProbeProcedure::upstream().correct(),
        }
    }

    /// Corrected procedure this strategy installs.
    #[must_use]
    pub fn procedure(&self) -> &ProbeProcedure {
        &self.procedure
    }

    /// Settings in use.
    #[must_use]
    pub fn settings(&self) -> &PatchSettings {
        &self.settings
    }

    /// DKMS source tree for this package version.
    #[must_use]
    pub fn source_dir(&self) -> PathBuf {
        self.settings.source_root.join(format!(
            "{}-{}",
            self.settings.dkms_name, self.settings.version
        ))
    }

    /// Render the DKMS package descriptor.
    #[must_use]
    pub fn render_dkms_conf(&self) -> String {
        format!(
            "PACKAGE_NAME=\"{name}\"\n\
             PACKAGE_VERSION=\"{version}\"\n\
             BUILT_MODULE_NAME[0]=\"{module}\"\n\
             DEST_MODULE_LOCATION[0]=\"{location}\"\n\
             AUTOINSTALL=\"yes\"\n",
            name = self.settings.dkms_name,
            version = self.settings.version,
            module = self.settings.module_name,
            location = MODULE_LOCATION,
        )
    }

    /// Render the modprobe options line for the workaround toggle.
    #[must_use]
    pub fn render_options(&self) -> String {
        let param = self
            .procedure
            .workaround_param
            .as_ref()
            .map_or(crb_compliance::procedure::WORKAROUND_PARAM, |param| {
                param.name.as_str()
            });
        format!(
            "options {} {}={}\n",
            self.settings.module_name,
            param,
            u8::from(self.settings.workaround_enabled)
        )
    }

    fn dkms(&self, verb: &str) -> std::io::Result<CommandOutput> {
        self.host.run(
            DKMS,
            &[
                verb,
                "-m",
                self.settings.dkms_name.as_str(),
                "-v",
                self.settings.version.as_str(),
            ],
        )
    }

    fn registered(&self) -> bool {
        match self.dkms("status") {
            Ok(output) if output.success() => output
                .stdout
                .lines()
                .any(|line| line.contains(&self.settings.dkms_name) && line.contains("installed")),
            Ok(output) => {
                debug!("dkms status: {}", output.failure_detail());
                false
            }
            Err(err) => {
                debug!("dkms status: {err}");
                false
            }
        }
    }

    fn render_load_entry(&self) -> String {
        format!("{}\n", self.settings.module_name)
    }

    /// Returns `true` when `path` carries every line of `expected`.
    fn file_carries(&self, path: &Path, expected: &str) -> bool {
        let Ok(text) = self.host.read_to_string(path) else {
            debug!("{} unreadable", path.display());
            return false;
        };
        let present = expected
            .lines()
            .all(|wanted| text.lines().any(|line| line.trim() == wanted.trim()));
        if !present {
            debug!("{} lacks {:?}", path.display(), expected.trim());
        }
        present
    }

    fn autoload_registered(&self) -> bool {
        self.file_carries(&self.settings.options_path, &self.render_options())
            && self.file_carries(&self.settings.load_path, &self.render_load_entry())
    }

    fn installed_procedure(&self) -> Option<ProbeProcedure> {
        let path = self.source_dir().join(MANIFEST_FILE);
        let text = self.host.read_to_string(&path).ok()?;
        ProbeProcedure::parse_manifest(&text)
    }

    fn stage(&self) -> Result<(), StrategyError> {
        let build_failure = |what: &str, path: &Path, err: std::io::Error| {
            StrategyError::BuildFailure(format!("{what} {}: {err}", path.display()))
        };
        let source_dir = self.source_dir();
        let sources = self
            .host
            .list_dir(&self.settings.module_source)
            .map_err(|err| build_failure("read module sources", &self.settings.module_source, err))?;
        if sources.is_empty() {
            return Err(StrategyError::BuildFailure(format!(
                "no module sources in {}",
                self.settings.module_source.display()
            )));
        }
        self.host
            .create_dir_all(&source_dir)
            .map_err(|err| build_failure("create", &source_dir, err))?;
        for source in &sources {
            let Some(name) = source.file_name() else {
                continue;
            };
            let target = source_dir.join(name);
            self.host
                .copy_file(source, &target)
                .map_err(|err| build_failure("copy", &target, err))?;
        }
        let conf = source_dir.join(DKMS_CONF);
        self.host
            .write_file(&conf, &self.render_dkms_conf())
            .map_err(|err| build_failure("write", &conf, err))?;
        let manifest = source_dir.join(MANIFEST_FILE);
        self.host
            .write_file(&manifest, &self.procedure.render_manifest())
            .map_err(|err| build_failure("write", &manifest, err))?;
        info!(
            "staged {} source file(s) and procedure revision {} in {}",
            sources.len(),
            self.procedure.revision,
            source_dir.display()
        );
        Ok(())
    }

    fn run_step(
        &self,
        verb: &str,
        tolerate: Option<&str>,
        fail: fn(String) -> StrategyError,
    ) -> Result<(), StrategyError> {
        let output = self
            .dkms(verb)
            .map_err(|err| fail(format!("dkms {verb}: {err}")))?;
        if output.success() {
            info!("dkms {verb} {} ok", self.settings.dkms_name);
            return Ok(());
        }
        if let Some(marker) = tolerate {
            if output.stderr.contains(marker) || output.stdout.contains(marker) {
                debug!("dkms {verb}: {marker}; continuing");
                return Ok(());
            }
        }
        Err(fail(format!("dkms {verb}: {}", output.failure_detail())))
    }

    fn register_autoload(&self) -> Result<(), StrategyError> {
        let install_failure = |path: &Path, err: std::io::Error| {
            StrategyError::InstallFailure(format!("write {}: {err}", path.display()))
        };
        for (path, contents) in [
            (&self.settings.options_path, self.render_options()),
            (&self.settings.load_path, self.render_load_entry()),
        ] {
            if let Some(parent) = path.parent() {
                self.host
                    .create_dir_all(parent)
                    .map_err(|err| install_failure(parent, err))?;
            }
            self.host
                .write_file(path, &contents)
                .map_err(|err| install_failure(path, err))?;
        }
        Ok(())
    }

    fn load_module(&self) -> Result<(), StrategyError> {
        let module = self.settings.module_name.as_str();
        let output = self.host.run("modprobe", &[module]).map_err(|err| {
            StrategyError::InstallFailure(format!("modprobe {module}: {err}"))
        })?;
        if !output.success() {
            return Err(StrategyError::InstallFailure(format!(
                "modprobe {module}: {}",
                output.failure_detail()
            )));
        }
        info!("loaded {module}");
        Ok(())
    }
}

impl<H: Host> RemediationStrategy for PersistentPatch<'_, H> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PersistentPatch
    }

    /// In effect only when every install step landed: DKMS registration,
    /// the current procedure manifest, the options and autoload entries, and
    /// the loaded module. A half-finished `apply` reads as inactive.
    fn is_active(&self) -> bool {
        if !self.registered() {
            return false;
        }
        match self.installed_procedure() {
            Some(installed) if installed == self.procedure => {}
            Some(installed) => {
                warn!(
                    "{} registered with procedure revision {}; expected {}",
                    self.settings.dkms_name, installed.revision, self.procedure.revision
                );
                return false;
            }
            None => return false,
        }
        if !self.autoload_registered() {
            return false;
        }
        let loaded = module_loaded(self.host, &self.settings.module_name);
        if !loaded {
            debug!("{} installed but not loaded", self.settings.module_name);
        }
        loaded
    }

    fn is_available(&self) -> bool {
        self.host.find_program(DKMS).is_some()
    }

    fn apply(&mut self) -> Result<(), StrategyError> {
        self.stage()?;
        self.run_step("add", Some("already added"), StrategyError::BuildFailure)?;
        self.run_step("build", None, StrategyError::BuildFailure)?;
        self.run_step("install", None, StrategyError::InstallFailure)?;
        self.register_autoload()?;
        self.load_module()
    }
}
