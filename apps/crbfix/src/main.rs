// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for crbfix.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for crbfix.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crb_compliance::{normalize, BufferGeometry};
use env_logger::Env;
use log::LevelFilter;
use serde::Serialize;

use crbfix::config::{resolve_config, CrbfixConfig, LogSourceKind};
use crbfix::logs::{DmesgLog, FileLog, LogSource};
use crbfix::device::{DeviceProbe, DeviceReport, HostDeviceProbe};
use crbfix::orchestrator::{Orchestrator, EXIT_ABORTED, EXIT_UNRESOLVED, EXIT_VERIFIED};
use crbfix::strategy::{default_strategies, RemediationStrategy, StrategyKind};
use crbfix::{summarize, FailureDetector, FailureSignature, Host, SystemHost};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// crbfix command-line arguments.
#[derive(Debug, Parser)]
#[command(
    author = "Lukas Bower",
    version,
    about = "Detect and remediate TPM CRB overlapping buffer size mismatches",
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $CRBFIX_CONFIG, then /etc/crbfix/crbfix.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Enable debug logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Detect, remediate and verify.
    Run(RunArgs),
    /// Scan kernel logs for the defect signature only.
    Detect(LogArgs),
    /// Normalize a reported buffer geometry.
    Normalize(NormalizeArgs),
    /// Report which strategies are active or available.
    Status,
}

#[derive(Debug, Args)]
struct LogArgs {
    /// Read kernel log lines from a file instead of dmesg.
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    logs: LogArgs,

    /// Install the corrected driver with the workaround parameter disabled.
    #[arg(long)]
    no_workaround: bool,
}

#[derive(Debug, Args)]
struct NormalizeArgs {
    /// Command buffer physical address.
    #[arg(long, value_parser = parse_u64)]
    cmd_addr: u64,
    /// Response buffer physical address.
    #[arg(long, value_parser = parse_u64)]
    rsp_addr: u64,
    /// Command buffer size.
    #[arg(long, value_parser = parse_u32)]
    cmd_size: u32,
    /// Response buffer size.
    #[arg(long, value_parser = parse_u32)]
    rsp_size: u32,
}

fn parse_u64(value: &str) -> Result<u64, String> {
    let trimmed = value.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|err| format!("invalid number {value:?}: {err}"))
}

fn parse_u32(value: &str) -> Result<u32, String> {
    let wide = parse_u64(value)?;
    u32::try_from(wide).map_err(|_| format!("{value} does not fit in 32 bits"))
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let result = dispatch(cli);
    if let Err(err) = &result {
        log::error!("{err:#}");
        eprintln!("crbfix: {err:#}");
    }
    ExitCode::from(exit_status(&result))
}

/// Map a command result onto the process exit status.
fn exit_status(result: &Result<u8>) -> u8 {
    match result {
        Ok(code) => *code,
        Err(_) => EXIT_ABORTED,
    }
}

fn dispatch(cli: Cli) -> Result<u8> {
    let mut config = resolve_config(cli.config.as_deref()).context("load configuration")?;
    let host = SystemHost;
    match cli.command {
        Command::Run(args) => {
            apply_log_override(&mut config, &args.logs);
            if args.no_workaround {
                config.patch.workaround_enabled = false;
            }
            run_remediation(&host, &config, cli.format)
        }
        Command::Detect(args) => {
            apply_log_override(&mut config, &args);
            run_detect(&host, &config, cli.format)
        }
        Command::Normalize(args) => run_normalize(&args, cli.format),
        Command::Status => run_status(&host, &config, cli.format),
    }
}

fn apply_log_override(config: &mut CrbfixConfig, args: &LogArgs) {
    if let Some(path) = &args.log_file {
        config.logs.source = LogSourceKind::File;
        config.logs.path = Some(path.clone());
    }
}

fn open_log_source<'h, H: Host>(host: &'h H, config: &CrbfixConfig) -> Result<Box<dyn LogSource + 'h>> {
    match config.logs.source {
        LogSourceKind::Dmesg => Ok(Box::new(DmesgLog::new(host))),
        LogSourceKind::File => {
            let path = config
                .logs
                .path
                .as_ref()
                .ok_or_else(|| anyhow!("[logs] source = \"file\" requires path"))?;
            Ok(Box::new(FileLog::new(host, path)))
        }
    }
}

fn run_remediation<H: Host>(host: &H, config: &CrbfixConfig, format: OutputFormat) -> Result<u8> {
    let mut logs = open_log_source(host, config)?;
    let probe = HostDeviceProbe::new(host, config);
    let mut strategies = default_strategies(host, config);
    let mut orchestrator = Orchestrator::new(logs.as_mut(), FailureDetector::new(&config.driver.name))
        .with_device_probe(&probe);
    let outcome = orchestrator.run(&mut strategies)?;
    let record = summarize(&outcome);
    match format {
        OutputFormat::Text => {
            for line in record.key_values() {
                log::debug!("audit {line}");
            }
            println!("{record}");
        }
        OutputFormat::Json => println!("{}", record.to_json().context("render audit record")?),
    }
    Ok(record.exit_code)
}

#[derive(Debug, Serialize)]
struct DetectReport {
    source: String,
    signature: Option<FailureSignature>,
}

fn run_detect<H: Host>(host: &H, config: &CrbfixConfig, format: OutputFormat) -> Result<u8> {
    let mut logs = open_log_source(host, config)?;
    let lines = logs.read()?;
    let detector = FailureDetector::new(&config.driver.name);
    let report = DetectReport {
        source: logs.describe(),
        signature: detector.scan(lines.iter()),
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => match &report.signature {
            Some(signature) => {
                println!(
                    "detected: {} probe_error={}",
                    signature.device_id.as_deref().unwrap_or("unknown device"),
                    signature
                        .probe_error
                        .map_or_else(|| "unknown".to_owned(), |errno| errno.to_string())
                );
                if let Some(geometry) = signature.reported_geometry() {
                    println!("reported: {geometry}");
                }
            }
            None => println!("no defect signature in {}", report.source),
        },
    }
    Ok(if report.signature.is_some() {
        EXIT_UNRESOLVED
    } else {
        EXIT_VERIFIED
    })
}

#[derive(Debug, Serialize)]
struct NormalizeReport {
    original: BufferGeometry,
    normalized: BufferGeometry,
    changed: bool,
}

fn run_normalize(args: &NormalizeArgs, format: OutputFormat) -> Result<u8> {
    let original = BufferGeometry::new(args.cmd_addr, args.rsp_addr, args.cmd_size, args.rsp_size);
    let normalized = normalize(original)?;
    let report = NormalizeReport {
        original,
        normalized,
        changed: original != normalized,
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("original:   {}", report.original);
            println!("normalized: {}", report.normalized);
        }
    }
    Ok(EXIT_VERIFIED)
}

#[derive(Debug, Serialize)]
struct StrategyStatus {
    strategy: StrategyKind,
    active: bool,
    available: bool,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    strategies: Vec<StrategyStatus>,
    device: DeviceReport,
}

fn run_status<H: Host>(host: &H, config: &CrbfixConfig, format: OutputFormat) -> Result<u8> {
    let strategies = default_strategies(host, config);
    let report = StatusReport {
        strategies: strategies
            .iter()
            .map(|strategy| StrategyStatus {
                strategy: strategy.kind(),
                active: strategy.is_active(),
                available: strategy.is_available(),
            })
            .collect(),
        device: HostDeviceProbe::new(host, config).inspect(),
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            for status in &report.strategies {
                println!(
                    "{}: active={} available={}",
                    status.strategy, status.active, status.available
                );
            }
            println!(
                "device: node_present={} driver={} liveness={}",
                report.device.node_present,
                report.device.driver,
                report.device.liveness.label()
            );
        }
    }
    Ok(EXIT_VERIFIED)
}
