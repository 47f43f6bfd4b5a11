// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::Context;
use clap::{Parser, Subcommand};
use labwired_proxy::{
    BarProxy, ConfigSpaceProxy, HeartbeatDriver, IntxRouter, KvmIrqfdRouter, ProxyDevice,
    ProxyHost, StaticIntxRouter, SystemClock,
};
use labwired_proxy_config::{parse_u64, ProxyManifest};
use serde::Serialize;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const EXIT_PASS: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

fn parse_addr(s: &str) -> Result<u64, String> {
    parse_u64(s).map_err(|e| format!("{:#}", e))
}

fn parse_bar_offset(s: &str) -> Result<(u8, u64), String> {
    let (bar, offset) = s
        .split_once(':')
        .ok_or_else(|| format!("Expected BAR:OFFSET, got '{}'", s))?;
    let bar = bar
        .trim()
        .parse::<u8>()
        .map_err(|e| format!("Invalid bar index '{}': {}", bar, e))?;
    Ok((bar, parse_addr(offset)?))
}

fn parse_gsi_table(s: &str) -> Result<[u32; 4], String> {
    let gsis = s
        .split(',')
        .map(|g| g.trim().parse::<u32>().map_err(|e| format!("Invalid GSI '{}': {}", g, e)))
        .collect::<Result<Vec<_>, _>>()?;
    gsis.try_into()
        .map_err(|v: Vec<u32>| format!("Expected 4 GSIs (INTA..INTD), got {}", v.len()))
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "LabWired remote device proxy",
    long_about = None
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Attach every device in the manifest and keep them alive with heartbeats.
    Run(RunArgs),

    /// Attach one device, issue a few accesses and print the results as JSON.
    Probe(ProbeArgs),
}

#[derive(Parser, Debug)]
struct RouterArgs {
    /// Inherited KVM VM descriptor; interrupts are routed with KVM_IRQFD
    #[arg(long)]
    kvm_vm_fd: Option<RawFd>,

    /// GSIs for INTA..INTD, comma separated. The default matches the
    /// I/O APIC pins of a PC machine.
    #[arg(long, value_parser = parse_gsi_table, default_value = "16,17,18,19")]
    intx_gsi: [u32; 4],
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the proxy manifest (YAML)
    #[arg(short, long)]
    manifest: PathBuf,

    #[command(flatten)]
    router: RouterArgs,

    /// Stop after this many milliseconds instead of waiting for every
    /// device to go away
    #[arg(long)]
    duration_ms: Option<u64>,

    /// How often the heartbeat timer is checked
    #[arg(long, default_value = "100")]
    poll_ms: u64,
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    /// Path to the proxy manifest (YAML)
    #[arg(short, long)]
    manifest: PathBuf,

    /// Device id from the manifest
    #[arg(short, long)]
    device: String,

    #[command(flatten)]
    router: RouterArgs,

    /// Configuration-space read address (repeatable)
    #[arg(long, value_parser = parse_addr)]
    config_read: Vec<u64>,

    /// Bar read as BAR:OFFSET (repeatable)
    #[arg(long, value_parser = parse_bar_offset)]
    bar_read: Vec<(u8, u64)>,

    /// Access width in bytes
    #[arg(long, default_value = "4")]
    width: u32,

    /// Send one heartbeat ping
    #[arg(long)]
    ping: bool,
}

#[derive(Debug, Serialize)]
struct RegisterValue {
    addr: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    bar: Option<u8>,
    value: u64,
}

#[derive(Debug, Serialize)]
struct LinkReport {
    frames_sent: u64,
    frames_received: u64,
    replies: u64,
    stale_replies: u64,
    timeouts: u64,
}

#[derive(Debug, Serialize)]
struct ProbeReport {
    device: String,
    pid: Option<i32>,
    interrupt_gsi: Option<u32>,
    config: Vec<RegisterValue>,
    bars: Vec<RegisterValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ping: Option<u64>,
    link: LinkReport,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.trace {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Probe(args) => probe(args),
    }
}

fn build_router(args: &RouterArgs) -> Arc<dyn IntxRouter> {
    match args.kvm_vm_fd {
        Some(fd) => {
            info!(fd, "Routing interrupts through KVM_IRQFD");
            // SAFETY: the descriptor is handed to this process by its parent
            // for exclusive use and is not referenced anywhere else.
            let vm = unsafe { OwnedFd::from_raw_fd(fd) };
            Arc::new(KvmIrqfdRouter::new(vm, args.intx_gsi))
        }
        None => Arc::new(StaticIntxRouter::new(args.intx_gsi.map(Some))),
    }
}

fn load_manifest(path: &Path) -> Result<ProxyManifest, ExitCode> {
    info!("Loading proxy manifest: {:?}", path);
    ProxyManifest::from_file(path).map_err(|e| {
        error!("{:#}", e);
        ExitCode::from(EXIT_CONFIG_ERROR)
    })
}

fn run(args: RunArgs) -> ExitCode {
    let manifest = match load_manifest(&args.manifest) {
        Ok(m) => m,
        Err(code) => return code,
    };
    if manifest.devices.is_empty() {
        warn!("Manifest declares no devices, nothing to do");
        return ExitCode::from(EXIT_PASS);
    }

    let host = ProxyHost::new(
        &manifest,
        build_router(&args.router),
        Arc::new(SystemClock::default()),
    );

    let mut failed = 0;
    for cfg in &manifest.devices {
        let attached = host
            .create_device(cfg)
            .and_then(|dev| host.attach(&dev));
        if let Err(e) = attached {
            error!(device = %cfg.id, errno = e.errno(), "Failed to attach: {}", e);
            failed += 1;
        }
    }
    if host.registry().is_empty() {
        error!("No device could be attached");
        return ExitCode::from(EXIT_RUNTIME_ERROR);
    }
    info!(
        "{} device(s) attached, heartbeat every {:?}",
        host.registry().len(),
        host.heartbeat().interval()
    );

    let poll = Duration::from_millis(args.poll_ms.max(1));
    let driver = match HeartbeatDriver::spawn(Arc::clone(host.heartbeat()), poll) {
        Ok(driver) => driver,
        Err(e) => {
            error!("Failed to start heartbeat thread: {}", e);
            host.shutdown();
            return ExitCode::from(EXIT_RUNTIME_ERROR);
        }
    };

    let deadline = args
        .duration_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    while !host.registry().is_empty() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Run duration elapsed");
            break;
        }
        std::thread::sleep(poll);
    }
    if host.registry().is_empty() {
        warn!("Every remote device has been evicted");
    }

    driver.shutdown();
    host.shutdown();

    if failed > 0 {
        ExitCode::from(EXIT_RUNTIME_ERROR)
    } else {
        ExitCode::from(EXIT_PASS)
    }
}

fn probe(args: ProbeArgs) -> ExitCode {
    let manifest = match load_manifest(&args.manifest) {
        Ok(m) => m,
        Err(code) => return code,
    };
    let Some(cfg) = manifest.device(&args.device) else {
        error!("Device '{}' not found in manifest", args.device);
        return ExitCode::from(EXIT_CONFIG_ERROR);
    };

    let host = ProxyHost::new(
        &manifest,
        build_router(&args.router),
        Arc::new(SystemClock::default()),
    );
    let result = host
        .create_device(cfg)
        .map_err(anyhow::Error::from)
        .and_then(|dev| {
            host.attach(&dev)?;
            probe_device(&dev, &args)
        });
    host.shutdown();

    match result {
        Ok(report) => match serde_json::to_string(&report) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::from(EXIT_PASS)
            }
            Err(e) => {
                error!("Failed to serialize probe report: {}", e);
                ExitCode::from(EXIT_RUNTIME_ERROR)
            }
        },
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

fn probe_device(dev: &ProxyDevice, args: &ProbeArgs) -> anyhow::Result<ProbeReport> {
    let mut config = Vec::new();
    for &addr in &args.config_read {
        let addr32 = u32::try_from(addr).context("Config address out of range")?;
        let value = dev
            .config_read(addr32, args.width)
            .with_context(|| format!("Config read at {:#x}", addr))?;
        config.push(RegisterValue {
            addr,
            bar: None,
            value: value as u64,
        });
    }

    let mut bars = Vec::new();
    for &(bar, offset) in &args.bar_read {
        let value = dev
            .bar_read(bar, offset, args.width)
            .with_context(|| format!("Bar {} read at {:#x}", bar, offset))?;
        bars.push(RegisterValue {
            addr: offset,
            bar: Some(bar),
            value,
        });
    }

    let ping = if args.ping {
        Some(dev.ping().context("Heartbeat ping")?)
    } else {
        None
    };

    let link = dev.link()?;
    let metrics = link.metrics();
    Ok(ProbeReport {
        device: dev.config().id.clone(),
        pid: dev.remote_pid(),
        interrupt_gsi: dev.interrupt_forwarder().and_then(|f| f.active_gsi()),
        config,
        bars,
        ping,
        link: LinkReport {
            frames_sent: metrics.get_frames_sent(),
            frames_received: metrics.get_frames_received(),
            replies: metrics.get_replies(),
            stale_replies: metrics.get_stale_replies(),
            timeouts: metrics.get_timeouts(),
        },
    })
}
