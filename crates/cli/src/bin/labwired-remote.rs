// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Well-known remote executable. Started by the proxy with the inherited
//! socket descriptor as its first argument, followed by the device command
//! line from the manifest.

use anyhow::Context;
use clap::Parser;
use labwired_proxy::{Channel, RegisterFileDevice, RemoteServer};
use labwired_proxy_config::parse_u64;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::process::ExitCode;
use tracing::{error, info};

fn parse_assignment(s: &str) -> Result<(u64, u64), String> {
    let (addr, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected ADDR=VALUE, got '{}'", s))?;
    let addr = parse_u64(addr).map_err(|e| format!("{:#}", e))?;
    let value = parse_u64(value).map_err(|e| format!("{:#}", e))?;
    Ok((addr, value))
}

fn parse_addr(s: &str) -> Result<u64, String> {
    parse_u64(s).map_err(|e| format!("{:#}", e))
}

#[derive(Parser, Debug)]
#[command(author, version, about = "LabWired remote register-file device", long_about = None)]
struct Args {
    /// Inherited channel socket descriptor
    fd: RawFd,

    /// Preset configuration-space register, ADDR=VALUE (repeatable)
    #[arg(long = "reg", value_parser = parse_assignment)]
    regs: Vec<(u64, u64)>,

    /// Preset bar register at an absolute bus address, ADDR=VALUE (repeatable)
    #[arg(long = "bar-reg", value_parser = parse_assignment)]
    bar_regs: Vec<(u64, u64)>,

    /// Bar address whose writes raise the legacy interrupt
    #[arg(long, value_parser = parse_addr)]
    doorbell: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    trace: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.trace {
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

    match serve(&args) {
        Ok(served) => {
            info!("Remote exiting after {} requests", served);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn build_device(args: &Args) -> anyhow::Result<RegisterFileDevice> {
    let mut device = RegisterFileDevice::new();
    for &(addr, value) in &args.regs {
        let addr = u32::try_from(addr).with_context(|| format!("Config address {:#x}", addr))?;
        let value = u32::try_from(value).with_context(|| format!("Config value {:#x}", value))?;
        device = device.with_config_reg(addr, value);
    }
    for &(addr, value) in &args.bar_regs {
        device = device.with_bar_reg(addr, value);
    }
    if let Some(addr) = args.doorbell {
        device = device.with_doorbell(addr);
    }
    Ok(device)
}

fn serve(args: &Args) -> anyhow::Result<u64> {
    // SAFETY: F_GETFD only inspects the descriptor table.
    if unsafe { libc::fcntl(args.fd, libc::F_GETFD) } < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Channel descriptor {} is not open", args.fd));
    }
    // SAFETY: the descriptor is open and was handed to this process for
    // exclusive use by the proxy that spawned it.
    let fd = unsafe { OwnedFd::from_raw_fd(args.fd) };

    let device = build_device(args)?;
    info!(
        pid = std::process::id(),
        fd = args.fd,
        "Serving register-file device"
    );
    let mut server = RemoteServer::new(Channel::from_owned_fd(fd), device);
    server.serve().context("Serving proxy requests")?;
    Ok(server.served())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(parse_assignment("0x10=0x12345678").unwrap(), (0x10, 0x1234_5678));
        assert_eq!(parse_assignment("4=5").unwrap(), (4, 5));
        assert!(parse_assignment("0x10").is_err());
        assert!(parse_assignment("0x10=zz").is_err());
    }

    #[test]
    fn test_args_build_device() {
        let args = Args::parse_from([
            "labwired-remote",
            "3",
            "--reg",
            "0x10=0x12345678",
            "--bar-reg",
            "0x1008=7",
            "--doorbell",
            "0x1000",
        ]);
        assert_eq!(args.fd, 3);
        let device = build_device(&args).unwrap();
        assert_eq!(device.config_reg(0x10), Some(0x1234_5678));
        assert_eq!(device.bar_reg(0x1008), Some(7));
    }

    #[test]
    fn test_config_value_must_fit() {
        let args = Args::parse_from(["labwired-remote", "3", "--reg", "0x10=0x100000000"]);
        assert!(build_device(&args).is_err());
    }
}
