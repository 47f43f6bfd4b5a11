// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use labwired_proxy::{
    BarProxy, ConfigSpaceProxy, ProxyDevice, ProxyError, ProxyHost, SpawnLauncher,
    StaticIntxRouter, SystemClock,
};
use labwired_proxy_config::{BarConfig, BarKind, DeviceConfig, ProxyManifest};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

fn launcher() -> SpawnLauncher {
    let exe = Path::new(env!("CARGO_BIN_EXE_labwired-remote"));
    SpawnLauncher::new(
        exe.parent().unwrap(),
        exe.file_name().unwrap().to_str().unwrap(),
    )
}

fn device_config(id: &str, command: &str) -> DeviceConfig {
    DeviceConfig {
        id: id.to_string(),
        driver: "remote-pci-dev".to_string(),
        remote_device: Some(format!("r{}", id)),
        command: command.to_string(),
        managed: false,
        pid: None,
        socket: None,
        interrupt_pin: 1,
        bars: vec![BarConfig {
            index: 0,
            kind: BarKind::Memory,
            size: "4KiB".to_string(),
            base: Some(0x1000),
        }],
        options: Default::default(),
    }
}

fn host() -> (ProxyHost, Arc<StaticIntxRouter>) {
    let router = Arc::new(StaticIntxRouter::new([Some(16), Some(17), Some(18), Some(19)]));
    let host = ProxyHost::new(
        &ProxyManifest::default(),
        router.clone(),
        Arc::new(SystemClock::default()),
    );
    (host, router)
}

fn attach(host: &ProxyHost, cfg: &DeviceConfig) -> Arc<ProxyDevice> {
    let dev = host.create_device(cfg).unwrap();
    host.attach_with(&dev, &launcher()).unwrap();
    dev
}

#[test]
fn test_spawned_remote_answers_config_read() {
    let (host, _router) = host();
    let dev = attach(&host, &device_config("lsi0", "--reg 0x10=0x12345678"));

    assert_eq!(dev.config_read(0x10, 4).unwrap(), 0x1234_5678);
    assert_eq!(dev.config_read(0x14, 4).unwrap(), 0);
    host.shutdown();
}

#[test]
fn test_heartbeat_reports_child_pid() {
    let (host, _router) = host();
    let dev = attach(&host, &device_config("hb", ""));
    let pid = dev.remote_pid().unwrap();
    assert!(pid > 0);
    assert_eq!(dev.ping().unwrap(), pid as u64);

    let report = host.heartbeat().broadcast();
    assert_eq!((report.pinged, report.answered), (1, 1));
    host.shutdown();
}

#[test]
fn test_bar_write_then_read() {
    let (host, _router) = host();
    let dev = attach(&host, &device_config("bar", "--bar-reg 0x1010=0x55"));

    assert_eq!(dev.bar_read(0, 0x10, 4).unwrap(), 0x55);
    dev.bar_write(0, 0x8, 0xabcd, 4).unwrap();
    assert_eq!(dev.bar_read(0, 0x8, 4).unwrap(), 0xabcd);
    assert_eq!(dev.bar_read(0, 0x8, 1).unwrap(), 0xcd);
    host.shutdown();
}

#[test]
fn test_doorbell_raises_forwarded_interrupt() {
    let (host, router) = host();
    let dev = attach(&host, &device_config("irq", "--doorbell 0x1000"));
    let fwd = dev.interrupt_forwarder().unwrap();
    assert_eq!(fwd.active_gsi(), Some(16));
    assert_eq!(router.active().len(), 1);

    dev.bar_write(0, 0x4, 1, 4).unwrap();
    dev.bar_write(0, 0x0, 1, 4).unwrap();
    // A read round trip guarantees both writes were applied.
    dev.bar_read(0, 0x0, 4).unwrap();
    assert!(fwd.irq().try_consume().unwrap());
    assert!(!fwd.irq().try_consume().unwrap());

    host.shutdown();
    assert!(router.active().is_empty());
}

#[test]
fn test_remote_exits_when_channel_closes() {
    let remote = launcher().spawn("--reg 0x10=1", false).unwrap().unwrap();
    let mut child = remote.child.unwrap();
    assert_eq!(child.id() as i32, remote.pid);
    drop(remote.channel);
    let status = child.wait().unwrap();
    assert!(status.success(), "remote exited with {}", status);
}

#[test]
fn test_managed_device_is_not_spawned() {
    assert!(launcher().spawn("", true).unwrap().is_none());
}

#[test]
fn test_argument_limit_is_enforced() {
    let command = vec!["--trace"; 70].join(" ");
    assert!(matches!(
        launcher().spawn(&command, false),
        Err(ProxyError::Spawn(_))
    ));
}

#[test]
fn test_missing_executable_is_spawn_error() {
    let launcher = SpawnLauncher::new("/nonexistent", "labwired-remote");
    let (host, _router) = host();
    let dev = host.create_device(&device_config("gone", "")).unwrap();
    assert!(matches!(
        host.attach_with(&dev, &launcher),
        Err(ProxyError::Spawn(_))
    ));
    assert!(host.registry().is_empty());
}

#[test]
fn test_remote_rejects_closed_descriptor() {
    let status = Command::new(env!("CARGO_BIN_EXE_labwired-remote"))
        .arg("987")
        .status()
        .unwrap();
    assert!(!status.success());
}
