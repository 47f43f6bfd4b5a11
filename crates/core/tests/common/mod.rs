// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

#![allow(dead_code)]

use labwired_proxy::{
    Channel, ProcessLauncher, ProxyResult, RegisterFileDevice, RemoteProcess, RemoteServer,
};
use labwired_proxy_config::{BarConfig, BarKind, DeviceConfig};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;

pub fn device_config(id: &str) -> DeviceConfig {
    DeviceConfig {
        id: id.to_string(),
        driver: "remote-pci-dev".to_string(),
        remote_device: Some(format!("remote-{}", id)),
        command: String::new(),
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

/// Serves each launched device from an in-process register file.
pub struct InProcessLauncher {
    next_pid: AtomicI32,
    regs: Vec<(u32, u32)>,
}

impl InProcessLauncher {
    pub fn new(regs: &[(u32, u32)]) -> Self {
        Self {
            next_pid: AtomicI32::new(1000),
            regs: regs.to_vec(),
        }
    }
}

impl ProcessLauncher for InProcessLauncher {
    fn launch(&self, _device: &DeviceConfig) -> ProxyResult<Option<RemoteProcess>> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = Channel::pair().unwrap();
        let mut dev = RegisterFileDevice::new();
        for &(addr, value) in &self.regs {
            dev = dev.with_config_reg(addr, value);
        }
        thread::spawn(move || {
            let mut server = RemoteServer::new(remote, dev).with_pid(pid as u32);
            let _ = server.serve();
        });
        Ok(Some(RemoteProcess {
            pid,
            channel: local,
            child: None,
        }))
    }
}

/// Remote that reads every request and never answers.
pub struct SilentLauncher;

impl ProcessLauncher for SilentLauncher {
    fn launch(&self, _device: &DeviceConfig) -> ProxyResult<Option<RemoteProcess>> {
        let (local, remote) = Channel::pair().unwrap();
        thread::spawn(move || while remote.recv().is_ok() {});
        Ok(Some(RemoteProcess {
            pid: 4000,
            channel: local,
            child: None,
        }))
    }
}

/// First launch hands back a channel whose remote end is already gone;
/// later launches behave like [`InProcessLauncher`].
pub struct DeadOnceLauncher {
    failed: AtomicBool,
    inner: InProcessLauncher,
}

impl DeadOnceLauncher {
    pub fn new(regs: &[(u32, u32)]) -> Self {
        Self {
            failed: AtomicBool::new(false),
            inner: InProcessLauncher::new(regs),
        }
    }
}

impl ProcessLauncher for DeadOnceLauncher {
    fn launch(&self, device: &DeviceConfig) -> ProxyResult<Option<RemoteProcess>> {
        if self.failed.swap(true, Ordering::SeqCst) {
            return self.inner.launch(device);
        }
        let (local, remote) = Channel::pair().unwrap();
        drop(remote);
        Ok(Some(RemoteProcess {
            pid: 5000,
            channel: local,
            child: None,
        }))
    }
}
