// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Device lifecycle on the hypervisor side: realize, ready, detach.

use crate::error::{ProxyError, ProxyResult};
use crate::heartbeat::{Clock, HeartbeatMonitor};
use crate::irq::IntxRouter;
use crate::launcher::{launcher_for, ProcessLauncher};
use crate::proxy::ProxyDevice;
use crate::registry::DeviceRegistry;
use labwired_proxy_config::{DeviceConfig, ProxyManifest, RemoteConfig};
use std::sync::Arc;
use std::time::Duration;

pub struct ProxyHost {
    registry: Arc<DeviceRegistry>,
    heartbeat: Arc<HeartbeatMonitor>,
    router: Arc<dyn IntxRouter>,
    remote: RemoteConfig,
    reply_timeout: Duration,
}

impl std::fmt::Debug for ProxyHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHost")
            .field("devices", &self.registry.len())
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl ProxyHost {
    pub fn new(manifest: &ProxyManifest, router: Arc<dyn IntxRouter>, clock: Arc<dyn Clock>) -> Self {
        let registry = DeviceRegistry::new();
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            Arc::clone(&registry),
            clock,
            &manifest.heartbeat,
        ));
        Self {
            registry,
            heartbeat,
            router,
            remote: manifest.remote.clone(),
            reply_timeout: manifest
                .reply_timeout_ms
                .map_or(Duration::MAX, Duration::from_millis),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    pub fn create_device(&self, config: &DeviceConfig) -> ProxyResult<Arc<ProxyDevice>> {
        Ok(Arc::new(ProxyDevice::new(config.clone(), self.reply_timeout)?))
    }

    /// Realizes `device` with the launcher matching its mode, then readies it.
    pub fn attach(&self, device: &Arc<ProxyDevice>) -> ProxyResult<()> {
        let mut config = device.config().clone();
        config.managed = device.is_managed();
        let launcher = launcher_for(&config, &self.remote)?;
        self.attach_with(device, launcher.as_ref())
    }

    /// Realizes `device` through `launcher`. A device whose remote could not
    /// be established or readied is never registered and can be attached
    /// again.
    pub fn attach_with(&self, device: &Arc<ProxyDevice>, launcher: &dyn ProcessLauncher) -> ProxyResult<()> {
        if self.registry.contains(device) {
            return Ok(());
        }
        device.realize(launcher)?;
        if let Err(e) = self.ready(device) {
            tracing::error!(device = %device.config().id, "Ready sequence failed: {}", e);
            device.unrealize();
            return Err(e);
        }
        Ok(())
    }

    /// Interrupt setup, child watching and heartbeat start, in that order.
    fn ready(&self, device: &Arc<ProxyDevice>) -> ProxyResult<()> {
        match device.setup_irqfd(Arc::clone(&self.router)) {
            Ok(()) => {}
            Err(ProxyError::Configuration(msg)) => {
                tracing::error!(device = %device.config().id, "Interrupts unavailable: {}", msg);
            }
            Err(e) => return Err(e),
        }
        device.watch_remote()?;

        if !device.config().options.is_empty() {
            device.set_remote_options(&device.config().options)?;
        }

        let count = self.registry.link(Arc::clone(device));
        self.heartbeat.start();
        tracing::info!(
            device = %device.config().id,
            pid = device.remote_pid().unwrap_or(-1),
            devices = count,
            "Remote device attached"
        );
        Ok(())
    }

    /// Unlinks and tears down `device`. The heartbeat is stopped and, if
    /// other devices remain, re-armed with a fresh timer.
    pub fn detach(&self, device: &Arc<ProxyDevice>) -> bool {
        self.heartbeat.stop();
        let removed = self.registry.unlink(device);
        device.teardown();
        if !self.registry.is_empty() {
            self.heartbeat.start();
        }
        if removed {
            tracing::info!(device = %device.config().id, "Remote device detached");
        }
        removed
    }

    /// Detaches every device.
    pub fn shutdown(&self) {
        for device in self.registry.snapshot() {
            self.detach(&device);
        }
    }
}
