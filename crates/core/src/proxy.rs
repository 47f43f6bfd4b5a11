// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! The local stand-in for one remotely emulated PCI function.

use crate::channel::Channel;
use crate::error::{ProxyError, ProxyResult};
use crate::irq::{InterruptForwarder, IntxRouter};
use crate::launcher::{parse_pid, watch_child, ProcessLauncher};
use crate::link::ProxyLink;
use crate::message::Message;
use crate::pci::{BarInfo, ConfigSpace};
use labwired_proxy_config::{DeviceConfig, PCI_NUM_BARS};
use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// Remote pid when no remote is known.
pub const NO_REMOTE_PID: i32 = -1;

/// Configuration-space forwarding.
pub trait ConfigSpaceProxy {
    /// Applies the local default read, then returns the remote's value.
    fn config_read(&self, addr: u32, len: u32) -> ProxyResult<u32>;

    /// Applies the local default write, then forwards it without waiting.
    fn config_write(&self, addr: u32, value: u32, len: u32) -> ProxyResult<()>;
}

/// Bar-relative access forwarding.
pub trait BarProxy {
    fn bar_read(&self, index: u8, offset: u64, size: u32) -> ProxyResult<u64>;

    fn bar_write(&self, index: u8, offset: u64, value: u64, size: u32) -> ProxyResult<()>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ProxyDevice {
    config: DeviceConfig,
    reply_timeout: Duration,
    managed: AtomicBool,
    remote_pid: AtomicI32,
    link: Mutex<Option<Arc<ProxyLink>>>,
    /// Externally supplied socket awaiting realize.
    pending_socket: Mutex<Option<UnixStream>>,
    child: Mutex<Option<Child>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    config_space: Mutex<ConfigSpace>,
    bars: [Option<BarInfo>; PCI_NUM_BARS as usize],
    irq: Mutex<Option<Arc<InterruptForwarder>>>,
}

impl std::fmt::Debug for ProxyDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyDevice")
            .field("id", &self.config.id)
            .field("managed", &self.is_managed())
            .field("remote_pid", &self.remote_pid())
            .finish()
    }
}

impl ProxyDevice {
    pub fn new(config: DeviceConfig, reply_timeout: Duration) -> ProxyResult<Self> {
        let mut config_space = ConfigSpace::new(0xffff, 0xffff, 0, config.interrupt_pin);
        let mut bars: [Option<BarInfo>; PCI_NUM_BARS as usize] = Default::default();
        for bar in &config.bars {
            let size = bar
                .region_size()
                .map_err(|e| ProxyError::Configuration(format!("bar {}: {:#}", bar.index, e)))?;
            let info = BarInfo {
                index: bar.index,
                kind: bar.kind,
                size,
                base: bar.base,
            };
            let slot = bars
                .get_mut(bar.index as usize)
                .ok_or_else(|| ProxyError::Configuration(format!("bar index {}", bar.index)))?;
            config_space.register_bar(&info);
            *slot = Some(info);
        }

        Ok(Self {
            managed: AtomicBool::new(config.managed),
            config,
            reply_timeout,
            remote_pid: AtomicI32::new(NO_REMOTE_PID),
            link: Mutex::new(None),
            pending_socket: Mutex::new(None),
            child: Mutex::new(None),
            reaper: Mutex::new(None),
            config_space: Mutex::new(config_space),
            bars,
            irq: Mutex::new(None),
        })
    }

    /// Device identifier carried in forwarded messages.
    pub fn id(&self) -> Option<&str> {
        Some(self.config.id.as_str()).filter(|id| !id.is_empty())
    }

    pub fn label(&self) -> &str {
        self.config
            .remote_device
            .as_deref()
            .unwrap_or(self.config.id.as_str())
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn is_managed(&self) -> bool {
        self.managed.load(Ordering::SeqCst)
    }

    pub fn remote_pid(&self) -> Option<i32> {
        Some(self.remote_pid.load(Ordering::SeqCst)).filter(|&p| p != NO_REMOTE_PID)
    }

    pub fn is_realized(&self) -> bool {
        lock(&self.link).is_some()
    }

    pub fn link(&self) -> ProxyResult<Arc<ProxyLink>> {
        lock(&self.link).clone().ok_or(ProxyError::NotRealized)
    }

    pub fn bar(&self, index: u8) -> Option<&BarInfo> {
        self.bars.get(index as usize).and_then(Option::as_ref)
    }

    /// Installs an externally owned socket. The device becomes managed and
    /// realize uses this socket instead of launching a remote.
    pub fn set_proxy_socket(&self, socket: UnixStream) -> ProxyResult<()> {
        if self.is_realized() {
            return Err(ProxyError::InvalidArgument("device is already realized"));
        }
        *lock(&self.pending_socket) = Some(socket);
        self.managed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Local end of the channel, or of the socket awaiting realize.
    pub fn proxy_socket(&self) -> Option<RawFd> {
        if let Some(link) = lock(&self.link).as_ref() {
            return Some(link.channel().as_raw_fd());
        }
        lock(&self.pending_socket).as_ref().map(|s| s.as_raw_fd())
    }

    /// Establishes the channel and remote process. Runs at most once; later
    /// calls on a realized device return immediately.
    pub fn realize(&self, launcher: &dyn ProcessLauncher) -> ProxyResult<()> {
        let mut link = lock(&self.link);
        if link.is_some() {
            return Ok(());
        }

        let pending = lock(&self.pending_socket).take();
        let (pid, channel) = match pending {
            Some(socket) => {
                let pid = parse_pid(self.config.pid.as_deref().unwrap_or("-1"))?;
                (pid, Channel::new(socket))
            }
            None => {
                let mut launch_cfg = self.config.clone();
                launch_cfg.managed = self.is_managed();
                let remote = launcher.launch(&launch_cfg)?.ok_or_else(|| {
                    ProxyError::Attach(format!(
                        "no remote available for {} device '{}'",
                        if launch_cfg.managed { "managed" } else { "owned" },
                        self.config.id
                    ))
                })?;
                *lock(&self.child) = remote.child;
                (remote.pid, remote.channel)
            }
        };

        let timeout = self.reply_timeout;
        *link = Some(Arc::new(ProxyLink::start(channel, self.label(), timeout)?));
        self.remote_pid.store(pid, Ordering::SeqCst);
        tracing::info!(device = %self.config.id, pid, "Proxy device realized");
        Ok(())
    }

    /// Starts reaping a spawned remote. No-op for attached remotes.
    pub fn watch_remote(&self) -> ProxyResult<()> {
        if let Some(child) = lock(&self.child).take() {
            *lock(&self.reaper) = Some(watch_child(child, self.label())?);
        }
        Ok(())
    }

    /// Local view of configuration space, without forwarding.
    pub fn local_config_read(&self, addr: u32, len: u32) -> u32 {
        lock(&self.config_space).read(addr, len)
    }

    fn require_id(&self) -> ProxyResult<&str> {
        self.id()
            .ok_or(ProxyError::InvalidArgument("forwarding requires a device id"))
    }

    /// Forwards a bar access at `base + offset`. Reads block for the remote
    /// value; writes return `None` without waiting.
    pub fn bar_access(
        &self,
        write: bool,
        base: u64,
        offset: u64,
        value: u64,
        size: u32,
        memory: bool,
    ) -> ProxyResult<Option<u64>> {
        let addr = base
            .checked_add(offset)
            .ok_or(ProxyError::InvalidArgument("bar address overflows"))?;
        let link = self.link()?;
        if write {
            link.send(&Message::bar_write(addr, value, size, memory).with_device_id(self.id()))?;
            Ok(None)
        } else {
            let id = self.id();
            let value =
                link.call(|wait| Message::bar_read(addr, size, memory, wait).with_device_id(id))?;
            Ok(Some(value))
        }
    }

    fn bar_base(&self, index: u8, offset: u64, size: u32) -> ProxyResult<(u64, bool)> {
        let bar = self
            .bar(index)
            .ok_or(ProxyError::InvalidArgument("bar is not present"))?;
        if !bar.contains(offset, size) {
            return Err(ProxyError::InvalidArgument("access outside bar"));
        }
        let base = lock(&self.config_space)
            .bar_address(index)
            .or(bar.base)
            .ok_or(ProxyError::InvalidArgument("bar is not mapped"))?;
        Ok((base, bar.is_memory()))
    }

    /// Sends the option dictionary as a DEVICE_OPTIONS bytestream.
    pub fn set_remote_options(
        &self,
        options: &BTreeMap<String, serde_json::Value>,
    ) -> ProxyResult<()> {
        let json = serde_json::to_vec(options)
            .map_err(|e| ProxyError::Configuration(format!("device options: {}", e)))?;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(json.len())?;
        bytes.extend_from_slice(&json);
        self.link()?
            .send(&Message::device_options(bytes).with_device_id(self.id()))
    }

    /// Hands interrupt notifiers to the remote and routes them. A previous
    /// routing entry is removed before the new one is installed.
    pub fn setup_irqfd(&self, router: Arc<dyn IntxRouter>) -> ProxyResult<()> {
        let link = self.link()?;
        let mut irq = lock(&self.irq);
        if let Some(old) = irq.take() {
            old.teardown();
        }
        let pin = lock(&self.config_space).interrupt_pin();
        *irq = Some(InterruptForwarder::setup(&link, self.id(), pin, router)?);
        Ok(())
    }

    pub fn interrupt_forwarder(&self) -> Option<Arc<InterruptForwarder>> {
        lock(&self.irq).clone()
    }

    /// Re-resolves the INTx route after the hypervisor recomputed routing.
    pub fn intx_routing_changed(&self) -> ProxyResult<()> {
        match lock(&self.irq).as_ref() {
            Some(fwd) => fwd.update_routing(),
            None => Ok(()),
        }
    }

    /// Liveness probe. The remote answers with its pid.
    pub fn ping(&self) -> ProxyResult<u64> {
        let id = self.id();
        self.link()?
            .call(|wait| Message::ping(wait).with_device_id(id))
    }

    /// Undoes a realize whose ready sequence failed: closes the channel,
    /// kills a spawned remote that is not yet watched, and forgets the link
    /// so a later realize starts over.
    pub fn unrealize(&self) {
        self.teardown();
        lock(&self.link).take();
        if let Some(mut child) = lock(&self.child).take() {
            if let Err(e) = child.kill() {
                tracing::warn!(device = %self.config.id, pid = child.id(), "Failed to kill remote: {}", e);
            }
            if let Err(e) = child.wait() {
                tracing::warn!(device = %self.config.id, pid = child.id(), "Failed to reap remote: {}", e);
            }
        }
        self.remote_pid.store(NO_REMOTE_PID, Ordering::SeqCst);
    }

    /// Releases interrupt routing and closes the channel.
    pub fn teardown(&self) {
        if let Some(fwd) = lock(&self.irq).take() {
            fwd.teardown();
        }
        if let Some(link) = lock(&self.link).as_ref() {
            link.close();
        }
        tracing::debug!(device = %self.config.id, "Proxy device torn down");
    }
}

impl ConfigSpaceProxy for ProxyDevice {
    fn config_read(&self, addr: u32, len: u32) -> ProxyResult<u32> {
        // The local default read always runs first; the remote value replaces it.
        let _ = lock(&self.config_space).read(addr, len);
        let id = self.require_id()?;
        let value = self
            .link()?
            .call(|wait| Message::config_read(addr, len, wait).with_device_id(Some(id)))?;
        Ok(value as u32)
    }

    fn config_write(&self, addr: u32, value: u32, len: u32) -> ProxyResult<()> {
        lock(&self.config_space).write(addr, value, len);
        let id = self.require_id()?;
        self.link()?
            .send(&Message::config_write(addr, value, len).with_device_id(Some(id)))
    }
}

impl BarProxy for ProxyDevice {
    fn bar_read(&self, index: u8, offset: u64, size: u32) -> ProxyResult<u64> {
        let (base, memory) = self.bar_base(index, offset, size)?;
        Ok(self
            .bar_access(false, base, offset, 0, size, memory)?
            .unwrap_or_default())
    }

    fn bar_write(&self, index: u8, offset: u64, value: u64, size: u32) -> ProxyResult<()> {
        let (base, memory) = self.bar_base(index, offset, size)?;
        self.bar_access(true, base, offset, value, size, memory)?;
        Ok(())
    }
}
