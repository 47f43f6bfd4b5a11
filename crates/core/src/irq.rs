// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Legacy interrupt forwarding from a remote process.
//!
//! The remote signals an eventfd; the hypervisor turns that into an
//! interrupt on the GSI its routing table assigns to the device's INTx pin,
//! and signals the resample eventfd when the guest acknowledges.

use crate::error::{ProxyError, ProxyResult};
use crate::event::EventNotifier;
use crate::link::ProxyLink;
use crate::message::Message;
use bitflags::bitflags;
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

bitflags! {
    /// `kvm_irqfd.flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqfdFlags: u32 {
        const DEASSIGN = 1 << 0;
        const RESAMPLE = 1 << 1;
    }
}

pub type RoutingNotifier = Arc<dyn Fn() + Send + Sync>;

/// Hypervisor interrupt routing as seen by a forwarder.
pub trait IntxRouter: Send + Sync {
    /// GSI currently routed for legacy interrupt index `intx` (pin - 1).
    fn route_intx(&self, intx: u8) -> Option<u32>;

    fn assign(&self, gsi: u32, irq: BorrowedFd<'_>, resample: BorrowedFd<'_>) -> io::Result<()>;

    fn deassign(&self, gsi: u32, irq: BorrowedFd<'_>) -> io::Result<()>;

    /// Registers a callback run after the routing table is recomputed and
    /// returns a key for `remove_routing_notifier`. Routers with fixed
    /// routing may ignore it and return `None`.
    fn add_routing_notifier(&self, _notify: RoutingNotifier) -> Option<usize> {
        None
    }

    fn remove_routing_notifier(&self, _key: usize) {}
}

/// Software routing table. Used when no in-kernel irqchip is available and
/// by tests; `set_route` models the hypervisor recomputing its routes.
#[derive(Default)]
pub struct StaticIntxRouter {
    routes: Mutex<[Option<u32>; 4]>,
    active: Mutex<HashMap<RawFd, u32>>,
    notifiers: Mutex<Slab<RoutingNotifier>>,
}

impl StaticIntxRouter {
    pub fn new(routes: [Option<u32>; 4]) -> Self {
        Self {
            routes: Mutex::new(routes),
            ..Default::default()
        }
    }

    /// Changes the GSI for `intx` and notifies registered forwarders.
    pub fn set_route(&self, intx: u8, gsi: Option<u32>) {
        if let Some(slot) = self.lock_routes().get_mut(intx as usize) {
            *slot = gsi;
        }
        // Callbacks may drop the last reference to a forwarder, which
        // unregisters it; run them outside the lock.
        let notifiers: Vec<RoutingNotifier> = self
            .lock_notifiers()
            .iter()
            .map(|(_, notify)| Arc::clone(notify))
            .collect();
        for notify in notifiers {
            notify();
        }
    }

    /// Number of registered routing callbacks.
    pub fn notifier_count(&self) -> usize {
        self.lock_notifiers().len()
    }

    /// Active bindings as (irq fd, gsi), sorted by fd.
    pub fn active(&self) -> Vec<(RawFd, u32)> {
        let mut v: Vec<_> = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(fd, gsi)| (*fd, *gsi))
            .collect();
        v.sort_unstable();
        v
    }

    fn lock_routes(&self) -> std::sync::MutexGuard<'_, [Option<u32>; 4]> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_notifiers(&self) -> std::sync::MutexGuard<'_, Slab<RoutingNotifier>> {
        self.notifiers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl IntxRouter for StaticIntxRouter {
    fn route_intx(&self, intx: u8) -> Option<u32> {
        self.lock_routes().get(intx as usize).copied().flatten()
    }

    fn assign(&self, gsi: u32, irq: BorrowedFd<'_>, _resample: BorrowedFd<'_>) -> io::Result<()> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.contains_key(&irq.as_raw_fd()) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        active.insert(irq.as_raw_fd(), gsi);
        tracing::debug!(gsi, fd = irq.as_raw_fd(), "irqfd assigned");
        Ok(())
    }

    fn deassign(&self, gsi: u32, irq: BorrowedFd<'_>) -> io::Result<()> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(&irq.as_raw_fd()) {
            Some(&bound) if bound == gsi => {
                active.remove(&irq.as_raw_fd());
                tracing::debug!(gsi, fd = irq.as_raw_fd(), "irqfd deassigned");
                Ok(())
            }
            _ => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn add_routing_notifier(&self, notify: RoutingNotifier) -> Option<usize> {
        Some(self.lock_notifiers().insert(notify))
    }

    fn remove_routing_notifier(&self, key: usize) {
        self.lock_notifiers().try_remove(key);
    }
}

mod ioctl {
    use nix::ioctl_write_ptr;

    const KVMIO: u8 = 0xae;

    #[repr(C)]
    #[allow(non_camel_case_types)]
    pub struct kvm_irqfd {
        pub fd: u32,
        pub gsi: u32,
        pub flags: u32,
        pub resamplefd: u32,
        pub pad: [u8; 16],
    }

    ioctl_write_ptr!(kvm_irqfd, KVMIO, 0x76, kvm_irqfd);
}

/// Routes through `KVM_IRQFD` on a VM descriptor with a fixed INTx to GSI
/// table.
#[derive(Debug)]
pub struct KvmIrqfdRouter {
    vm: OwnedFd,
    intx_gsi: [u32; 4],
}

impl KvmIrqfdRouter {
    pub fn new(vm: OwnedFd, intx_gsi: [u32; 4]) -> Self {
        Self { vm, intx_gsi }
    }

    fn irqfd(&self, gsi: u32, fd: RawFd, resample: Option<RawFd>, flags: IrqfdFlags) -> io::Result<()> {
        let request = ioctl::kvm_irqfd {
            fd: fd as u32,
            gsi,
            flags: flags.bits(),
            resamplefd: resample.unwrap_or(0) as u32,
            pad: [0; 16],
        };
        // SAFETY: the request struct matches the kernel layout and lives
        // for the duration of the call.
        unsafe { ioctl::kvm_irqfd(self.vm.as_raw_fd(), &request) }
            .map(drop)
            .map_err(io::Error::from)
    }
}

impl IntxRouter for KvmIrqfdRouter {
    fn route_intx(&self, intx: u8) -> Option<u32> {
        self.intx_gsi.get(intx as usize).copied()
    }

    fn assign(&self, gsi: u32, irq: BorrowedFd<'_>, resample: BorrowedFd<'_>) -> io::Result<()> {
        self.irqfd(
            gsi,
            irq.as_raw_fd(),
            Some(resample.as_raw_fd()),
            IrqfdFlags::RESAMPLE,
        )
    }

    fn deassign(&self, gsi: u32, irq: BorrowedFd<'_>) -> io::Result<()> {
        self.irqfd(gsi, irq.as_raw_fd(), None, IrqfdFlags::DEASSIGN)
    }
}

/// Interrupt and resample notifiers shared with one remote device, plus the
/// routing entry that currently binds them to a GSI.
pub struct InterruptForwarder {
    device_id: String,
    pin: u8,
    irq: EventNotifier,
    resample: EventNotifier,
    router: Arc<dyn IntxRouter>,
    active_gsi: Mutex<Option<u32>>,
    notifier: Mutex<Option<usize>>,
    retired: AtomicBool,
}

impl std::fmt::Debug for InterruptForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptForwarder")
            .field("device_id", &self.device_id)
            .field("pin", &self.pin)
            .field("active_gsi", &self.active_gsi())
            .finish()
    }
}

impl InterruptForwarder {
    /// Hands fresh notifiers to the remote with SET_IRQFD, installs the
    /// routing entry and subscribes to routing changes.
    pub fn setup(
        link: &ProxyLink,
        device_id: Option<&str>,
        pin: u8,
        router: Arc<dyn IntxRouter>,
    ) -> ProxyResult<Arc<Self>> {
        let Some(device_id) = device_id.filter(|id| !id.is_empty()) else {
            tracing::error!("{}: interrupt setup needs a device id", link.label());
            return Err(ProxyError::Configuration(
                "device id is required for interrupt setup".into(),
            ));
        };

        let io_err = |e: io::Error| ProxyError::Transport(e.to_string());
        let irq = EventNotifier::new().map_err(io_err)?;
        let resample = EventNotifier::new().map_err(io_err)?;

        let msg = Message::set_irqfd(
            pin as i32 - 1,
            irq.try_clone_fd().map_err(io_err)?,
            resample.try_clone_fd().map_err(io_err)?,
        )
        .with_device_id(Some(device_id));
        link.send(&msg)?;

        let forwarder = Arc::new(Self {
            device_id: device_id.to_owned(),
            pin,
            irq,
            resample,
            router: Arc::clone(&router),
            active_gsi: Mutex::new(None),
            notifier: Mutex::new(None),
            retired: AtomicBool::new(false),
        });
        // A failed assign leaves the device without interrupts until the
        // next routing change; the remote already holds its notifiers.
        if let Err(e) = forwarder.update_routing() {
            tracing::error!(device = %device_id, "Interrupts not routed: {}", e);
        }

        let weak: Weak<Self> = Arc::downgrade(&forwarder);
        let key = router.add_routing_notifier(Arc::new(move || {
            if let Some(forwarder) = weak.upgrade() {
                if let Err(e) = forwarder.update_routing() {
                    tracing::error!(
                        device = %forwarder.device_id,
                        "failed to follow interrupt routing change: {}",
                        e
                    );
                }
            }
        }));
        *forwarder.notifier.lock().unwrap_or_else(|e| e.into_inner()) = key;
        Ok(forwarder)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn irq(&self) -> &EventNotifier {
        &self.irq
    }

    pub fn resample(&self) -> &EventNotifier {
        &self.resample
    }

    pub fn active_gsi(&self) -> Option<u32> {
        *self.active_gsi.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rebuilds the routing entry for the current INTx route. The previous
    /// entry is always removed before a new one is installed.
    pub fn update_routing(&self) -> ProxyResult<()> {
        let mut active = self.active_gsi.lock().unwrap_or_else(|e| e.into_inner());
        self.deassign_locked(&mut active);

        if self.pin == 0 || self.retired.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(gsi) = self.router.route_intx(self.pin - 1) else {
            tracing::warn!(device = %self.device_id, pin = self.pin, "INTx is not routed");
            return Ok(());
        };
        self.router
            .assign(gsi, self.irq.as_fd(), self.resample.as_fd())
            .map_err(|e| ProxyError::Transport(format!("irqfd assign on gsi {}: {}", gsi, e)))?;
        *active = Some(gsi);
        tracing::debug!(device = %self.device_id, gsi, "interrupt routed");
        Ok(())
    }

    /// Removes the routing entry, if any, and unsubscribes from routing
    /// changes.
    pub fn teardown(&self) {
        self.retired.store(true, Ordering::Release);
        if let Some(key) = self
            .notifier
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            self.router.remove_routing_notifier(key);
        }
        let mut active = self.active_gsi.lock().unwrap_or_else(|e| e.into_inner());
        self.deassign_locked(&mut active);
    }

    fn deassign_locked(&self, active: &mut Option<u32>) {
        if let Some(gsi) = active.take() {
            if let Err(e) = self.router.deassign(gsi, self.irq.as_fd()) {
                tracing::warn!(device = %self.device_id, gsi, "irqfd deassign failed: {}", e);
            }
        }
    }
}

impl Drop for InterruptForwarder {
    fn drop(&mut self) {
        self.teardown();
    }
}
