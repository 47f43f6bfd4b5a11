// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::proxy::ProxyDevice;
use std::sync::{Arc, Mutex, MutexGuard};

/// Devices currently attached, in attach order. All mutation happens under
/// the registry lock.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<Vec<Arc<ProxyDevice>>>,
}

impl DeviceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<ProxyDevice>>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds `device`; returns the new size. Linking the same device twice is
    /// a no-op.
    pub fn link(&self, device: Arc<ProxyDevice>) -> usize {
        let mut devices = self.lock();
        if !devices.iter().any(|d| Arc::ptr_eq(d, &device)) {
            devices.push(device);
        }
        devices.len()
    }

    /// Removes `device` by identity. Returns whether it was present.
    pub fn unlink(&self, device: &Arc<ProxyDevice>) -> bool {
        let mut devices = self.lock();
        let before = devices.len();
        devices.retain(|d| !Arc::ptr_eq(d, device));
        devices.len() != before
    }

    pub fn contains(&self, device: &Arc<ProxyDevice>) -> bool {
        self.lock().iter().any(|d| Arc::ptr_eq(d, device))
    }

    pub fn find(&self, id: &str) -> Option<Arc<ProxyDevice>> {
        self.lock().iter().find(|d| d.config().id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the membership, so callers can block on devices without
    /// holding the lock.
    pub fn snapshot(&self) -> Vec<Arc<ProxyDevice>> {
        self.lock().clone()
    }
}
