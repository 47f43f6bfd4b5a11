// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Local configuration space and bar metadata of a proxied PCI function.
//!
//! Accesses are applied here first; the remote process may then override the
//! observed value.

pub use labwired_proxy_config::BarKind;

pub const CONFIG_SPACE_SIZE: usize = 256;

pub const PCI_VENDOR_ID: u32 = 0x00;
pub const PCI_DEVICE_ID: u32 = 0x02;
pub const PCI_COMMAND: u32 = 0x04;
pub const PCI_STATUS: u32 = 0x06;
pub const PCI_CLASS_REVISION: u32 = 0x08;
pub const PCI_CACHE_LINE_SIZE: u32 = 0x0c;
pub const PCI_BASE_ADDRESS_0: u32 = 0x10;
pub const PCI_INTERRUPT_LINE: u32 = 0x3c;
pub const PCI_INTERRUPT_PIN: u32 = 0x3d;
/// Start of the device-specific region.
pub const PCI_CONFIG_HEADER_END: u32 = 0x40;

const BAR_SPACE_IO: u32 = 0x1;

/// One base address register of the proxied function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarInfo {
    pub index: u8,
    pub kind: BarKind,
    pub size: u64,
    /// Current base, once assigned.
    pub base: Option<u64>,
}

impl BarInfo {
    pub fn is_memory(&self) -> bool {
        self.kind == BarKind::Memory
    }

    /// Whether an access of `size` bytes at `offset` stays inside the region.
    pub fn contains(&self, offset: u64, size: u32) -> bool {
        offset
            .checked_add(size as u64)
            .is_some_and(|end| end <= self.size)
    }

    fn register(&self) -> u32 {
        PCI_BASE_ADDRESS_0 + 4 * self.index as u32
    }
}

/// Byte-addressed standard header plus device-specific space, with a
/// per-byte write mask.
#[derive(Clone)]
pub struct ConfigSpace {
    data: [u8; CONFIG_SPACE_SIZE],
    wmask: [u8; CONFIG_SPACE_SIZE],
}

impl std::fmt::Debug for ConfigSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSpace")
            .field("vendor_id", &format_args!("{:#06x}", self.read(PCI_VENDOR_ID, 2)))
            .field("device_id", &format_args!("{:#06x}", self.read(PCI_DEVICE_ID, 2)))
            .finish()
    }
}

impl Default for ConfigSpace {
    fn default() -> Self {
        Self::new(0xffff, 0xffff, 0, 0)
    }
}

impl ConfigSpace {
    pub fn new(vendor_id: u16, device_id: u16, class_revision: u32, interrupt_pin: u8) -> Self {
        let mut space = Self {
            data: [0; CONFIG_SPACE_SIZE],
            wmask: [0; CONFIG_SPACE_SIZE],
        };
        space.store(PCI_VENDOR_ID, vendor_id as u32, 2);
        space.store(PCI_DEVICE_ID, device_id as u32, 2);
        space.store(PCI_CLASS_REVISION, class_revision, 4);
        space.store(PCI_INTERRUPT_PIN, interrupt_pin as u32, 1);

        space.set_wmask(PCI_COMMAND, 0x0547, 2);
        space.set_wmask(PCI_CACHE_LINE_SIZE, 0xffff, 2);
        space.set_wmask(PCI_INTERRUPT_LINE, 0xff, 1);
        for b in &mut space.wmask[PCI_CONFIG_HEADER_END as usize..] {
            *b = 0xff;
        }
        space
    }

    /// Little-endian read of `len` bytes (1, 2 or 4). Bytes past the end of
    /// the space read as ones.
    pub fn read(&self, addr: u32, len: u32) -> u32 {
        let mut value = 0u32;
        for i in (0..len.min(4)).rev() {
            let byte = addr
                .checked_add(i)
                .and_then(|a| self.data.get(a as usize))
                .copied()
                .unwrap_or(0xff);
            value = (value << 8) | byte as u32;
        }
        value
    }

    /// Little-endian write honoring the write mask.
    pub fn write(&mut self, addr: u32, value: u32, len: u32) {
        for i in 0..len.min(4) {
            let Some(idx) = addr.checked_add(i).map(|a| a as usize) else {
                break;
            };
            if idx >= CONFIG_SPACE_SIZE {
                break;
            }
            let byte = (value >> (8 * i)) as u8;
            let mask = self.wmask[idx];
            self.data[idx] = (self.data[idx] & !mask) | (byte & mask);
        }
    }

    pub fn interrupt_pin(&self) -> u8 {
        self.read(PCI_INTERRUPT_PIN, 1) as u8
    }

    /// Installs a bar register: kind bit, initial base, and a write mask that
    /// keeps the address aligned to the region size.
    pub fn register_bar(&mut self, bar: &BarInfo) {
        let reg = bar.register();
        let size = bar
            .size
            .clamp(if bar.is_memory() { 16 } else { 4 }, 1 << 31);
        let mask = !(size.next_power_of_two() as u32 - 1);
        let flags = if bar.is_memory() { 0 } else { BAR_SPACE_IO };
        self.set_wmask(reg, mask, 4);
        self.store(reg, (bar.base.unwrap_or(0) as u32 & mask) | flags, 4);
    }

    /// Address currently programmed into bar `index`, or None when unset.
    pub fn bar_address(&self, index: u8) -> Option<u64> {
        let value = self.read(PCI_BASE_ADDRESS_0 + 4 * index as u32, 4);
        let addr = if value & BAR_SPACE_IO != 0 {
            value & !0x3
        } else {
            value & !0xf
        };
        (addr != 0).then_some(addr as u64)
    }

    fn store(&mut self, addr: u32, value: u32, len: u32) {
        for i in 0..len {
            self.data[(addr + i) as usize] = (value >> (8 * i)) as u8;
        }
    }

    fn set_wmask(&mut self, addr: u32, mask: u32, len: u32) {
        for i in 0..len {
            self.wmask[(addr + i) as usize] = (mask >> (8 * i)) as u8;
        }
    }
}
