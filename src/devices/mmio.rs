//! MMIO (Memory-Mapped I/O) bus and device registry.
//!
//! Routes MMIO accesses from the vCPU run loop to the device that owns the
//! guest physical address range. Unlike a discoverable bus (PCI, virtio-mmio
//! probing), every device here has a base address fixed by the generated
//! device tree, so dispatch is a simple linear range scan.
//!
//! Reads from an address with no owning device return zero rather than an
//! error; writes are silently ignored. A mis-wired or missing device should
//! not be able to kill the guest.

/// Trait for devices that respond to MMIO access.
pub trait MmioDevice {
    /// Handle an MMIO read at the given offset from the device's base.
    fn read(&mut self, offset: u64, data: &mut [u8]);

    /// Handle an MMIO write at the given offset from the device's base.
    fn write(&mut self, offset: u64, data: &[u8]);
}

/// A registered device on the MMIO bus.
struct MmioDeviceEntry {
    base: u64,
    size: u64,
    device: Box<dyn MmioDevice>,
}

/// MMIO bus that routes accesses to registered devices.
pub struct MmioBus {
    /// Registered devices sorted by base address. Ranges must not overlap.
    devices: Vec<MmioDeviceEntry>,
}

impl MmioBus {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    /// Register a device on the bus.
    ///
    /// # Panics
    ///
    /// Panics if the new range overlaps an already-registered device; this
    /// is a programming error in the platform's address map, not a runtime
    /// condition to recover from.
    pub fn register(&mut self, base: u64, size: u64, device: Box<dyn MmioDevice>) {
        let overlaps = self
            .devices
            .iter()
            .any(|e| base < e.base + e.size && e.base < base + size);
        assert!(!overlaps, "MMIO range {base:#x}..{:#x} overlaps an existing device", base + size);

        self.devices.push(MmioDeviceEntry { base, size, device });
        self.devices.sort_by_key(|e| e.base);
    }

    fn find_device(&mut self, addr: u64) -> Option<(&mut dyn MmioDevice, u64)> {
        for entry in &mut self.devices {
            if addr >= entry.base && addr < entry.base + entry.size {
                let offset = addr - entry.base;
                return Some((entry.device.as_mut(), offset));
            }
        }
        None
    }

    /// Handle an MMIO read from the guest. Unmapped addresses read as zero.
    pub fn read(&mut self, addr: u64, data: &mut [u8]) {
        if let Some((device, offset)) = self.find_device(addr) {
            device.read(offset, data);
        } else {
            log::debug!("[MMIO] read from unmapped address {addr:#x}");
            for byte in data.iter_mut() {
                *byte = 0;
            }
        }
    }

    /// Handle an MMIO write from the guest. Unmapped addresses are ignored.
    pub fn write(&mut self, addr: u64, data: &[u8]) {
        if let Some((device, offset)) = self.find_device(addr) {
            device.write(offset, data);
        } else {
            log::debug!("[MMIO] write to unmapped address {addr:#x}");
        }
    }
}

impl Default for MmioBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockDevice {
        value: u32,
    }

    impl MmioDevice for MockDevice {
        fn read(&mut self, offset: u64, data: &mut [u8]) {
            if offset == 0 && data.len() >= 4 {
                data[..4].copy_from_slice(&self.value.to_le_bytes());
            }
        }

        fn write(&mut self, offset: u64, data: &[u8]) {
            if offset == 0 && data.len() >= 4 {
                self.value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            }
        }
    }

    #[test]
    fn test_mmio_bus() {
        let mut bus = MmioBus::new();
        bus.register(0x1000, 0x100, Box::new(MockDevice { value: 0x12345678 }));

        let mut data = [0u8; 4];
        bus.read(0x1000, &mut data);
        assert_eq!(u32::from_le_bytes(data), 0x12345678);

        bus.write(0x1000, &0xDEADBEEFu32.to_le_bytes());
        bus.read(0x1000, &mut data);
        assert_eq!(u32::from_le_bytes(data), 0xDEADBEEF);
    }

    #[test]
    fn unmapped_read_returns_zero() {
        let mut bus = MmioBus::new();
        bus.register(0x1000, 0x100, Box::new(MockDevice { value: 1 }));

        let mut data = [0xAAu8; 4];
        bus.read(0x2000, &mut data);
        assert_eq!(data, [0u8; 4]);
    }

    #[test]
    fn unmapped_write_is_ignored() {
        let mut bus = MmioBus::new();
        // No devices registered at all; must not panic.
        bus.write(0x5000, &[1, 2, 3, 4]);
    }

    #[test]
    #[should_panic]
    fn overlapping_ranges_panic() {
        let mut bus = MmioBus::new();
        bus.register(0x1000, 0x100, Box::new(MockDevice { value: 0 }));
        bus.register(0x1080, 0x100, Box::new(MockDevice { value: 0 }));
    }
}
