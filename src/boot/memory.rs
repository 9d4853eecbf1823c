//! Guest physical memory management using vm-memory.
//!
//! This module wraps `vm_memory::GuestMemoryMmap` to provide guest memory for
//! the virtual machine. The vm-memory crate is the standard abstraction used
//! across the rust-vmm ecosystem.
//!
//! # Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────┐
//!             │ MMIO (GIC, UART)│
//! 0x4000_0000 ├─────────────────┤ RAM_BASE
//!             │ Kernel Image    │ ← loaded at RAM_BASE + text_offset
//!             │ ...             │
//!             │ Initramfs       │ ← RAM_BASE + 128 MiB, page-aligned
//!             │ DTB             │ ← right after initramfs, page-aligned
//!             │ ...             │
//! RAM_BASE+sz └─────────────────┘
//! ```
//!
//! Unlike x86, where guest RAM conventionally starts at address 0, ARM64
//! platforms reserve low guest-physical addresses for MMIO (the GIC and
//! UART live below `RAM_BASE`), so the single RAM region starts at
//! `RAM_BASE`.

use super::BootError;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

/// Guest physical base address of RAM.
pub const RAM_BASE: u64 = 0x4000_0000;

/// Guest physical memory region backed by vm-memory.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    size: u64,
}

impl GuestMemory {
    /// Allocate a new guest memory region of `size` bytes starting at
    /// [`RAM_BASE`]. The memory is readable/writable, private, and
    /// anonymous.
    pub fn new(size: u64) -> Result<Self, BootError> {
        let regions = vec![(GuestAddress(RAM_BASE), size as usize)];

        let inner = GuestMemoryMmap::from_ranges(&regions).map_err(|e| {
            BootError::MemoryAllocation(std::io::Error::other(format!(
                "Failed to create guest memory: {}",
                e
            )))
        })?;

        Ok(Self { inner, size })
    }

    /// Get raw parts for KVM memory region registration.
    ///
    /// Returns `(guest_phys_addr, host_virtual_address, size)` for use with
    /// `set_user_memory_region`.
    pub fn as_raw_parts(&self) -> (u64, u64, u64) {
        let region = self.inner.iter().next().expect("memory has no regions");
        let host_addr = region.as_ptr() as u64;
        (RAM_BASE, host_addr, self.size)
    }

    /// Total size of the region in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Write bytes at a guest physical address.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), BootError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|e| {
                BootError::OutOfRange(format!(
                    "write of {} bytes to {:#x} exceeds guest memory: {}",
                    data.len(),
                    addr,
                    e
                ))
            })
    }

    /// Write a 32-bit value at a guest physical address (little-endian).
    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), BootError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Write a 64-bit value at a guest physical address (little-endian).
    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), BootError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Read bytes from a guest physical address into a buffer.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), BootError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|e| {
                BootError::OutOfRange(format!(
                    "read of {} bytes from {:#x} exceeds guest memory: {}",
                    data.len(),
                    addr,
                    e
                ))
            })
    }

    /// Load an entire file's contents at a guest physical address. Returns
    /// the number of bytes written.
    pub fn load_file(&self, addr: u64, path: &str) -> Result<u64, BootError> {
        let bytes = std::fs::read(path).map_err(BootError::ReadFile)?;
        self.write(addr, &bytes)?;
        Ok(bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_vec(mem: &GuestMemory, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        mem.read(addr, &mut data).unwrap();
        data
    }

    #[test]
    fn test_allocate() {
        let mem = GuestMemory::new(4096).unwrap();
        let (gpa, _, size) = mem.as_raw_parts();
        assert_eq!(gpa, RAM_BASE);
        assert_eq!(size, 4096);
    }

    #[test]
    fn test_write_read() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write(RAM_BASE, &[1, 2, 3, 4]).unwrap();
        assert_eq!(read_vec(&mem, RAM_BASE, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_write_u32() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write_u32(RAM_BASE + 100, 0x12345678).unwrap();
        assert_eq!(
            read_vec(&mem, RAM_BASE + 100, 4),
            vec![0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_write_u64() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write_u64(RAM_BASE + 100, 0x123456789abcdef0).unwrap();
        assert_eq!(
            read_vec(&mem, RAM_BASE + 100, 8),
            vec![0xf0, 0xde, 0xbc, 0x9a, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_write_out_of_bounds() {
        let mem = GuestMemory::new(100).unwrap();
        assert!(mem.write(RAM_BASE + 99, &[1, 2]).is_err());
    }

    #[test]
    fn test_read_out_of_bounds() {
        let mem = GuestMemory::new(100).unwrap();
        let mut buf = [0u8; 2];
        assert!(mem.read(RAM_BASE + 99, &mut buf).is_err());
    }

    #[test]
    fn addresses_below_ram_base_are_out_of_range() {
        let mem = GuestMemory::new(4096).unwrap();
        let mut buf = [0u8; 2];
        assert!(mem.read(0, &mut buf).is_err());
    }
}
