//! Boot orchestration for a Linux kernel on ARM64.
//!
//! This module implements the arm64 Linux boot protocol, allowing the VMM
//! to load and execute a kernel `Image` directly without UEFI or a
//! traditional bootloader.
//!
//! # Boot Protocol Overview
//!
//! <https://www.kernel.org/doc/html/latest/arch/arm64/booting.html>
//!
//! The boot process requires:
//!
//! 1. **Kernel loading**: the `Image` file is copied verbatim into guest
//!    RAM at `RAM_BASE + text_offset` (see [`image`]).
//! 2. **Device tree**: a flattened device tree describing memory, CPUs,
//!    the GIC, the timer, and the UART is generated and placed in guest
//!    RAM (see [`dtb`]).
//! 3. **CPU state**: a single register, `X0`, points the kernel at the
//!    DTB; `PC` points at the kernel entry point; `PSTATE` selects EL1h
//!    with all asynchronous exceptions masked. The kernel brings up its
//!    own MMU, exception vectors, and stack.
//!
//! # Memory Layout
//!
//! ```text
//! RAM_BASE            ┌─────────────────┐
//!                      │ Kernel Image    │ loaded at RAM_BASE + text_offset
//!                      │ ...             │
//! RAM_BASE + 128 MiB   ├─────────────────┤ initrd_addr (4 KiB aligned)
//!                      │ Initramfs       │ (optional)
//!                      ├─────────────────┤ dtb_addr (4 KiB aligned)
//!                      │ DTB             │
//!                      │ ...             │
//! RAM_BASE + ram_size  └─────────────────┘
//! ```
//!
//! The 128 MiB gap exists because the kernel's early memory allocator
//! starts immediately above the loaded image and can clobber whatever
//! follows it; a generous fixed offset avoids having to model the
//! allocator to predict a safe placement.

pub mod dtb;
pub mod image;
mod memory;

pub use memory::{GuestMemory, RAM_BASE};

use crate::kvm::{KvmError, VcpuFd};
use image::KernelImage;
use thiserror::Error;

/// Guest physical memory layout constants.
pub mod layout {
    /// Gap reserved above the kernel image before placing the initramfs,
    /// to stay clear of the kernel's early memory allocator.
    pub const INITRD_GAP: u64 = 128 * 1024 * 1024;

    /// Alignment applied to the initramfs and DTB placement addresses.
    pub const PLACEMENT_ALIGN: u64 = 4096;

    /// Maximum kernel command line length the DTB `bootargs` property and
    /// the kernel's cmdline buffer can hold.
    pub const CMDLINE_MAX_SIZE: usize = 2048;

    /// Default guest memory size (512 MiB).
    pub const DEFAULT_MEM_SIZE: u64 = 512 * 1024 * 1024;

    /// Default kernel command line; `earlycon` lets the guest print before
    /// the regular PL011 driver binds.
    pub const DEFAULT_CMDLINE: &str = "console=ttyAMA0 earlycon=pl011,0x09000000";

    pub const fn align_up(addr: u64, align: u64) -> u64 {
        (addr + align - 1) & !(align - 1)
    }
}

/// Errors that can occur during boot setup.
#[derive(Error, Debug)]
pub enum BootError {
    #[error("failed to allocate guest memory: {0}")]
    MemoryAllocation(#[source] std::io::Error),

    #[error("guest memory access out of range: {0}")]
    OutOfRange(String),

    #[error("KVM error: {0}")]
    Kvm(#[from] KvmError),

    #[error("failed to read file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("kernel image too small: {0} bytes")]
    KernelTooSmall(usize),

    #[error("bad kernel image magic: {0:#x} (expected 0x644d5241)")]
    BadMagic(u32),

    #[error("command line too long: {len} bytes (max {max})")]
    CmdlineTooLong { len: usize, max: usize },

    #[error("no DTB available to load")]
    MissingDtb,

    #[error("device tree generation failed")]
    DtbGeneration,

    #[error("guest memory layout overflow: {0} exceeds ram size")]
    LayoutOverflow(String),
}

/// Addresses and sizes of everything the boot loader placed in guest RAM.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    pub kernel_addr: u64,
    pub kernel_size: u64,
    pub initrd_addr: u64,
    pub initrd_size: u64,
    pub dtb_addr: u64,
    pub dtb_size: u64,
}

/// Load a kernel, optional initramfs, and device tree into guest memory.
///
/// Returns the addresses the vCPU and DTB `/chosen` node need to agree on.
pub fn load(
    memory: &GuestMemory,
    kernel_path: &str,
    initrd_path: Option<&str>,
    dtb_bytes: &[u8],
) -> Result<BootInfo, BootError> {
    let kernel = KernelImage::load(kernel_path)?;
    let kernel_addr = RAM_BASE + kernel.text_offset;
    memory.write(kernel_addr, &kernel.bytes)?;
    let kernel_size = kernel.bytes.len() as u64;
    let kernel_end = kernel_addr + kernel_size;

    let initrd_addr = layout::align_up(RAM_BASE + layout::INITRD_GAP, layout::PLACEMENT_ALIGN);
    let mut initrd_size = 0u64;
    if let Some(path) = initrd_path {
        let bytes = std::fs::read(path).map_err(BootError::ReadFile)?;
        initrd_size = bytes.len() as u64;
        check_fits(memory, initrd_addr, initrd_size)?;
        memory.write(initrd_addr, &bytes)?;
    }

    let dtb_base = if initrd_size > 0 {
        initrd_addr + initrd_size
    } else {
        kernel_end
    };
    let dtb_addr = layout::align_up(dtb_base, layout::PLACEMENT_ALIGN);
    let dtb_size = dtb_bytes.len() as u64;
    check_fits(memory, dtb_addr, dtb_size)?;
    memory.write(dtb_addr, dtb_bytes)?;

    Ok(BootInfo {
        kernel_addr,
        kernel_size,
        initrd_addr,
        initrd_size,
        dtb_addr,
        dtb_size,
    })
}

fn check_fits(memory: &GuestMemory, addr: u64, size: u64) -> Result<(), BootError> {
    if addr + size > RAM_BASE + memory.size() {
        return Err(BootError::LayoutOverflow(format!(
            "{addr:#x}..{:#x}",
            addr + size
        )));
    }
    Ok(())
}

/// PSTATE for EL1h with all asynchronous exceptions masked, re-exported
/// from [`crate::kvm::vcpu`] so callers only need this module.
pub use crate::kvm::vcpu::PSTATE_EL1H_MASKED;

/// Provisional VBAR_EL1/SP values programmed purely to aid early crash
/// diagnostics before the kernel installs its own; the kernel overwrites
/// both during boot.
const PROVISIONAL_VBAR_EL1: u64 = 0;
const PROVISIONAL_SP: u64 = 0;

/// Program a vCPU's initial architectural state per the arm64 Linux boot
/// protocol: `X0` holds the DTB address, `PC` the kernel entry point,
/// `PSTATE` selects EL1h with exceptions masked. The MMU is left off; the
/// kernel's own early init code enables it.
pub fn setup_vcpu(vcpu: &VcpuFd, boot_info: &BootInfo) -> Result<(), BootError> {
    vcpu.set_x_reg(0, boot_info.dtb_addr)?;
    vcpu.set_x_reg(1, 0)?;
    vcpu.set_x_reg(2, 0)?;
    vcpu.set_x_reg(3, 0)?;
    vcpu.set_pc(boot_info.kernel_addr)?;
    vcpu.set_pstate(PSTATE_EL1H_MASKED)?;
    vcpu.set_sys_reg(crate::kvm::vcpu::sysreg::VBAR_EL1, PROVISIONAL_VBAR_EL1)?;
    vcpu.set_sp(PROVISIONAL_SP)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(layout::align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(layout::align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(layout::align_up(0, 0x1000), 0);
    }

    #[test]
    fn initrd_addr_is_128mib_above_ram_base() {
        let addr = layout::align_up(RAM_BASE + layout::INITRD_GAP, layout::PLACEMENT_ALIGN);
        assert_eq!(addr, RAM_BASE + 128 * 1024 * 1024);
    }
}
