//! KVM (Kernel-based Virtual Machine) wrapper module.
//!
//! This module provides a safe Rust interface to Linux KVM for hardware-assisted
//! virtualization on ARM64. KVM operates as a kernel module that turns Linux into
//! a hypervisor. The VMM (Virtual Machine Monitor, i.e., us) communicates with KVM
//! through ioctls on:
//!
//! - `/dev/kvm` - System-level operations (check capabilities, create VMs)
//! - VM file descriptor - VM-level operations (create vCPUs, set memory, attach GIC)
//! - vCPU file descriptor - vCPU-level operations (run, get/set registers)
//!
//! ```text
//! User Space (VMM)                    Kernel Space (KVM)
//! ┌──────────────┐                   ┌──────────────────┐
//! │   VmFd ───────┼──────────────────►│  VM State        │
//! │   VcpuFd ─────┼──────────────────►│  vCPU State      │
//! └──────────────┘                   └────────┬─────────┘
//!                                             │
//!                                    ┌────────▼─────────┐
//!                                    │  CPU Hardware    │
//!                                    │  (ARM VHE/EL2)   │
//!                                    └──────────────────┘
//! ```
//!
//! # VM Execution Model
//!
//! The vCPU runs in a loop:
//!
//! 1. VMM calls `vcpu.run()` - control transfers to guest
//! 2. Guest executes until a VM exit occurs (MMIO, PSCI system event, signal)
//! 3. KVM returns control to VMM with exit reason
//! 4. VMM handles the exit (device emulation, shutdown, ...)
//! 5. VMM calls `vcpu.run()` again
//!
//! Unlike x86, ARM64 has no I/O port space: devices are exposed purely through
//! MMIO, and the platform interrupt controller (GICv3) is a separate in-kernel
//! device rather than part of `VmFd` initialization.

pub mod vcpu;
mod vm;

pub use vcpu::{ExitReason, VcpuFd};
pub use vm::VmFd;

use kvm_ioctls::Kvm;
use thiserror::Error;

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open /dev/kvm device.
    ///
    /// This usually means:
    /// - KVM is not available (not running on Linux, or KVM module not loaded)
    /// - Insufficient permissions (user not in kvm group)
    /// - Running in a VM without nested virtualization enabled
    #[error("Failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    /// Failed to create a new VM.
    #[error("Failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    /// Failed to create a vCPU.
    #[error("Failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    /// Failed to query the preferred vCPU target.
    #[error("Failed to query preferred vCPU target: {0}")]
    PreferredTarget(#[source] kvm_ioctls::Error),

    /// Failed to initialize a vCPU (KVM_ARM_VCPU_INIT).
    #[error("Failed to initialize vCPU: {0}")]
    VcpuInit(#[source] kvm_ioctls::Error),

    /// Failed to register guest memory with KVM.
    #[error("Failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    /// Failed to set a single register via KVM_SET_ONE_REG.
    #[error("Failed to set register {0:#x}: {1}")]
    SetOneReg(u64, #[source] kvm_ioctls::Error),

    /// Failed to get a single register via KVM_GET_ONE_REG.
    #[error("Failed to get register {0:#x}: {1}")]
    GetOneReg(u64, #[source] kvm_ioctls::Error),

    /// Failed to run vCPU.
    #[error("Failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    /// Failed to map the shared kvm_run page.
    #[error("Failed to map kvm_run page: {0}")]
    MmapRun(#[source] std::io::Error),
}

/// Open the KVM device and create a new virtual machine.
///
/// This function opens `/dev/kvm` and asks the kernel for a new VM. It performs
/// no further setup: the GIC, guest memory, and vCPUs are all created afterward
/// by the caller, in that order (the GIC must exist before any vCPU, see
/// [`crate::gic`]).
///
/// # Errors
///
/// Returns an error if KVM is not available or accessible, or if VM creation
/// fails.
pub fn create_vm() -> Result<VmFd, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;
    let vm = kvm.create_vm().map_err(KvmError::CreateVm)?;
    let run_mmap_size = kvm.get_vcpu_mmap_size().map_err(KvmError::CreateVm)?;
    Ok(VmFd::new(vm, run_mmap_size))
}
