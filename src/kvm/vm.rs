//! Virtual Machine creation and memory management.
//!
//! This module handles VM-level KVM operations: registering guest memory
//! regions and creating vCPUs. Unlike x86, ARM64 VM setup needs no TSS, IRQ
//! chip, or PIT — the platform interrupt controller is a separate in-kernel
//! device (see [`crate::gic`]) created by the caller between `create_vm()`
//! and the first `create_vcpu()` call.
//!
//! # Memory Regions
//!
//! Guest memory is managed through "memory slots". Each slot maps a range of
//! guest physical addresses to host virtual addresses:
//!
//! ```text
//! Guest Physical          Host Virtual
//! ┌──────────────┐       ┌──────────────┐
//! │ 0x40000000   │ ────► │ mmap'd region│
//! │              │       │              │
//! └──────────────┘       └──────────────┘
//! ```
//!
//! KVM uses stage-2 page tables to translate guest physical addresses to host
//! physical addresses.

use super::{KvmError, VcpuFd};
use kvm_bindings::{kvm_userspace_memory_region, kvm_vcpu_init, KVM_ARM_VCPU_PSCI_0_2};

/// Wrapper around the KVM VM file descriptor.
pub struct VmFd {
    vm: kvm_ioctls::VmFd,
    /// Size in bytes of the shared `kvm_run` page, as reported by KVM.
    run_mmap_size: usize,
}

impl VmFd {
    pub(super) fn new(vm: kvm_ioctls::VmFd, run_mmap_size: usize) -> Self {
        Self { vm, run_mmap_size }
    }

    /// Access to the raw `kvm_ioctls::VmFd`, used by the GIC driver to create
    /// its in-kernel device and by the run loop to inject interrupt lines.
    pub fn raw(&self) -> &kvm_ioctls::VmFd {
        &self.vm
    }

    /// Register a guest memory region with KVM.
    ///
    /// This maps a range of guest physical addresses to a region of host
    /// virtual memory. After registration, guest accesses to these physical
    /// addresses transparently access the host memory.
    ///
    /// # Safety
    ///
    /// The caller must ensure the host memory region remains valid and is not
    /// freed for as long as any vCPU can run, and that it doesn't overlap
    /// with another registered region.
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags: 0,
        };

        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    /// Create a new virtual CPU.
    ///
    /// This creates the vCPU fd, queries the preferred initial architectural
    /// target for the host CPU, requests the PSCI v0.2 feature (so the guest
    /// can power off/reset via HVC), initializes the vCPU with
    /// `KVM_ARM_VCPU_INIT`, and maps the shared `kvm_run` page.
    ///
    /// # Multi-vCPU Support
    ///
    /// The GIC must already be created and have its addresses configured
    /// before any vCPU is created. vCPU 0 is the only one programmed with an
    /// entry point and DTB pointer by the boot loader; secondary vCPUs start
    /// powered off, awaiting a PSCI `CPU_ON` call from the guest.
    pub fn create_vcpu(&self, id: u64) -> Result<VcpuFd, KvmError> {
        let vcpu = self.vm.create_vcpu(id).map_err(KvmError::CreateVcpu)?;

        let mut kvi = kvm_vcpu_init::default();
        self.vm
            .get_preferred_target(&mut kvi)
            .map_err(KvmError::PreferredTarget)?;
        kvi.features[0] |= 1 << KVM_ARM_VCPU_PSCI_0_2;

        vcpu.vcpu_init(&kvi).map_err(KvmError::VcpuInit)?;

        log::debug!("[KVM] vCPU {id} initialized (features={:#x})", kvi.features[0]);

        VcpuFd::new(vcpu, self.run_mmap_size)
    }
}
