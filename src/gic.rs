//! GICv3 (Generic Interrupt Controller v3) driver.
//!
//! The platform interrupt controller is virtualized entirely in-kernel; this
//! module only drives its KVM device-attribute interface: create the device,
//! program the distributor/redistributor base addresses, finalize it, and
//! assert/deassert interrupt lines on behalf of emulated devices.
//!
//! The GIC must be created after the VM and before any vCPU (`KVM_ARM_VCPU_INIT`
//! consults the GIC's presence), and must be finalized before the first
//! `KVM_RUN`.

use kvm_bindings::{
    kvm_device_attr, KVM_DEV_ARM_VGIC_CTRL_INIT, KVM_DEV_ARM_VGIC_GRP_ADDR,
    KVM_DEV_ARM_VGIC_GRP_CTRL, KVM_DEV_TYPE_ARM_VGIC_V3, KVM_VGIC_V3_ADDR_TYPE_DIST,
    KVM_VGIC_V3_ADDR_TYPE_REDIST,
};
use kvm_ioctls::DeviceFd;
use thiserror::Error;

use crate::kvm::VmFd;

/// GICv3 distributor base address and size.
pub const DIST_BASE: u64 = 0x0800_0000;
pub const DIST_SIZE: u64 = 0x0001_0000;

/// GICv3 redistributor base address and size (one 128 KiB stride per vCPU,
/// sized here for a single vCPU).
pub const REDIST_BASE: u64 = 0x080A_0000;
pub const REDIST_SIZE: u64 = 0x0010_0000;

/// Errors from GIC setup or interrupt injection.
#[derive(Error, Debug)]
pub enum GicError {
    #[error("failed to create GICv3 device: {0}")]
    CreateDevice(#[source] kvm_ioctls::Error),

    #[error("failed to set GIC distributor address: {0}")]
    SetDistAddr(#[source] kvm_ioctls::Error),

    #[error("failed to set GIC redistributor address: {0}")]
    SetRedistAddr(#[source] kvm_ioctls::Error),

    #[error("failed to finalize GICv3: {0}")]
    Finalize(#[source] kvm_ioctls::Error),

    #[error("interrupt line operation attempted before GIC was finalized")]
    NotFinalized,

    #[error("failed to set IRQ line {0}: {1}")]
    InjectFailed(u32, #[source] kvm_ioctls::Error),
}

/// Interrupt kind, encoded into bits 31..24 of the `KVM_IRQ_LINE` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqKind {
    /// Shared Peripheral Interrupt (ids 0..=987, exposed starting at 32).
    Spi,
    /// Private Peripheral Interrupt (ids 16..=31).
    Ppi,
}

/// Encode a GIC interrupt line for the `KVM_IRQ_LINE` ioctl.
///
/// Bits 31..24 carry the kind (1 = SPI, 2 = PPI), bits 23..16 the target CPU
/// index (ignored for SPIs), bits 15..0 the GIC interrupt ID.
fn encode_irq(kind: IrqKind, cpu: u32, irq_id: u32) -> u32 {
    let kind_bits: u32 = match kind {
        IrqKind::Spi => 1,
        IrqKind::Ppi => 2,
    };
    (kind_bits << 24) | ((cpu & 0xff) << 16) | (irq_id & 0xffff)
}

/// Handle to the in-kernel GICv3 device.
pub struct Gic {
    fd: DeviceFd,
    finalized: bool,
}

impl Gic {
    /// Create the GICv3 device. Must be called before any vCPU is created.
    pub fn create(vm: &VmFd) -> Result<Self, GicError> {
        let mut device = kvm_bindings::kvm_create_device {
            type_: KVM_DEV_TYPE_ARM_VGIC_V3,
            fd: 0,
            flags: 0,
        };
        let fd = vm
            .raw()
            .create_device(&mut device)
            .map_err(GicError::CreateDevice)?;
        Ok(Self {
            fd,
            finalized: false,
        })
    }

    /// Program the distributor and redistributor base addresses.
    pub fn set_addresses(&self, dist_base: u64, redist_base: u64) -> Result<(), GicError> {
        let dist_attr = kvm_device_attr {
            group: KVM_DEV_ARM_VGIC_GRP_ADDR,
            attr: u64::from(KVM_VGIC_V3_ADDR_TYPE_DIST),
            addr: &dist_base as *const u64 as u64,
            flags: 0,
        };
        self.fd
            .set_device_attr(&dist_attr)
            .map_err(GicError::SetDistAddr)?;

        let redist_attr = kvm_device_attr {
            group: KVM_DEV_ARM_VGIC_GRP_ADDR,
            attr: u64::from(KVM_VGIC_V3_ADDR_TYPE_REDIST),
            addr: &redist_base as *const u64 as u64,
            flags: 0,
        };
        self.fd
            .set_device_attr(&redist_attr)
            .map_err(GicError::SetRedistAddr)?;

        Ok(())
    }

    /// Finalize the GIC. Must be called before the first `KVM_RUN`.
    pub fn finalize(&mut self) -> Result<(), GicError> {
        let attr = kvm_device_attr {
            group: KVM_DEV_ARM_VGIC_GRP_CTRL,
            attr: u64::from(KVM_DEV_ARM_VGIC_CTRL_INIT),
            addr: 0,
            flags: 0,
        };
        self.fd.set_device_attr(&attr).map_err(GicError::Finalize)?;
        self.finalized = true;
        log::info!("[GIC] GICv3 finalized (dist={DIST_BASE:#x}, redist={REDIST_BASE:#x})");
        Ok(())
    }

    /// Assert or deassert a Shared Peripheral Interrupt line.
    pub fn set_spi_line(&self, vm: &VmFd, irq_id: u32, level: bool) -> Result<(), GicError> {
        self.set_line(vm, IrqKind::Spi, 0, irq_id, level)
    }

    fn set_line(
        &self,
        vm: &VmFd,
        kind: IrqKind,
        cpu: u32,
        irq_id: u32,
        level: bool,
    ) -> Result<(), GicError> {
        if !self.finalized {
            return Err(GicError::NotFinalized);
        }
        let irq = encode_irq(kind, cpu, irq_id);
        vm.raw()
            .set_irq_line(irq, level)
            .map_err(|e| GicError::InjectFailed(irq, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spi_encoding_uses_kind_one() {
        assert_eq!(encode_irq(IrqKind::Spi, 0, 33), (1 << 24) | 33);
    }

    #[test]
    fn ppi_encoding_carries_cpu_index() {
        assert_eq!(encode_irq(IrqKind::Ppi, 2, 30), (2 << 24) | (2 << 16) | 30);
    }
}
