//! Device emulation for the VMM.

pub mod mmio;
pub mod pl011;
pub mod timer;

pub use mmio::MmioBus;
pub use pl011::Pl011;

use std::rc::Rc;

use crate::gic::Gic;
use crate::kvm::VmFd;

/// A level-triggered interrupt line an emulated device can drive.
///
/// This indirection lets a device (the UART) assert/deassert interrupts
/// without knowing anything about the concrete interrupt controller, which
/// keeps the device testable with a recording stub instead of a real GIC.
pub trait IrqLine {
    fn set_level(&self, level: bool);
}

/// An [`IrqLine`] backed by a real GICv3 SPI.
pub struct GicIrqLine {
    gic: Rc<Gic>,
    vm: Rc<VmFd>,
    irq_id: u32,
}

impl GicIrqLine {
    pub fn new(gic: Rc<Gic>, vm: Rc<VmFd>, irq_id: u32) -> Self {
        Self { gic, vm, irq_id }
    }
}

impl IrqLine for GicIrqLine {
    fn set_level(&self, level: bool) {
        if let Err(e) = self.gic.set_spi_line(&self.vm, self.irq_id, level) {
            log::warn!("[GIC] failed to set IRQ {} to {level}: {e}", self.irq_id);
        }
    }
}
