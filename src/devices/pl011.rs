//! PL011 UART emulation.
//!
//! Implements the subset of the ARM PrimeCell PL011 register set that Linux
//! needs to bind `drivers/tty/serial/amba-pl011.c` and use it as the console:
//! transmit, receive with a host-stdin-fed FIFO, and level-triggered receive
//! interrupts.
//!
//! The AMBA PrimeCell ID registers (offsets 0xFE0-0xFFC) are deliberately not
//! emulated; the device tree supplies `arm,primecell-periphid` directly so
//! the guest never needs to probe them.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use super::IrqLine;

mod regs {
    /// Data Register.
    pub const DR: u64 = 0x000;
    /// Flag Register.
    pub const FR: u64 = 0x018;
    /// Integer Baud Rate Divisor.
    pub const IBRD: u64 = 0x024;
    /// Fractional Baud Rate Divisor.
    pub const FBRD: u64 = 0x028;
    /// Line Control Register.
    pub const LCR_H: u64 = 0x02C;
    /// Control Register.
    pub const CR: u64 = 0x030;
    /// Interrupt Mask Set/Clear Register.
    pub const IMSC: u64 = 0x038;
    /// Raw Interrupt Status Register.
    pub const RIS: u64 = 0x03C;
    /// Masked Interrupt Status Register.
    pub const MIS: u64 = 0x040;
    /// Interrupt Clear Register.
    pub const ICR: u64 = 0x044;
}

mod flag {
    /// Receive FIFO Empty.
    pub const RXFE: u8 = 1 << 4;
    /// Transmit FIFO Empty.
    pub const TXFE: u8 = 1 << 7;
}

mod irq_bit {
    pub const RX: u32 = 1 << 4;
    #[allow(dead_code)]
    pub const TX: u32 = 1 << 5;
    #[allow(dead_code)]
    pub const RT: u32 = 1 << 6;
    #[allow(dead_code)]
    pub const OE: u32 = 1 << 10;
}

/// Default SPI assigned to the UART (absolute interrupt id 33).
pub const UART_IRQ: u32 = 33;

pub const UART_BASE: u64 = 0x0900_0000;
pub const UART_SIZE: u64 = 0x0000_1000;

pub struct Pl011 {
    lcr_h: u32,
    cr: u32,
    ibrd: u32,
    fbrd: u32,
    imsc: u32,
    ris: u32,
    rx_fifo: std::collections::VecDeque<u8>,
    irq_asserted: bool,
    irq_line: Box<dyn IrqLine>,
}

impl Pl011 {
    pub fn new(irq_line: Box<dyn IrqLine>) -> Self {
        Self {
            lcr_h: 0,
            cr: 0,
            ibrd: 0,
            fbrd: 0,
            imsc: 0,
            ris: 0,
            rx_fifo: std::collections::VecDeque::new(),
            irq_asserted: false,
            irq_line,
        }
    }

    /// Feed bytes from the host (e.g. stdin) into the receive FIFO.
    pub fn inject_input(&mut self, bytes: &[u8]) {
        self.rx_fifo.extend(bytes.iter().copied());
        if !bytes.is_empty() {
            self.ris |= irq_bit::RX;
            self.update_irq();
        }
    }

    fn mis(&self) -> u32 {
        self.ris & self.imsc
    }

    fn update_irq(&mut self) {
        let level = self.mis() != 0;
        if level != self.irq_asserted {
            self.irq_line.set_level(level);
            self.irq_asserted = level;
        }
    }

    fn read_dr(&mut self) -> u8 {
        let byte = self.rx_fifo.pop_front().unwrap_or(0);
        if self.rx_fifo.is_empty() {
            self.ris &= !irq_bit::RX;
            self.update_irq();
        }
        byte
    }

    fn write_dr(&self, byte: u8) {
        let _ = io::stdout().write_all(&[byte]);
        let _ = io::stdout().flush();
    }

    fn fr(&self) -> u8 {
        let mut fr = flag::TXFE;
        if self.rx_fifo.is_empty() {
            fr |= flag::RXFE;
        }
        fr
    }

    fn read_reg(&mut self, offset: u64) -> u32 {
        match offset {
            regs::DR => self.read_dr() as u32,
            regs::FR => self.fr() as u32,
            regs::LCR_H => self.lcr_h,
            regs::CR => self.cr,
            regs::IBRD => self.ibrd,
            regs::FBRD => self.fbrd,
            regs::IMSC => self.imsc,
            regs::RIS => self.ris,
            regs::MIS => self.mis(),
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32) {
        match offset {
            regs::DR => self.write_dr(value as u8),
            regs::LCR_H => self.lcr_h = value,
            regs::CR => self.cr = value,
            regs::IBRD => self.ibrd = value,
            regs::FBRD => self.fbrd = value,
            regs::IMSC => {
                self.imsc = value;
                self.update_irq();
            }
            regs::ICR => {
                self.ris &= !value;
                self.update_irq();
            }
            _ => {}
        }
    }
}

impl super::mmio::MmioDevice for Pl011 {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        let value = self.read_reg(offset & !0x3);
        let bytes = value.to_le_bytes();
        let len = data.len().min(4);
        data[..len].copy_from_slice(&bytes[..len]);
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let mut bytes = [0u8; 4];
        let len = data.len().min(4);
        bytes[..len].copy_from_slice(&data[..len]);
        self.write_reg(offset & !0x3, u32::from_le_bytes(bytes));
    }
}

/// Registers a [`Pl011`] on the MMIO bus while keeping a handle the run
/// loop can use to feed it host stdin directly.
pub struct Pl011Handle(Rc<RefCell<Pl011>>);

impl Pl011Handle {
    pub fn new(uart: Pl011) -> Self {
        Self(Rc::new(RefCell::new(uart)))
    }

    /// A second reference to the same UART for MMIO bus registration.
    pub fn mmio_device(&self) -> Box<dyn super::mmio::MmioDevice> {
        Box::new(Pl011Handle(self.0.clone()))
    }

    pub fn inject_input(&self, bytes: &[u8]) {
        self.0.borrow_mut().inject_input(bytes);
    }
}

impl super::mmio::MmioDevice for Pl011Handle {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        self.0.borrow_mut().read(offset, data);
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        self.0.borrow_mut().write(offset, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mmio::MmioDevice;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct RecordingIrqLine {
        calls: Rc<RefCell<Vec<bool>>>,
    }

    impl IrqLine for RecordingIrqLine {
        fn set_level(&self, level: bool) {
            self.calls.borrow_mut().push(level);
        }
    }

    fn uart_with_recorder() -> (Pl011, Rc<RefCell<Vec<bool>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let line = RecordingIrqLine {
            calls: calls.clone(),
        };
        (Pl011::new(Box::new(line)), calls)
    }

    #[test]
    fn writes_to_dr_go_to_stdout_and_dont_touch_irq() {
        let (mut uart, calls) = uart_with_recorder();
        uart.write(regs::DR, &[b'H']);
        uart.write(regs::DR, &[b'i']);
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn fr_reports_rxfe_when_empty_and_txfe_always() {
        let (mut uart, _) = uart_with_recorder();
        let mut data = [0u8; 4];
        uart.read(regs::FR, &mut data);
        assert_eq!(data[0] & flag::RXFE, flag::RXFE);
        assert_eq!(data[0] & flag::TXFE, flag::TXFE);
    }

    #[test]
    fn inject_input_then_read_dr_round_trips_in_order() {
        let (mut uart, _) = uart_with_recorder();
        uart.inject_input(b"ab");
        let mut data = [0u8; 4];
        uart.read(regs::DR, &mut data);
        assert_eq!(data[0], b'a');
        uart.read(regs::DR, &mut data);
        assert_eq!(data[0], b'b');
    }

    #[test]
    fn irq_asserted_iff_mis_nonzero() {
        let (mut uart, calls) = uart_with_recorder();
        // Unmask RX interrupt.
        uart.write(regs::IMSC, &irq_bit::RX.to_le_bytes());
        assert!(calls.borrow().is_empty());

        uart.inject_input(b"x");
        assert_eq!(*calls.borrow(), vec![true]);

        let mut data = [0u8; 4];
        uart.read(regs::DR, &mut data);
        assert_eq!(*calls.borrow(), vec![true, false]);
    }

    #[test]
    fn masked_interrupt_never_reaches_gic() {
        let (mut uart, calls) = uart_with_recorder();
        // IMSC left at 0: RX bit never unmasked.
        uart.inject_input(b"y");
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn three_bytes_assert_once_and_deassert_after_last_read() {
        let (mut uart, calls) = uart_with_recorder();
        uart.write(regs::IMSC, &irq_bit::RX.to_le_bytes());
        uart.inject_input(b"abc");
        assert_eq!(*calls.borrow(), vec![true]);

        let mut data = [0u8; 4];
        uart.read(regs::DR, &mut data);
        uart.read(regs::DR, &mut data);
        assert_eq!(*calls.borrow(), vec![true]);
        uart.read(regs::DR, &mut data);
        assert_eq!(*calls.borrow(), vec![true, false]);
    }

    #[test]
    fn icr_clears_ris_bits() {
        let (mut uart, calls) = uart_with_recorder();
        uart.write(regs::IMSC, &irq_bit::RX.to_le_bytes());
        uart.inject_input(b"z");
        assert_eq!(*calls.borrow(), vec![true]);

        uart.write(regs::ICR, &irq_bit::RX.to_le_bytes());
        assert_eq!(*calls.borrow(), vec![true, false]);
    }
}
