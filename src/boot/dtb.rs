//! Flattened device tree generation.
//!
//! Builds the DTB the guest kernel reads at boot to discover memory, CPUs,
//! the GICv3, the architected timer, and the PL011 UART. Built on
//! `vm-fdt`'s arena-style writer: nodes are opened/closed in a single pass,
//! with no manual phandle table or offset patching.

use vm_fdt::{Error as FdtError, FdtWriter};

use super::BootError;
use crate::devices::pl011::{UART_BASE, UART_IRQ, UART_SIZE};
use crate::devices::timer::{PPI_HYPERVISOR, PPI_NON_SECURE_PHYS, PPI_SECURE_PHYS, PPI_VIRTUAL};
use crate::gic::{DIST_BASE, DIST_SIZE, REDIST_BASE, REDIST_SIZE};

const GIC_PHANDLE: u32 = 1;
const CLOCK_PHANDLE: u32 = 2;

/// `interrupts` cell type: Shared Peripheral Interrupt.
const IRQ_TYPE_SPI: u32 = 0;
/// `interrupts` cell type: Private Peripheral Interrupt.
const IRQ_TYPE_PPI: u32 = 1;
/// Level-triggered, active-high.
const IRQ_FLAG_LEVEL_HIGH: u32 = 4;

fn split_u64(value: u64) -> [u32; 2] {
    [(value >> 32) as u32, value as u32]
}

/// Parameters for generating the device tree.
pub struct DtbConfig<'a> {
    pub ram_base: u64,
    pub ram_size: u64,
    pub num_cpus: u32,
    pub cmdline: &'a str,
    pub initrd_range: Option<(u64, u64)>,
}

/// Build the flattened device tree described in the guest memory layout
/// sense (the caller still has to copy the returned bytes into guest RAM).
pub fn generate(config: &DtbConfig) -> Result<Vec<u8>, BootError> {
    build(config).map_err(|_| BootError::DtbGeneration)
}

fn build(config: &DtbConfig) -> Result<Vec<u8>, FdtError> {
    let mut fdt = FdtWriter::new()?;

    let root = fdt.begin_node("")?;
    fdt.property_string("compatible", "linux,dummy-virt")?;
    fdt.property_u32("#address-cells", 2)?;
    fdt.property_u32("#size-cells", 2)?;

    let aliases = fdt.begin_node("aliases")?;
    fdt.property_string("serial0", "/soc/pl011@9000000")?;
    fdt.end_node(aliases)?;

    let chosen = fdt.begin_node("chosen")?;
    fdt.property_string("bootargs", config.cmdline)?;
    fdt.property_string("stdout-path", "/soc/pl011@9000000")?;
    if let Some((start, end)) = config.initrd_range {
        fdt.property_array_u32("linux,initrd-start", &split_u64(start))?;
        fdt.property_array_u32("linux,initrd-end", &split_u64(end))?;
    }
    fdt.end_node(chosen)?;

    let mem_node_name = format!("memory@{:x}", config.ram_base);
    let memory = fdt.begin_node(&mem_node_name)?;
    fdt.property_string("device_type", "memory")?;
    let mut mem_reg = split_u64(config.ram_base).to_vec();
    mem_reg.extend_from_slice(&split_u64(config.ram_size));
    fdt.property_array_u32("reg", &mem_reg)?;
    fdt.end_node(memory)?;

    let cpus = fdt.begin_node("cpus")?;
    fdt.property_u32("#address-cells", 1)?;
    fdt.property_u32("#size-cells", 0)?;
    for id in 0..config.num_cpus {
        let cpu_name = format!("cpu@{id}");
        let cpu = fdt.begin_node(&cpu_name)?;
        fdt.property_string("device_type", "cpu")?;
        fdt.property_string("compatible", "arm,cortex-a57")?;
        fdt.property_u32("reg", id)?;
        fdt.property_string("enable-method", "psci")?;
        fdt.end_node(cpu)?;
    }
    fdt.end_node(cpus)?;

    let psci = fdt.begin_node("psci")?;
    fdt.property_string_list(
        "compatible",
        vec!["arm,psci-1.0".to_string(), "arm,psci-0.2".to_string()],
    )?;
    fdt.property_string("method", "hvc")?;
    fdt.end_node(psci)?;

    let intc_name = format!("interrupt-controller@{DIST_BASE:x}");
    let intc = fdt.begin_node(&intc_name)?;
    fdt.property_string("compatible", "arm,gic-v3")?;
    fdt.property_u32("#interrupt-cells", 3)?;
    fdt.property_null("interrupt-controller")?;
    let mut gic_reg = split_u64(DIST_BASE).to_vec();
    gic_reg.extend_from_slice(&split_u64(DIST_SIZE));
    gic_reg.extend_from_slice(&split_u64(REDIST_BASE));
    gic_reg.extend_from_slice(&split_u64(REDIST_SIZE));
    fdt.property_array_u32("reg", &gic_reg)?;
    fdt.property_u32("phandle", GIC_PHANDLE)?;
    fdt.end_node(intc)?;

    let timer = fdt.begin_node("timer")?;
    fdt.property_string("compatible", "arm,armv8-timer")?;
    fdt.property_u32("interrupt-parent", GIC_PHANDLE)?;
    let ppi_triple = |ppi: u32| [IRQ_TYPE_PPI, ppi - 16, IRQ_FLAG_LEVEL_HIGH];
    let mut timer_irqs = Vec::new();
    for ppi in [
        PPI_SECURE_PHYS,
        PPI_NON_SECURE_PHYS,
        PPI_VIRTUAL,
        PPI_HYPERVISOR,
    ] {
        timer_irqs.extend_from_slice(&ppi_triple(ppi));
    }
    fdt.property_array_u32("interrupts", &timer_irqs)?;
    fdt.property_null("always-on")?;
    fdt.end_node(timer)?;

    let clock = fdt.begin_node("apb-pclk")?;
    fdt.property_string("compatible", "fixed-clock")?;
    fdt.property_u32("#clock-cells", 0)?;
    fdt.property_u32("clock-frequency", 24_000_000)?;
    fdt.property_u32("phandle", CLOCK_PHANDLE)?;
    fdt.end_node(clock)?;

    let soc = fdt.begin_node("soc")?;
    fdt.property_string("compatible", "simple-bus")?;
    fdt.property_u32("#address-cells", 2)?;
    fdt.property_u32("#size-cells", 2)?;
    fdt.property_array_u32("ranges", &[])?;

    let uart_name = format!("pl011@{UART_BASE:x}");
    let uart = fdt.begin_node(&uart_name)?;
    fdt.property_string_list(
        "compatible",
        vec!["arm,pl011".to_string(), "arm,primecell".to_string()],
    )?;
    fdt.property_string("status", "okay")?;
    fdt.property_u32("arm,primecell-periphid", 0x0024_1011)?;
    let mut uart_reg = split_u64(UART_BASE).to_vec();
    uart_reg.extend_from_slice(&split_u64(UART_SIZE));
    fdt.property_array_u32("reg", &uart_reg)?;
    fdt.property_u32("interrupt-parent", GIC_PHANDLE)?;
    fdt.property_array_u32(
        "interrupts",
        &[IRQ_TYPE_SPI, UART_IRQ - 32, IRQ_FLAG_LEVEL_HIGH],
    )?;
    fdt.property_string_list(
        "clock-names",
        vec!["uartclk".to_string(), "apb_pclk".to_string()],
    )?;
    fdt.property_array_u32("clocks", &[CLOCK_PHANDLE, CLOCK_PHANDLE])?;
    fdt.end_node(uart)?;

    fdt.end_node(soc)?;

    fdt.end_node(root)?;

    fdt.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn be_u32(value: &[u8]) -> u32 {
        u32::from_be_bytes(value[0..4].try_into().unwrap())
    }

    fn be_u64(value: &[u8]) -> u64 {
        u64::from_be_bytes(value[0..8].try_into().unwrap())
    }

    #[test]
    fn generates_without_error() {
        let config = DtbConfig {
            ram_base: 0x4000_0000,
            ram_size: 1024 * 1024 * 1024,
            num_cpus: 1,
            cmdline: "console=ttyAMA0",
            initrd_range: Some((0x4800_0000, 0x4810_0000)),
        };
        let bytes = generate(&config).unwrap();
        assert!(!bytes.is_empty());
        // FDT magic, big-endian 0xd00dfeed, at offset 0.
        assert_eq!(&bytes[0..4], &[0xd0, 0x0d, 0xfe, 0xed]);
    }

    /// Spec scenario 3: generate a DTB, re-parse it, and check the
    /// properties a booting kernel actually reads back out.
    #[test]
    fn round_trips_memory_chosen_and_uart_properties() {
        let config = DtbConfig {
            ram_base: 0x4000_0000,
            ram_size: 1024 * 1024 * 1024,
            num_cpus: 1,
            cmdline: "console=ttyAMA0",
            initrd_range: Some((0x4800_0000, 0x4810_0000)),
        };
        let bytes = generate(&config).unwrap();
        let parsed = fdt::Fdt::new(&bytes).unwrap();

        let memory = parsed.find_node("/memory@40000000").unwrap();
        let reg = memory.property("reg").unwrap().value;
        assert_eq!(be_u64(&reg[0..8]), 0x4000_0000);
        assert_eq!(be_u64(&reg[8..16]), 0x4000_0000);

        let chosen = parsed.find_node("/chosen").unwrap();
        let initrd_start = chosen.property("linux,initrd-start").unwrap().value;
        assert_eq!(be_u64(initrd_start), 0x4800_0000);

        let uart = parsed.find_node("/soc/pl011@9000000").unwrap();
        let periphid = uart.property("arm,primecell-periphid").unwrap().value;
        assert_eq!(be_u32(periphid), 0x0024_1011);
    }

    #[test]
    fn generates_without_initrd() {
        let config = DtbConfig {
            ram_base: 0x4000_0000,
            ram_size: 256 * 1024 * 1024,
            num_cpus: 2,
            cmdline: "console=ttyAMA0",
            initrd_range: None,
        };
        assert!(generate(&config).is_ok());
    }

    #[test]
    fn split_u64_is_big_endian_high_then_low() {
        assert_eq!(split_u64(0x1234_5678_9abc_def0), [0x1234_5678, 0x9abc_def0]);
    }
}
