//! A minimal ARM64 virtual machine monitor on top of Linux KVM.
//!
//! Boots a bare `Image`-format Linux kernel with a generated device tree
//! describing one GICv3-backed vCPU, memory, the architected timer, and a
//! PL011 UART wired to the host terminal.

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod gic;
#[cfg(target_os = "linux")]
mod kvm;
#[cfg(target_os = "linux")]
mod runner;

use clap::Parser;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "aarch64-vmm")]
#[command(about = "A minimal ARM64 virtual machine monitor on top of Linux KVM")]
struct Args {
    /// Path to the ARM64 Linux kernel Image
    kernel: String,

    /// Path to an initramfs to load alongside the kernel
    #[arg(long)]
    initrd: Option<String>,

    /// Kernel command line (defaults to a PL011 console with earlycon)
    #[arg(long)]
    cmdline: Option<String>,

    /// Guest memory size in MiB
    #[arg(long, default_value_t = 512)]
    ram: u64,

    /// Path to a pre-built DTB; a device tree is generated if omitted
    #[arg(long)]
    dtb: Option<String>,

    /// Pump host stdin into the guest UART (mutually exclusive with --no-interactive)
    #[arg(long, conflicts_with = "no_interactive")]
    interactive: bool,

    /// Run without touching the host terminal
    #[arg(long)]
    no_interactive: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use boot::dtb::{self, DtbConfig};
    use boot::layout;
    use devices::mmio::MmioBus;
    use devices::pl011::{Pl011, Pl011Handle, UART_BASE, UART_IRQ, UART_SIZE};
    use devices::GicIrqLine;
    use gic::{Gic, DIST_BASE, REDIST_BASE};
    use std::rc::Rc;

    log::info!("[VMM] kernel: {}", args.kernel);
    log::info!("[VMM] ram: {} MiB", args.ram);

    let vm = Rc::new(kvm::create_vm()?);

    let mut gic = Gic::create(&vm)?;
    gic.set_addresses(DIST_BASE, REDIST_BASE)?;

    let ram_size = args.ram * 1024 * 1024;
    let memory = boot::GuestMemory::new(ram_size)?;
    let (gpa, hva, size) = memory.as_raw_parts();
    unsafe {
        vm.set_user_memory_region(0, gpa, size, hva)?;
    }

    let mut vcpu = vm.create_vcpu(0)?;

    gic.finalize()?;
    let gic = Rc::new(gic);

    let irq_line = GicIrqLine::new(gic.clone(), vm.clone(), UART_IRQ);
    let uart = Pl011Handle::new(Pl011::new(Box::new(irq_line)));

    let mut mmio_bus = MmioBus::new();
    mmio_bus.register(UART_BASE, UART_SIZE, uart.mmio_device());

    let cmdline = args.cmdline.unwrap_or_else(|| layout::DEFAULT_CMDLINE.to_string());
    if cmdline.len() > layout::CMDLINE_MAX_SIZE {
        return Err(format!(
            "command line too long: {} bytes (max {})",
            cmdline.len(),
            layout::CMDLINE_MAX_SIZE
        )
        .into());
    }

    let initrd_range = match &args.initrd {
        Some(path) => {
            let len = std::fs::metadata(path)?.len();
            let addr =
                layout::align_up(boot::RAM_BASE + layout::INITRD_GAP, layout::PLACEMENT_ALIGN);
            Some((addr, addr + len))
        }
        None => None,
    };

    let dtb_bytes = match &args.dtb {
        Some(path) => std::fs::read(path)?,
        None => dtb::generate(&DtbConfig {
            ram_base: boot::RAM_BASE,
            ram_size,
            num_cpus: 1,
            cmdline: &cmdline,
            initrd_range,
        })?,
    };

    let boot_info = boot::load(
        &memory,
        &args.kernel,
        args.initrd.as_deref(),
        &dtb_bytes,
    )?;
    log::debug!(
        "[VMM] kernel@{:#x} ({} bytes), initrd@{:#x} ({} bytes), dtb@{:#x} ({} bytes)",
        boot_info.kernel_addr,
        boot_info.kernel_size,
        boot_info.initrd_addr,
        boot_info.initrd_size,
        boot_info.dtb_addr,
        boot_info.dtb_size
    );

    boot::setup_vcpu(&vcpu, &boot_info)?;

    let interactive = args.interactive || !args.no_interactive;
    log::info!("[VMM] starting vCPU (interactive={interactive})");

    let shutdown = if interactive {
        runner::run_interactive(&mut vcpu, &mut mmio_bus, &uart)?
    } else {
        runner::run_non_interactive(&mut vcpu, &mut mmio_bus)?
    };

    log::info!("[VMM] guest stopped: {shutdown:?}");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("this VMM requires Linux with KVM support; this platform is not supported".into())
}
