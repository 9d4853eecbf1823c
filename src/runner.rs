//! The vCPU run loop.
//!
//! Drives a single vCPU to completion, dispatching MMIO exits through the
//! device registry. The interactive variant additionally pumps host stdin
//! into the UART between guest exits.
//!
//! # The WFI problem
//!
//! A guest executing `WFI` with no pending interrupt blocks inside the host
//! kernel and produces no VM exit, so the run loop never gets a chance to
//! check stdin. [`run_interactive`] works around this by arming a
//! recurring `SIGALRM` that forces the vCPU back out via
//! `kvm_run.immediate_exit`, at which point `vcpu.run()` returns
//! [`ExitReason::Interrupted`] and the loop polls stdin before re-entering.

use std::io::Read;
use std::os::fd::BorrowedFd;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

use nix::sys::select::{select, FdSet};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::termios::{self, SetArg, Termios};
use nix::sys::time::{TimeVal, TimeValLike};
use thiserror::Error;

use crate::devices::mmio::MmioBus;
use crate::devices::pl011::Pl011Handle;
use crate::kvm::{ExitReason, KvmError, VcpuFd};

/// Errors that can terminate the run loop.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("KVM error: {0}")]
    Kvm(#[from] KvmError),

    #[error("vCPU internal error")]
    InternalError,

    #[error("failed to enter guest mode: reason={0:#x}")]
    FailEntry(u64),

    #[error("failed to install signal handler: {0}")]
    SignalSetup(#[source] nix::errno::Errno),

    #[error("failed to configure terminal: {0}")]
    TerminalSetup(#[source] nix::errno::Errno),
}

/// How the guest left the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// PSCI system off/reset via HVC.
    Clean,
    /// `HLT` with no pending work.
    Halted,
    /// An exit reason the run loop doesn't dispatch further (e.g. `Exception`,
    /// `Debug`). Grouped with `Halted` rather than treated as an error.
    Other(&'static str),
}

fn dump_registers(vcpu: &VcpuFd) {
    use crate::kvm::vcpu::sysreg;
    let pc = vcpu.get_pc().unwrap_or(0);
    let esr = vcpu.get_sys_reg(sysreg::ESR_EL1).unwrap_or(0);
    let far = vcpu.get_sys_reg(sysreg::FAR_EL1).unwrap_or(0);
    let elr = vcpu.get_sys_reg(sysreg::ELR_EL1).unwrap_or(0);
    log::error!(
        "[Runner] fatal exit: PC={pc:#x} ESR_EL1={esr:#x} FAR_EL1={far:#x} ELR_EL1={elr:#x}"
    );
}

fn dispatch(exit: ExitReason<'_>, bus: &mut MmioBus) -> Result<Option<Shutdown>, RunnerError> {
    match exit {
        ExitReason::MmioRead { addr, data } => {
            bus.read(addr, data);
            Ok(None)
        }
        ExitReason::MmioWrite { addr, data } => {
            bus.write(addr, data);
            Ok(None)
        }
        ExitReason::SystemEvent { event_type } => {
            log::info!("[Runner] PSCI system event {event_type}, shutting down");
            Ok(Some(Shutdown::Clean))
        }
        ExitReason::Interrupted => Ok(None),
        ExitReason::Hlt => {
            log::info!("[Runner] guest halted");
            Ok(Some(Shutdown::Halted))
        }
        ExitReason::InternalError => Err(RunnerError::InternalError),
        ExitReason::FailEntry(reason) => Err(RunnerError::FailEntry(reason)),
        ExitReason::Unknown(reason) => {
            log::info!("[Runner] unhandled exit reason {reason}, stopping");
            Ok(Some(Shutdown::Other(reason)))
        }
    }
}

fn run_and_dispatch(vcpu: &mut VcpuFd, bus: &mut MmioBus) -> Result<Option<Shutdown>, RunnerError> {
    let exit = vcpu.run()?;
    let is_fatal = matches!(
        exit,
        ExitReason::InternalError | ExitReason::FailEntry(_)
    );
    if is_fatal {
        dump_registers(vcpu);
    }
    dispatch(exit, bus)
}

/// Run a vCPU until it exits, with no host I/O pumping.
pub fn run_non_interactive(vcpu: &mut VcpuFd, bus: &mut MmioBus) -> Result<Shutdown, RunnerError> {
    loop {
        if let Some(shutdown) = run_and_dispatch(vcpu, bus)? {
            return Ok(shutdown);
        }
    }
}

/// Global pointer to the running vCPU's `immediate_exit` byte.
///
/// Set once by [`AlarmGuard::install`] and cleared on drop. The signal
/// handler only performs an atomic load followed by a single volatile
/// byte write, both async-signal-safe.
static IMMEDIATE_EXIT: AtomicPtr<u8> = AtomicPtr::new(ptr::null_mut());

extern "C" fn on_alarm(_: libc::c_int) {
    let ptr = IMMEDIATE_EXIT.load(Ordering::SeqCst);
    if !ptr.is_null() {
        unsafe { ptr.write_volatile(1) };
    }
}

fn itimerval_for(period: Duration) -> libc::itimerval {
    let tv = libc::timeval {
        tv_sec: period.as_secs() as libc::time_t,
        tv_usec: period.subsec_micros() as libc::suseconds_t,
    };
    libc::itimerval {
        it_interval: tv,
        it_value: tv,
    }
}

/// Installs a recurring `SIGALRM` that writes the vCPU's `immediate_exit`
/// byte, and disarms both the timer and the handler on drop.
struct AlarmGuard;

impl AlarmGuard {
    fn install(vcpu: &VcpuFd, period: Duration) -> Result<Self, RunnerError> {
        IMMEDIATE_EXIT.store(vcpu.immediate_exit_ptr(), Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(on_alarm),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { signal::sigaction(Signal::SIGALRM, &action) }.map_err(RunnerError::SignalSetup)?;

        let spec = itimerval_for(period);
        unsafe { libc::setitimer(libc::ITIMER_REAL, &spec, ptr::null_mut()) };

        Ok(Self)
    }
}

impl Drop for AlarmGuard {
    fn drop(&mut self) {
        let disarm = itimerval_for(Duration::ZERO);
        unsafe { libc::setitimer(libc::ITIMER_REAL, &disarm, ptr::null_mut()) };
        IMMEDIATE_EXIT.store(ptr::null_mut(), Ordering::SeqCst);
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let _ = unsafe { signal::sigaction(Signal::SIGALRM, &ignore) };
    }
}

/// Puts stdin into raw, non-canonical, no-echo mode for the lifetime of
/// the guard and restores the prior settings on drop.
struct RawModeGuard {
    saved: Termios,
}

impl RawModeGuard {
    fn enable() -> Result<Self, RunnerError> {
        let stdin = std::io::stdin();
        let saved = termios::tcgetattr(&stdin).map_err(RunnerError::TerminalSetup)?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw).map_err(RunnerError::TerminalSetup)?;
        Ok(Self { saved })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let stdin = std::io::stdin();
        let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, &self.saved);
    }
}

/// Non-blocking stdin poll: returns whatever bytes are immediately
/// available, or nothing if none are ready (not an error).
fn poll_stdin() -> Vec<u8> {
    let stdin_fd = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
    let mut readfds = FdSet::new();
    readfds.insert(stdin_fd);
    let mut timeout = TimeVal::seconds(0);

    match select(None, Some(&mut readfds), None, None, Some(&mut timeout)) {
        Ok(n) if n > 0 => {
            let mut buf = [0u8; 256];
            match std::io::stdin().read(&mut buf) {
                Ok(0) | Err(_) => Vec::new(),
                Ok(n) => buf[..n].to_vec(),
            }
        }
        _ => Vec::new(),
    }
}

/// Run a vCPU interactively: host terminal in raw mode, stdin pumped into
/// the UART, `WFI` unblocked every 100 ms so stdin gets a chance to run.
pub fn run_interactive(
    vcpu: &mut VcpuFd,
    bus: &mut MmioBus,
    uart: &Pl011Handle,
) -> Result<Shutdown, RunnerError> {
    let _raw_mode = RawModeGuard::enable()?;
    let _alarm = AlarmGuard::install(vcpu, Duration::from_millis(100))?;

    loop {
        vcpu.set_immediate_exit(false);

        let input = poll_stdin();
        if !input.is_empty() {
            uart.inject_input(&input);
        }

        if let Some(shutdown) = run_and_dispatch(vcpu, bus)? {
            return Ok(shutdown);
        }
    }
}
