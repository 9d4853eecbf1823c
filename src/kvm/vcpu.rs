//! Virtual CPU management and execution for ARM64.
//!
//! This module provides the vCPU abstraction for running guest code. A vCPU
//! represents a virtual processor that executes guest instructions under
//! hardware-assisted virtualization (ARM VHE).
//!
//! # vCPU Execution Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      VMM (User Space)                   │
//! │  ┌─────────┐         ┌─────────────┐                    │
//! │  │  Loop   │◄────────│ Handle Exit │                    │
//! │  │  Start  │         │ (MMIO, etc) │                    │
//! │  └────┬────┘         └──────▲──────┘                    │
//! │       │                     │                           │
//! │       │ vcpu.run()          │ VM Exit                   │
//! │       ▼                     │                           │
//! ├───────┼─────────────────────┼───────────────────────────┤
//! │       │      KVM (Kernel)   │                           │
//! │       ▼                     │                           │
//! │  ┌─────────┐          ┌─────┴─────┐                     │
//! │  │ Enter   │─────────►│  VM Exit  │                     │
//! │  │ Guest   │  Guest   │           │                     │
//! │  └─────────┘  Runs    └───────────┘                     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ARM64 has no I/O port space: every device access the guest performs is an
//! MMIO exit. The other notable exit is `SystemEvent`, produced when the
//! guest invokes PSCI `SYSTEM_OFF`/`SYSTEM_RESET` via `HVC`.
//!
//! # Register Access
//!
//! KVM exposes every ARM64 register — core and system — through one ioctl
//! pair, `KVM_SET_ONE_REG`/`KVM_GET_ONE_REG`, keyed by a 64-bit register ID
//! encoding the register's location and size. Core registers (X0-X30, SP,
//! PC, PSTATE) are fields of `struct user_pt_regs` nested inside
//! `struct kvm_regs`; their ID is derived from their byte offset. System
//! registers (SCTLR_EL1, VBAR_EL1, ...) are identified by their AArch64
//! `(op0, op1, CRn, CRm, op2)` encoding.

use super::KvmError;
use kvm_bindings::{kvm_regs, user_pt_regs, KVM_REG_ARM64, KVM_REG_ARM_CORE, KVM_REG_SIZE_U64};
use kvm_ioctls::VcpuExit as KvmVcpuExit;
use std::mem::offset_of;

/// Builds a core-register ID for `KVM_{SET,GET}_ONE_REG` from a byte offset
/// within `struct user_pt_regs` (see `arch/arm64/include/uapi/asm/kvm.h`).
macro_rules! arm64_core_reg_id {
    ($offset:expr) => {
        (KVM_REG_ARM64 as u64)
            | (KVM_REG_SIZE_U64 as u64)
            | (KVM_REG_ARM_CORE as u64)
            | (($offset / std::mem::size_of::<u32>()) as u64)
    };
}

/// `KVM_REG_ARM64_SYSREG`: coprocessor-field tag selecting an AArch64 system
/// register rather than a core register.
const KVM_REG_ARM64_SYSREG: u64 = 0x0013 << 16;
const SYSREG_OP0_SHIFT: u64 = 14;
const SYSREG_OP1_SHIFT: u64 = 11;
const SYSREG_CRN_SHIFT: u64 = 7;
const SYSREG_CRM_SHIFT: u64 = 3;
const SYSREG_OP2_SHIFT: u64 = 0;

/// Builds a system-register ID from its `op0, op1, CRn, CRm, op2` encoding.
const fn sys_reg_id(op0: u64, op1: u64, crn: u64, crm: u64, op2: u64) -> u64 {
    (KVM_REG_ARM64 as u64)
        | (KVM_REG_SIZE_U64 as u64)
        | KVM_REG_ARM64_SYSREG
        | (op0 << SYSREG_OP0_SHIFT)
        | (op1 << SYSREG_OP1_SHIFT)
        | (crn << SYSREG_CRN_SHIFT)
        | (crm << SYSREG_CRM_SHIFT)
        | (op2 << SYSREG_OP2_SHIFT)
}

/// Named system-register IDs this VMM needs at boot and for fault reporting.
pub mod sysreg {
    use super::sys_reg_id;

    pub const SCTLR_EL1: u64 = sys_reg_id(0b11, 0b000, 0b0001, 0b0000, 0b000);
    pub const VBAR_EL1: u64 = sys_reg_id(0b11, 0b000, 0b1100, 0b0000, 0b000);
    pub const ELR_EL1: u64 = sys_reg_id(0b11, 0b000, 0b0100, 0b0000, 0b001);
    pub const ESR_EL1: u64 = sys_reg_id(0b11, 0b000, 0b0101, 0b0010, 0b000);
    pub const FAR_EL1: u64 = sys_reg_id(0b11, 0b000, 0b0110, 0b0000, 0b000);
}

const REGS_OFFSET: usize = offset_of!(kvm_regs, regs);
const PC_OFFSET: usize = REGS_OFFSET + offset_of!(user_pt_regs, pc);
const PSTATE_OFFSET: usize = REGS_OFFSET + offset_of!(user_pt_regs, pstate);
const SP_OFFSET: usize = REGS_OFFSET + offset_of!(user_pt_regs, sp);

/// Register ID for general-purpose register `Xn` (0..=30).
fn x_reg_id(n: u8) -> u64 {
    debug_assert!(n <= 30);
    let offset = REGS_OFFSET
        + offset_of!(user_pt_regs, regs)
        + (n as usize) * std::mem::size_of::<u64>();
    arm64_core_reg_id!(offset)
}

fn pc_reg_id() -> u64 {
    arm64_core_reg_id!(PC_OFFSET)
}

fn pstate_reg_id() -> u64 {
    arm64_core_reg_id!(PSTATE_OFFSET)
}

fn sp_reg_id() -> u64 {
    arm64_core_reg_id!(SP_OFFSET)
}

/// PSTATE value for EL1h with all asynchronous exceptions masked
/// (D=1, A=1, I=1, F=1, M[3:0]=0101 EL1h).
pub const PSTATE_EL1H_MASKED: u64 = 0x3c5;

/// Exit reasons from vCPU execution.
///
/// When `run()` returns, it indicates why the guest stopped executing. The
/// run loop handles the exit and typically calls `run()` again to continue.
#[derive(Debug)]
pub enum ExitReason<'a> {
    /// The guest read from an MMIO address; fill `data` with the response.
    MmioRead { addr: u64, data: &'a mut [u8] },

    /// The guest wrote `data` to an MMIO address.
    MmioWrite { addr: u64, data: &'a [u8] },

    /// The guest invoked a PSCI operation (system off/reset) via `HVC`.
    ///
    /// `event_type` is the KVM `KVM_SYSTEM_EVENT_*` code.
    SystemEvent { event_type: u32 },

    /// The host run ioctl was interrupted by a signal (`EINTR`) before
    /// producing a real exit. Not an error; the run loop should poll stdin
    /// (if interactive) and call `run()` again.
    Interrupted,

    /// Guest executed `WFI` and there is no pending work — returned only if
    /// the kernel decides to hand control back instead of blocking in-kernel.
    Hlt,

    /// KVM internal error occurred.
    InternalError,

    /// Failed to enter guest mode; contains the hardware failure reason.
    FailEntry(u64),

    /// Unknown or unhandled exit reason.
    Unknown(&'static str),
}

/// Wrapper around the KVM vCPU file descriptor.
pub struct VcpuFd {
    vcpu: kvm_ioctls::VcpuFd,
}

impl VcpuFd {
    pub(super) fn new(vcpu: kvm_ioctls::VcpuFd, _run_mmap_size: usize) -> Result<Self, KvmError> {
        // kvm-ioctls maps the shared kvm_run page internally on VcpuFd
        // creation; we keep `_run_mmap_size` for documentation parity with
        // the ioctl that reports it (`KVM_GET_VCPU_MMAP_SIZE`).
        Ok(Self { vcpu })
    }

    /// Set general-purpose register `Xn` (0..=30).
    pub fn set_x_reg(&self, n: u8, value: u64) -> Result<(), KvmError> {
        let id = x_reg_id(n);
        self.vcpu
            .set_one_reg(id, &value.to_le_bytes())
            .map_err(|e| KvmError::SetOneReg(id, e))
    }

    /// Get general-purpose register `Xn` (0..=30).
    pub fn get_x_reg(&self, n: u8) -> Result<u64, KvmError> {
        let id = x_reg_id(n);
        let mut buf = [0u8; 8];
        self.vcpu
            .get_one_reg(id, &mut buf)
            .map_err(|e| KvmError::GetOneReg(id, e))?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Set the program counter.
    pub fn set_pc(&self, value: u64) -> Result<(), KvmError> {
        let id = pc_reg_id();
        self.vcpu
            .set_one_reg(id, &value.to_le_bytes())
            .map_err(|e| KvmError::SetOneReg(id, e))
    }

    /// Get the program counter.
    pub fn get_pc(&self) -> Result<u64, KvmError> {
        let id = pc_reg_id();
        let mut buf = [0u8; 8];
        self.vcpu
            .get_one_reg(id, &mut buf)
            .map_err(|e| KvmError::GetOneReg(id, e))?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Set PSTATE.
    pub fn set_pstate(&self, value: u64) -> Result<(), KvmError> {
        let id = pstate_reg_id();
        self.vcpu
            .set_one_reg(id, &value.to_le_bytes())
            .map_err(|e| KvmError::SetOneReg(id, e))
    }

    /// Set the stack pointer.
    pub fn set_sp(&self, value: u64) -> Result<(), KvmError> {
        let id = sp_reg_id();
        self.vcpu
            .set_one_reg(id, &value.to_le_bytes())
            .map_err(|e| KvmError::SetOneReg(id, e))
    }

    /// Set a named system register (see [`sysreg`]).
    pub fn set_sys_reg(&self, id: u64, value: u64) -> Result<(), KvmError> {
        self.vcpu
            .set_one_reg(id, &value.to_le_bytes())
            .map_err(|e| KvmError::SetOneReg(id, e))
    }

    /// Get a named system register (see [`sysreg`]).
    pub fn get_sys_reg(&self, id: u64) -> Result<u64, KvmError> {
        let mut buf = [0u8; 8];
        self.vcpu
            .get_one_reg(id, &mut buf)
            .map_err(|e| KvmError::GetOneReg(id, e))?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Set or clear the `immediate_exit` flag in the shared `kvm_run` page.
    ///
    /// The kernel checks this byte both before entering guest mode and upon
    /// signal delivery. Setting it from a signal handler is the mechanism
    /// the interactive run loop uses to interrupt a vCPU blocked in a
    /// wait-for-interrupt state so it can service host stdin.
    pub fn set_immediate_exit(&self, value: bool) {
        self.vcpu.set_kvm_immediate_exit(value as u8);
    }

    /// Raw pointer to the shared `kvm_run` page's `immediate_exit` byte.
    ///
    /// Exists so a signal handler, which cannot safely call an ioctl-backed
    /// method, can still set the flag directly. The pointer is valid for
    /// as long as this `VcpuFd` is alive.
    pub fn immediate_exit_ptr(&self) -> *mut u8 {
        unsafe { std::ptr::addr_of_mut!((*self.vcpu.get_kvm_run()).immediate_exit) }
    }

    /// Run the vCPU until it exits.
    ///
    /// On `EINTR` (the host delivered a signal, typically the interactive
    /// run loop's periodic alarm), returns `ExitReason::Interrupted` instead
    /// of propagating the error — this is the expected way to unblock a
    /// guest parked in `WFI`.
    pub fn run(&mut self) -> Result<ExitReason<'_>, KvmError> {
        match self.vcpu.run() {
            Ok(KvmVcpuExit::MmioRead(addr, data)) => Ok(ExitReason::MmioRead { addr, data }),
            Ok(KvmVcpuExit::MmioWrite(addr, data)) => Ok(ExitReason::MmioWrite { addr, data }),
            Ok(KvmVcpuExit::SystemEvent(event_type, _)) => {
                Ok(ExitReason::SystemEvent { event_type })
            }
            Ok(KvmVcpuExit::Hlt) => Ok(ExitReason::Hlt),
            Ok(KvmVcpuExit::InternalError) => Ok(ExitReason::InternalError),
            Ok(KvmVcpuExit::FailEntry(reason, _)) => Ok(ExitReason::FailEntry(reason)),
            Ok(KvmVcpuExit::Exception) => Ok(ExitReason::Unknown("Exception")),
            Ok(KvmVcpuExit::Debug(_)) => Ok(ExitReason::Unknown("Debug")),
            Ok(_) => Ok(ExitReason::Unknown("Other")),
            Err(e) if e.errno() == libc::EINTR => Ok(ExitReason::Interrupted),
            Err(e) => Err(KvmError::Run(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x_reg_ids_are_distinct_and_ordered() {
        let ids: Vec<u64> = (0..=30).map(x_reg_id).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn pc_pstate_sp_ids_differ_from_x_regs() {
        let pc = pc_reg_id();
        let pstate = pstate_reg_id();
        let sp = sp_reg_id();
        assert_ne!(pc, pstate);
        assert_ne!(pc, sp);
        for n in 0..=30u8 {
            assert_ne!(pc, x_reg_id(n));
            assert_ne!(pstate, x_reg_id(n));
            assert_ne!(sp, x_reg_id(n));
        }
    }

    #[test]
    fn sysreg_ids_are_distinct() {
        let ids = [
            sysreg::SCTLR_EL1,
            sysreg::VBAR_EL1,
            sysreg::ELR_EL1,
            sysreg::ESR_EL1,
            sysreg::FAR_EL1,
        ];
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                assert_ne!(ids[i], ids[j]);
            }
        }
    }

    #[test]
    fn pstate_el1h_masked_value() {
        assert_eq!(PSTATE_EL1H_MASKED, 0x3c5);
    }
}
