//! ARM Generic Timer glue.
//!
//! The architected timer is virtualized entirely by the host CPU; KVM
//! forwards its four interrupt lines to the guest without VMM involvement.
//! This module carries nothing but the PPI numbers, which both the GIC (to
//! know the lines exist) and the DTB generator (to describe them) need to
//! agree on.

/// Secure physical timer PPI.
pub const PPI_SECURE_PHYS: u32 = 29;
/// Non-secure physical timer PPI.
pub const PPI_NON_SECURE_PHYS: u32 = 30;
/// Virtual timer PPI.
pub const PPI_VIRTUAL: u32 = 27;
/// Hypervisor timer PPI.
pub const PPI_HYPERVISOR: u32 = 26;
