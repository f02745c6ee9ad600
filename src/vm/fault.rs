//! VM Fault - Page Fault Resolution
//!
//! Turns a page fault into either a resident, mapped page or a typed failure.
//! Resolution walks a fixed sequence of steps; each step either finishes the
//! fault or hands a narrower state to the next one.
//!
//! ## Steps
//!
//! 1. **Check**: null address, kernel address or protection violation fail
//!    immediately and are never retried.
//! 2. **Stack**: a not-present fault just below the stack pointer, inside the
//!    stack window, creates a new zero-filled stack page.
//! 3. **Lookup**: the page must be registered, and writable if the access
//!    was a write.
//! 4. **Claim**: a frame is acquired (evicting if needed), filled and mapped.

use super::space::AddressSpace;
use super::{trunc_page, VmError, STACK_SLACK};
use crate::trap::TrapFrame;
use crate::types::VirtAddress;
use thiserror::Error;

// ============================================================================
// Fault Description
// ============================================================================

/// Page-fault error code: the page was present (protection violation)
pub const PF_P: u64 = 0x1;
/// Page-fault error code: the access was a write
pub const PF_W: u64 = 0x2;
/// Page-fault error code: the access came from user mode
pub const PF_U: u64 = 0x4;

/// A page fault as reported by the trap handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting address
    pub addr: VirtAddress,
    /// Taken in user mode
    pub user: bool,
    /// Write access
    pub write: bool,
    /// No translation existed (as opposed to a rights violation)
    pub not_present: bool,
}

impl PageFault {
    pub fn new(addr: VirtAddress, user: bool, write: bool, not_present: bool) -> Self {
        Self {
            addr,
            user,
            write,
            not_present,
        }
    }

    /// Decode the hardware error code
    pub fn from_error_code(addr: VirtAddress, error_code: u64) -> Self {
        Self {
            addr,
            user: error_code & PF_U != 0,
            write: error_code & PF_W != 0,
            not_present: error_code & PF_P == 0,
        }
    }
}

// ============================================================================
// Fault Errors
// ============================================================================

/// Why a fault could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultError {
    /// Dereference of address zero
    #[error("null address")]
    NullAddress,
    /// Address outside user space
    #[error("kernel address {0:#x}")]
    KernelAddress(VirtAddress),
    /// Page present but the access is not allowed
    #[error("protection violation at {0:#x}")]
    ProtectionViolation(VirtAddress),
    /// No page registered and not a stack access
    #[error("no page at {0:#x}")]
    NotMapped(VirtAddress),
    /// Write to a read-only page
    #[error("write to read-only page {0:#x}")]
    ReadOnly(VirtAddress),
    /// Bringing the page in failed
    #[error("claim of {addr:#x} failed: {source}")]
    Claim {
        addr: VirtAddress,
        #[source]
        source: VmError,
    },
}

impl FaultError {
    /// Whether the kernel cannot continue
    pub fn is_kernel_fatal(&self) -> bool {
        match self {
            FaultError::Claim { source, .. } => source.is_kernel_fatal(),
            _ => false,
        }
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultStep {
    Check,
    Stack { sp: VirtAddress },
    Lookup,
    Claim { page: VirtAddress },
}

impl AddressSpace {
    /// Resolve a page fault taken while this space was active
    ///
    /// `frame` supplies the user stack pointer for user-mode faults; faults
    /// taken in kernel mode use the pointer saved on kernel entry.
    pub fn resolve_fault(&self, fault: &PageFault, frame: &TrapFrame) -> Result<(), FaultError> {
        let stats = self.vm().stats();
        stats.incr_faults();
        log::trace!(
            "fault: {:#x} ({}{}{})",
            fault.addr,
            if fault.user { "user " } else { "kernel " },
            if fault.write { "write" } else { "read" },
            if fault.not_present { "" } else { ", present" }
        );

        let result = self.run_fault(fault, frame);
        if let Err(err) = &result {
            stats.incr_fault_failures();
            if err.is_kernel_fatal() {
                log::error!("fault: {}", err);
            } else {
                log::warn!("fault: {}", err);
            }
        }
        result
    }

    fn run_fault(&self, fault: &PageFault, frame: &TrapFrame) -> Result<(), FaultError> {
        let addr = fault.addr;
        let mut step = FaultStep::Check;
        loop {
            step = match step {
                FaultStep::Check => {
                    if addr == 0 {
                        return Err(FaultError::NullAddress);
                    }
                    if !self.config().is_user_vaddr(addr) {
                        return Err(FaultError::KernelAddress(addr));
                    }
                    if !fault.not_present {
                        return Err(FaultError::ProtectionViolation(addr));
                    }
                    let sp = if fault.user {
                        frame.rsp
                    } else {
                        self.saved_user_sp()
                    };
                    FaultStep::Stack { sp }
                }
                FaultStep::Stack { sp } => {
                    if self.is_stack_access(addr, sp) {
                        self.grow_stack(addr)
                            .map_err(|source| FaultError::Claim { addr, source })?;
                    }
                    FaultStep::Lookup
                }
                FaultStep::Lookup => {
                    let info = self
                        .page_info(addr)
                        .ok_or(FaultError::NotMapped(addr))?;
                    if fault.write && !info.writable {
                        return Err(FaultError::ReadOnly(addr));
                    }
                    FaultStep::Claim { page: info.va }
                }
                FaultStep::Claim { page } => {
                    return match self.claim(page) {
                        Ok(()) => Ok(()),
                        Err(VmError::NotMapped(_)) => Err(FaultError::NotMapped(addr)),
                        Err(source) => Err(FaultError::Claim { addr, source }),
                    };
                }
            };
        }
    }

    /// Whether `addr` is a legitimate stack access for stack pointer `sp`
    pub fn is_stack_access(&self, addr: VirtAddress, sp: VirtAddress) -> bool {
        let config = self.config();
        let in_window = addr >= config.stack_floor() && addr < config.user_stack;
        in_window && addr >= sp.saturating_sub(STACK_SLACK) && trunc_page(addr) != 0
    }
}
