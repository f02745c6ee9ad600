//! Page-fault trap entry
//!
//! Glue between the low-level exception vector and the fault resolver. The
//! vector pushes a [`TrapFrame`] and the faulting address; this module
//! decodes the error code, resolves the fault and tells the caller whether
//! to resume or terminate the faulting process.

use crate::types::VirtAddress;
use crate::vm::{AddressSpace, PageFault};

/// Exit status reported for a process killed by a bad access
pub const KILLED_EXIT_STATUS: i32 = -1;

/// Saved register state at the time of a trap
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// Stack pointer at the time of the trap
    pub rsp: u64,
    /// Hardware error code
    pub error_code: u64,
}

impl TrapFrame {
    pub fn new(rsp: u64) -> Self {
        Self { rsp, error_code: 0 }
    }

    pub fn with_error_code(mut self, error_code: u64) -> Self {
        self.error_code = error_code;
        self
    }
}

/// What the trap handler does after a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Fault resolved, restart the faulting instruction
    Resume,
    /// Terminate the faulting process with this status
    Kill { status: i32 },
}

/// Handle a page-fault trap
///
/// # Panics
///
/// Panics when resolution failed because the kernel itself is out of
/// resources (swap exhausted, no evictable frame); there is no process-level
/// recovery from those.
pub fn page_fault(space: &AddressSpace, fault_addr: VirtAddress, frame: &TrapFrame) -> TrapOutcome {
    let fault = PageFault::from_error_code(fault_addr, frame.error_code);
    match space.resolve_fault(&fault, frame) {
        Ok(()) => TrapOutcome::Resume,
        Err(err) if err.is_kernel_fatal() => {
            panic!("unrecoverable page fault at {:#x}: {}", fault_addr, err)
        }
        Err(err) => {
            log::warn!(
                "space {}: killed by page fault at {:#x}: {}",
                space.id().0,
                fault_addr,
                err
            );
            TrapOutcome::Kill {
                status: KILLED_EXIT_STATUS,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::fault::{PF_P, PF_U, PF_W};
    use crate::vm::sim::{SimDisk, SimPageTable, SimPhysMemory};
    use crate::vm::{PageKind, VmConfig, VmSystem, PAGE_SIZE, SECTORS_PER_PAGE, USER_STACK};
    use alloc::sync::Arc;

    fn space(frames: usize, slots: usize) -> Arc<AddressSpace> {
        let vm = VmSystem::new(
            VmConfig::default(),
            Arc::new(SimPhysMemory::new(frames)),
            Arc::new(SimDisk::new(slots * SECTORS_PER_PAGE)),
        );
        AddressSpace::new(vm, Arc::new(SimPageTable::new()))
    }

    #[test]
    fn test_resume_on_stack_push() {
        let space = space(2, 2);
        let sp = USER_STACK - PAGE_SIZE as u64;
        let frame = TrapFrame::new(sp).with_error_code(PF_U | PF_W);
        assert_eq!(page_fault(&space, sp - 8, &frame), TrapOutcome::Resume);
    }

    #[test]
    fn test_kill_on_bad_access() {
        let space = space(2, 2);
        let frame = TrapFrame::new(USER_STACK).with_error_code(PF_U | PF_P | PF_W);
        assert_eq!(
            page_fault(&space, 0x1000, &frame),
            TrapOutcome::Kill {
                status: KILLED_EXIT_STATUS
            }
        );
    }

    #[test]
    #[should_panic(expected = "unrecoverable page fault")]
    fn test_panic_when_swap_is_full() {
        let space = space(1, 0);
        let frame = TrapFrame::new(USER_STACK).with_error_code(PF_U);
        for va in [0x1000, 0x2000] {
            space
                .create_uninitialized_page(va, true, PageKind::Anon, None)
                .unwrap();
        }
        assert_eq!(page_fault(&space, 0x1000, &frame), TrapOutcome::Resume);
        page_fault(&space, 0x2000, &frame);
    }
}
