//! Process - the owner of an address space
//!
//! Only the lifecycle pieces the pager cares about: a process is created
//! with an empty address space, can be forked (private copy of every page)
//! and exits by tearing its address space down.

use alloc::string::String;
use alloc::sync::Arc;
use spin::Mutex;
use thiserror::Error;

use crate::trap::{self, TrapFrame, TrapOutcome};
use crate::types::{Pid, VirtAddress};
use crate::vm::{AddressSpace, PageTable, VmError, VmSystem};

/// Process lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Running with a live address space
    Running,
    /// Exited; the status is kept for the parent
    Exited(i32),
}

/// Process lifecycle errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// The process has already exited
    #[error("process has exited")]
    Exited,
    /// Copying the address space failed
    #[error("vm: {0}")]
    Vm(#[from] VmError),
}

/// A user process
pub struct Process {
    /// Process identifier
    pub pid: Pid,
    /// Name used in exit messages
    pub name: String,
    state: Mutex<ProcessState>,
    space: Mutex<Option<Arc<AddressSpace>>>,
}

impl Process {
    /// Create a process with an empty address space
    pub fn create(name: &str, vm: Arc<VmSystem>, pmap: Arc<dyn PageTable>) -> Arc<Self> {
        Self::with_space(String::from(name), AddressSpace::new(vm, pmap))
    }

    fn with_space(name: String, space: Arc<AddressSpace>) -> Arc<Self> {
        Arc::new(Self {
            pid: Pid::new(),
            name,
            state: Mutex::new(ProcessState::Running),
            space: Mutex::new(Some(space)),
        })
    }

    /// The address space, `None` after exit
    pub fn space(&self) -> Option<Arc<AddressSpace>> {
        self.space.lock().clone()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// Duplicate this process; the child gets a private copy of every page
    pub fn fork(&self, pmap: Arc<dyn PageTable>) -> Result<Arc<Self>, ProcessError> {
        let space = self.space().ok_or(ProcessError::Exited)?;
        let child_space = space.fork(pmap)?;
        let child = Self::with_space(self.name.clone(), child_space);
        log::debug!("process {}: forked child {}", self.pid.0, child.pid.0);
        Ok(child)
    }

    /// Terminate the process, releasing every page it owns
    ///
    /// Exiting twice keeps the first status.
    pub fn exit(&self, status: i32) {
        let mut state = self.state.lock();
        if let ProcessState::Exited(_) = *state {
            return;
        }
        *state = ProcessState::Exited(status);
        drop(state);

        let space = self.space.lock().take();
        if let Some(space) = space {
            space.destroy_all();
        }
        log::info!("{}: exit({})", self.name, status);
    }

    /// Page-fault trap on behalf of this process; kills it on failure
    pub fn page_fault(&self, addr: VirtAddress, frame: &TrapFrame) -> TrapOutcome {
        let Some(space) = self.space() else {
            return TrapOutcome::Kill {
                status: trap::KILLED_EXIT_STATUS,
            };
        };
        let outcome = trap::page_fault(&space, addr, frame);
        drop(space);
        if let TrapOutcome::Kill { status } = outcome {
            self.exit(status);
        }
        outcome
    }
}
