//! Shared harness for the scenario tests
//!
//! Builds a simulated machine and emulates user-mode loads and stores the
//! way the MMU would: an access that misses raises a page fault, the fault
//! is resolved, and the access is retried.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use demand_pager::trap::TrapFrame;
use demand_pager::vm::hal::AccessFault;
use demand_pager::vm::sim::{SimDisk, SimFile, SimPageTable, SimPhysMemory};
use demand_pager::vm::{
    page_offset, trunc_page, AddressSpace, FaultError, FileRef, IoError, PageFault, PageTable,
    VmConfig, VmFile, VmSystem, PAGE_SIZE, SECTORS_PER_PAGE, USER_STACK,
};

/// Upper bound on fault/retry rounds for one access
const MAX_RETRIES: usize = 10_000;

pub struct Machine {
    pub vm: Arc<VmSystem>,
    pub phys: Arc<SimPhysMemory>,
    pub disk: Arc<SimDisk>,
}

impl Machine {
    pub fn new(frames: usize, swap_slots: usize) -> Self {
        Self::with_config(VmConfig::default(), frames, swap_slots)
    }

    pub fn with_config(config: VmConfig, frames: usize, swap_slots: usize) -> Self {
        let phys = Arc::new(SimPhysMemory::new(frames));
        let disk = Arc::new(SimDisk::new(swap_slots * SECTORS_PER_PAGE));
        let vm = VmSystem::new(config, phys.clone(), disk.clone());
        Self { vm, phys, disk }
    }

    /// A fresh address space and its page table
    pub fn space(&self) -> (Arc<AddressSpace>, Arc<SimPageTable>) {
        let pmap = Arc::new(SimPageTable::new());
        let space = AddressSpace::new(self.vm.clone(), pmap.clone());
        (space, pmap)
    }
}

/// A user thread running in an address space
pub struct User<'a> {
    pub space: &'a AddressSpace,
    pub sp: u64,
}

impl<'a> User<'a> {
    pub fn new(space: &'a AddressSpace) -> Self {
        Self {
            space,
            sp: USER_STACK,
        }
    }

    pub fn with_sp(space: &'a AddressSpace, sp: u64) -> Self {
        Self { space, sp }
    }

    fn access(&self, addr: u64, write: bool, f: &mut dyn FnMut(u64)) -> Result<(), FaultError> {
        let frame = TrapFrame::new(self.sp);
        let va = trunc_page(addr);
        for _ in 0..MAX_RETRIES {
            let not_present = match self.space.pmap().access(va, write, f) {
                Ok(()) => return Ok(()),
                Err(AccessFault::NotPresent) => true,
                Err(AccessFault::Protection) => false,
            };
            self.space
                .resolve_fault(&PageFault::new(addr, true, write, not_present), &frame)?;
        }
        panic!("access to {:#x} never completed", addr);
    }

    /// Store `bytes` at `addr`; must not cross a page boundary
    pub fn write(&self, addr: u64, bytes: &[u8]) -> Result<(), FaultError> {
        let phys = self.space.vm().phys();
        let offset = page_offset(addr);
        assert!(offset + bytes.len() <= PAGE_SIZE);
        self.access(addr, true, &mut |pa| phys.write(pa, offset, bytes))
    }

    /// Load `len` bytes from `addr`; must not cross a page boundary
    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, FaultError> {
        let phys = self.space.vm().phys();
        let offset = page_offset(addr);
        assert!(offset + len <= PAGE_SIZE);
        let mut buf = vec![0u8; len];
        self.access(addr, false, &mut |pa| phys.read(pa, offset, &mut buf))?;
        Ok(buf)
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), FaultError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, FaultError> {
        let bytes = self.read(addr, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("eight bytes")))
    }
}

/// Check the residency and frame-ownership invariants of a set of spaces
///
/// A page is resident exactly when it has a hardware mapping and a frame
/// table entry naming it; no frame backs two pages and no swap slot is
/// recorded by two pages.
pub fn assert_consistent(vm: &VmSystem, spaces: &[(&AddressSpace, &SimPageTable)]) {
    let frames = vm.frames().snapshot();
    let mut resident = 0;
    let mut kvas = HashSet::new();
    let mut slots = HashSet::new();

    for (space, pmap) in spaces {
        for page in space.pages() {
            let translation = pmap.translate(page.va);
            assert_eq!(
                page.resident,
                translation.is_some(),
                "page {:#x} residency disagrees with the page table",
                page.va
            );
            if let Some(translation) = translation {
                resident += 1;
                assert!(kvas.insert(translation.phys), "frame shared by two pages");
                assert!(
                    frames
                        .iter()
                        .any(|f| f.kva == translation.phys && f.va == Some(page.va)),
                    "resident page {:#x} missing from the frame table",
                    page.va
                );
            }
            if let Some(slot) = page.swap_slot {
                assert!(!page.resident, "resident page {:#x} still holds a slot", page.va);
                assert!(slots.insert(slot), "swap slot {:?} has two owners", slot);
            }
        }
    }

    assert_eq!(frames.len(), resident, "frame table holds unowned frames");
    assert_eq!(vm.swap().used_slots(), slots.len(), "leaked swap slots");
}

/// Misbehavior shared by every handle of a [`FaultyFile`]
#[derive(Default)]
pub struct FileFaults {
    /// Milliseconds each read sleeps before touching the file
    pub read_delay_ms: AtomicU64,
    /// Reads return half of what they transferred
    pub short_reads: AtomicBool,
    /// Writes transfer nothing
    pub failed_writes: AtomicBool,
    /// Reads entered so far
    pub reads_started: AtomicUsize,
}

/// A file whose I/O can be slowed down or made to fail
pub struct FaultyFile {
    inner: FileRef,
    pub faults: Arc<FileFaults>,
}

impl FaultyFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(SimFile::new(data)),
            faults: Arc::default(),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.inner.length() as usize];
        self.inner.read_at(&mut buf, 0);
        buf
    }
}

impl VmFile for FaultyFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        self.faults.reads_started.fetch_add(1, Ordering::SeqCst);
        let delay = self.faults.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        let n = self.inner.read_at(buf, offset);
        if self.faults.short_reads.load(Ordering::SeqCst) {
            n / 2
        } else {
            n
        }
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        if self.faults.failed_writes.load(Ordering::SeqCst) {
            return 0;
        }
        self.inner.write_at(buf, offset)
    }

    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn reopen(&self) -> Result<FileRef, IoError> {
        Ok(Arc::new(FaultyFile {
            inner: self.inner.reopen()?,
            faults: Arc::clone(&self.faults),
        }))
    }
}

/// Distinct, recognizable contents for page `i`
pub fn pattern(i: u64) -> u64 {
    0xA5A5_0000_0000_0000 | (i * 0x1_0001)
}
