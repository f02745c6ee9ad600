//! Frame Table - Resident Frames and Clock Eviction
//!
//! Every user frame handed out by the pager is tracked here together with the
//! page that currently owns it. When the physical pool runs dry a victim is
//! chosen with the second-chance (clock) algorithm:
//!
//! 1. Frames are kept on a circular list, oldest first.
//! 2. A frame whose accessed bit is set gets the bit cleared and moves to
//!    the back of the list.
//! 3. The first frame found with the bit clear is evicted.
//! 4. If a full sweep finds nothing, a second sweep takes the first frame
//!    that can be evicted at all.
//!
//! ## Pinning
//!
//! A freshly acquired frame is *pinned* and has no owner until the claiming
//! thread binds it to a page. The clock never selects pinned frames, so a
//! frame being filled cannot be stolen.
//!
//! ## Locking
//!
//! The frame table lock is taken after an address space's page-table lock,
//! never before. Eviction runs under the frame table lock and therefore only
//! `try_lock`s the victim's page table; owners that are busy are skipped.
//!
//! A sweep that skips every frame is retried with the frame table unlocked,
//! for as long as it takes: pinned frames get bound and busy owners finish
//! their I/O. Apart from eviction errors, acquisition only fails when there
//! are no frames at all.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;

use super::hal::PageTable;
use super::space::AddressSpace;
use super::{VmError, VmSystem};
use crate::types::{PhysAddress, VirtAddress};

/// Fruitless sweeps before a waiting acquisition is logged
const EVICT_WAIT_WARN: usize = 64;

/// Handle to a frame table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(u32);

impl FrameId {
    /// Raw index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A frame handed to a claimer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub id: FrameId,
    pub kva: PhysAddress,
}

/// Page currently occupying a frame
pub(crate) struct FrameOwner {
    pub space: Weak<AddressSpace>,
    pub pmap: Arc<dyn PageTable>,
    pub va: VirtAddress,
}

struct FrameRecord {
    kva: PhysAddress,
    owner: Option<FrameOwner>,
    pinned: bool,
}

/// Read-only view of one frame table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub id: FrameId,
    pub kva: PhysAddress,
    pub va: Option<VirtAddress>,
    pub pinned: bool,
}

struct FrameTableInner {
    records: Vec<Option<FrameRecord>>,
    free_ids: Vec<u32>,
    /// Clock order, oldest first
    clock: VecDeque<FrameId>,
}

impl FrameTableInner {
    fn insert(&mut self, kva: PhysAddress) -> FrameId {
        let record = FrameRecord {
            kva,
            owner: None,
            pinned: true,
        };
        let id = match self.free_ids.pop() {
            Some(raw) => {
                self.records[raw as usize] = Some(record);
                FrameId(raw)
            }
            None => {
                self.records.push(Some(record));
                FrameId((self.records.len() - 1) as u32)
            }
        };
        self.clock.push_back(id);
        id
    }

    fn get(&self, id: FrameId) -> Option<&FrameRecord> {
        self.records.get(id.index()).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: FrameId) -> Option<&mut FrameRecord> {
        self.records.get_mut(id.index()).and_then(Option::as_mut)
    }

    fn remove(&mut self, id: FrameId) -> Option<FrameRecord> {
        let record = self.records.get_mut(id.index())?.take()?;
        self.clock.retain(|&entry| entry != id);
        self.free_ids.push(id.0);
        Some(record)
    }
}

/// Result of examining one clock entry
enum Sweep {
    Skip,
    Evicted(PhysAddress),
}

/// Global table of resident user frames
pub struct FrameTable {
    inner: Mutex<FrameTableInner>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FrameTableInner {
                records: Vec::new(),
                free_ids: Vec::new(),
                clock: VecDeque::new(),
            }),
        }
    }

    /// Obtain a pinned, ownerless frame
    ///
    /// Takes a page from the physical pool if one is free, otherwise evicts
    /// a resident page, waiting while every frame is pinned or its owner is
    /// busy.
    pub fn acquire(&self, vm: &VmSystem) -> Result<Frame, VmError> {
        let mut sweeps = 0usize;
        loop {
            // Declared before the guard so any address space kept alive only
            // by an upgrade is dropped after the frame table is unlocked.
            let mut victims: Vec<Arc<AddressSpace>> = Vec::new();
            let mut inner = self.inner.lock();

            if let Some(kva) = vm.phys().alloc_page() {
                let id = inner.insert(kva);
                return Ok(Frame { id, kva });
            }
            if inner.clock.is_empty() {
                log::error!("frame: physical pool is empty and no frame is resident");
                return Err(VmError::NoEvictableFrame);
            }

            if let Some(frame) = Self::evict(vm, &mut inner, &mut victims, true)? {
                return Ok(frame);
            }
            if let Some(frame) = Self::evict(vm, &mut inner, &mut victims, false)? {
                return Ok(frame);
            }

            drop(inner);
            drop(victims);
            sweeps += 1;
            if sweeps == EVICT_WAIT_WARN {
                log::warn!("frame: every resident frame is pinned or busy, waiting");
            }
            core::hint::spin_loop();
        }
    }

    /// Attach a frame to the page that now occupies it and unpin it
    pub(crate) fn bind(&self, id: FrameId, owner: FrameOwner) {
        if let Some(record) = self.inner.lock().get_mut(id) {
            record.owner = Some(owner);
            record.pinned = false;
        }
    }

    /// Remove a frame: unmap its owner, free the physical page, drop the entry
    pub fn release(&self, vm: &VmSystem, id: FrameId) {
        let record = self.inner.lock().remove(id);
        if let Some(record) = record {
            if let Some(owner) = record.owner {
                owner.pmap.unmap(owner.va);
            }
            vm.phys().free_page(record.kva);
        }
    }

    /// Physical address of a frame
    pub fn kva(&self, id: FrameId) -> Option<PhysAddress> {
        self.inner.lock().get(id).map(|record| record.kva)
    }

    /// Number of frames currently tracked
    pub fn len(&self) -> usize {
        self.inner.lock().clock.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry in clock order
    pub fn snapshot(&self) -> Vec<FrameSnapshot> {
        let inner = self.inner.lock();
        inner
            .clock
            .iter()
            .filter_map(|&id| {
                inner.get(id).map(|record| FrameSnapshot {
                    id,
                    kva: record.kva,
                    va: record.owner.as_ref().map(|owner| owner.va),
                    pinned: record.pinned,
                })
            })
            .collect()
    }

    /// One sweep of the clock hand
    ///
    /// With `second_chance` set, frames whose accessed bit is set are spared
    /// and have the bit cleared. Returns the reclaimed frame, pinned and at
    /// the back of the clock, or `None` if the sweep found nothing.
    fn evict(
        vm: &VmSystem,
        inner: &mut FrameTableInner,
        victims: &mut Vec<Arc<AddressSpace>>,
        second_chance: bool,
    ) -> Result<Option<Frame>, VmError> {
        for _ in 0..inner.clock.len() {
            let Some(id) = inner.clock.pop_front() else {
                break;
            };
            // Clock order: the examined frame goes to the back either way.
            inner.clock.push_back(id);

            match Self::examine(vm, inner, victims, id, second_chance)? {
                Sweep::Skip => continue,
                Sweep::Evicted(kva) => {
                    vm.stats().incr_evictions();
                    return Ok(Some(Frame { id, kva }));
                }
            }
        }
        Ok(None)
    }

    fn examine(
        vm: &VmSystem,
        inner: &mut FrameTableInner,
        victims: &mut Vec<Arc<AddressSpace>>,
        id: FrameId,
        second_chance: bool,
    ) -> Result<Sweep, VmError> {
        let Some(record) = inner.get_mut(id) else {
            return Ok(Sweep::Skip);
        };
        if record.pinned {
            vm.stats().incr_skipped();
            return Ok(Sweep::Skip);
        }
        let kva = record.kva;
        let Some(owner) = record.owner.as_ref() else {
            return Ok(Sweep::Skip);
        };

        if second_chance && owner.pmap.is_accessed(owner.va) {
            owner.pmap.set_accessed(owner.va, false);
            vm.stats().incr_second_chances();
            return Ok(Sweep::Skip);
        }

        // Owner is tearing down; its own teardown releases the frame.
        let Some(space) = owner.space.upgrade() else {
            vm.stats().incr_skipped();
            return Ok(Sweep::Skip);
        };
        let pmap = owner.pmap.clone();
        let va = owner.va;

        let outcome = match space.spt.try_lock() {
            Some(mut spt) => match spt.get_mut(va) {
                Some(page) if page.frame == Some(id) => {
                    let result = page.swap_out(vm, &*pmap, kva);
                    if result.is_ok() {
                        page.frame = None;
                    }
                    Some(result)
                }
                _ => None,
            },
            None => None,
        };
        victims.push(space);

        match outcome {
            None => {
                vm.stats().incr_skipped();
                Ok(Sweep::Skip)
            }
            Some(Err(err)) => Err(err),
            Some(Ok(())) => {
                log::debug!("frame: evicted {:#x} from frame {:#x}", va, kva);
                if let Some(record) = inner.get_mut(id) {
                    record.owner = None;
                    record.pinned = true;
                }
                Ok(Sweep::Evicted(kva))
            }
        }
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}
