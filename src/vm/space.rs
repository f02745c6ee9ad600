//! Address Spaces
//!
//! An [`AddressSpace`] is one process's view of user memory: the supplemental
//! page table, the hardware page table it drives, and the saved user stack
//! pointer used when a fault is taken in kernel mode.
//!
//! ## Claiming
//!
//! Bringing a page into memory ("claiming" it) never holds the page-table
//! lock while a frame is acquired, because acquisition may evict a page from
//! any address space, this one included:
//!
//! 1. Check the page under the lock, then drop the lock.
//! 2. Acquire a pinned frame.
//! 3. Relock, re-check, fill the frame and install the mapping.
//! 4. Only then update the page's own state and bind the frame.
//!
//! ## Fork
//!
//! The child gets private copies of everything. Resident pages are copied
//! into new frames immediately; pages sitting in swap are read into a
//! private buffer that the child materializes on its next fault, so no swap
//! slot ever has two owners.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::anon::AnonPage;
use super::file;
use super::frame::FrameOwner;
use super::hal::{zeroed_page, FileRef, PageBuf, PageTable};
use super::page::{Backing, LazyLoad, Page, PageInfo, PageKind, UninitPage};
use super::spt::{MappedRegion, SupplementalPageTable};
use super::{is_page_aligned, trunc_page, VmConfig, VmError, VmSystem, PAGE_SIZE};
use crate::types::{SpaceId, VirtAddress};

/// A child page waiting to be inserted, with the data it must start with
struct ForkSeed {
    page: Page,
    /// Claim immediately, restoring the parent's dirty bit
    eager: Option<bool>,
}

/// One process's user address space
pub struct AddressSpace {
    id: SpaceId,
    vm: Arc<VmSystem>,
    pmap: Arc<dyn PageTable>,
    pub(crate) spt: Mutex<SupplementalPageTable>,
    /// User stack pointer saved on entry to the kernel
    saved_user_sp: AtomicU64,
    this: Weak<AddressSpace>,
}

impl AddressSpace {
    /// Create an empty address space over a hardware page table
    ///
    /// The saved user stack pointer starts at the top of the stack.
    pub fn new(vm: Arc<VmSystem>, pmap: Arc<dyn PageTable>) -> Arc<Self> {
        let stack_top = vm.config().user_stack;
        Arc::new_cyclic(|this| Self {
            id: SpaceId::new(),
            vm,
            pmap,
            spt: Mutex::new(SupplementalPageTable::new()),
            saved_user_sp: AtomicU64::new(stack_top),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn vm(&self) -> &Arc<VmSystem> {
        &self.vm
    }

    pub fn config(&self) -> &VmConfig {
        self.vm.config()
    }

    /// Hardware page table
    pub fn pmap(&self) -> &dyn PageTable {
        &*self.pmap
    }

    /// Record the user stack pointer on kernel entry
    pub fn set_saved_user_sp(&self, sp: VirtAddress) {
        self.saved_user_sp.store(sp, Ordering::Relaxed);
    }

    pub fn saved_user_sp(&self) -> VirtAddress {
        self.saved_user_sp.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn check_user_page(&self, va: VirtAddress) -> Result<(), VmError> {
        if !is_page_aligned(va) {
            return Err(VmError::Unaligned(va));
        }
        if va == 0 || !self.config().is_user_range(va, PAGE_SIZE as u64) {
            return Err(VmError::KernelAddress(va));
        }
        Ok(())
    }

    /// Register a page that materializes as `kind` on its first fault
    ///
    /// File pages need a lazy-load descriptor naming the file chunk.
    pub fn create_uninitialized_page(
        &self,
        va: VirtAddress,
        writable: bool,
        kind: PageKind,
        lazy: Option<LazyLoad>,
    ) -> Result<(), VmError> {
        self.check_user_page(va)?;
        match (kind, &lazy) {
            (PageKind::Uninit, _) | (PageKind::File, None) => {
                return Err(VmError::InvalidBacking(va))
            }
            _ => {}
        }
        self.spt
            .lock()
            .insert(Page::uninit(va, writable, kind, lazy, None))
    }

    /// Register one page of an executable to be read from `file` on demand
    pub fn register_lazy_page(
        &self,
        va: VirtAddress,
        writable: bool,
        file: FileRef,
        offset: u64,
        read_bytes: usize,
    ) -> Result<(), VmError> {
        let lazy = LazyLoad::new(file, offset, read_bytes);
        self.create_uninitialized_page(va, writable, PageKind::Anon, Some(lazy))
    }

    /// Register an executable segment page by page
    ///
    /// `read_bytes` bytes come from `file` at `offset`, followed by
    /// `zero_bytes` zeros; together they must cover whole pages.
    pub fn load_segment(
        &self,
        file: &FileRef,
        offset: u64,
        upage: VirtAddress,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        if (read_bytes + zero_bytes) % PAGE_SIZE != 0 || !is_page_aligned(offset) {
            return Err(VmError::Unaligned(upage));
        }
        self.check_user_page(upage)?;

        let mut va = upage;
        let mut offset = offset;
        let mut remaining = read_bytes;
        for _ in 0..(read_bytes + zero_bytes) / PAGE_SIZE {
            let page_read = remaining.min(PAGE_SIZE);
            self.register_lazy_page(va, writable, file.clone(), offset, page_read)?;
            remaining -= page_read;
            offset += page_read as u64;
            va += PAGE_SIZE as u64;
        }
        log::debug!(
            "load: segment at {:#x}, {} bytes from file, {} zero",
            upage,
            read_bytes,
            zero_bytes
        );
        Ok(())
    }

    /// Create the first stack page and return the initial stack pointer
    pub fn setup_stack(&self) -> Result<VirtAddress, VmError> {
        let top = self.config().user_stack;
        let va = top - PAGE_SIZE as u64;
        self.check_user_page(va)?;
        self.spt.lock().insert(Page::anon(va, true).with_stack())?;
        self.claim(va)?;
        Ok(top)
    }

    /// Create a zero-filled stack page below the current stack
    pub(crate) fn grow_stack(&self, va: VirtAddress) -> Result<bool, VmError> {
        let va = trunc_page(va);
        self.check_user_page(va)?;
        match self.spt.lock().insert(Page::anon(va, true).with_stack()) {
            Ok(()) => {
                self.vm.stats().incr_stack_growths();
                log::trace!("stack: grew to {:#x}", va);
                Ok(true)
            }
            Err(VmError::AlreadyMapped(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Page containing `va`
    pub fn lookup(&self, va: VirtAddress) -> Result<PageInfo, VmError> {
        self.page_info(va).ok_or(VmError::NotMapped(trunc_page(va)))
    }

    pub fn page_info(&self, va: VirtAddress) -> Option<PageInfo> {
        self.spt.lock().get(va).map(Page::info)
    }

    /// Kind of the page at `va`, looking through an uninitialized page
    pub fn page_kind(&self, va: VirtAddress) -> Option<PageKind> {
        self.spt.lock().get(va).map(Page::target_kind)
    }

    /// Every page in address order
    pub fn pages(&self) -> Vec<PageInfo> {
        self.spt.lock().infos()
    }

    pub fn resident_count(&self) -> usize {
        self.spt.lock().resident_count()
    }

    // ========================================================================
    // Claim / Remove
    // ========================================================================

    /// Bring the page at `va` into memory now
    pub fn claim_page(&self, va: VirtAddress) -> Result<(), VmError> {
        self.claim(va)
    }

    pub(crate) fn claim(&self, va: VirtAddress) -> Result<(), VmError> {
        self.claim_with(va, false)
    }

    /// Claim `va`, marking the new mapping dirty before the clock can see it
    fn claim_with(&self, va: VirtAddress, dirty: bool) -> Result<(), VmError> {
        let va = trunc_page(va);
        {
            let spt = self.spt.lock();
            match spt.get(va) {
                None => return Err(VmError::NotMapped(va)),
                Some(page) if page.is_resident() => return Ok(()),
                Some(_) => {}
            }
        }

        let frame = self.vm.acquire_frame()?;

        let mut spt = self.spt.lock();
        let page = match spt.get_mut(va) {
            Some(page) if !page.is_resident() => page,
            other => {
                let result = match other {
                    None => Err(VmError::NotMapped(va)),
                    Some(_) => Ok(()),
                };
                drop(spt);
                self.vm.release_frame(frame.id);
                return result;
            }
        };

        // The page itself is untouched until the mapping is in place.
        if let Err(err) = page.fill(&self.vm, frame.kva) {
            drop(spt);
            self.vm.release_frame(frame.id);
            return Err(err);
        }
        if let Err(err) = self.pmap.map(va, frame.kva, page.writable) {
            log::error!("claim: mapping {:#x} failed: {}", va, err);
            drop(spt);
            self.vm.release_frame(frame.id);
            return Err(err.into());
        }
        if dirty {
            self.pmap.set_dirty(va, true);
        }
        page.commit(&self.vm);
        page.frame = Some(frame.id);
        self.vm.frames().bind(
            frame.id,
            FrameOwner {
                space: self.this.clone(),
                pmap: self.pmap.clone(),
                va,
            },
        );
        drop(spt);

        self.vm.stats().incr_claims();
        log::trace!("claim: {:#x} -> frame {:#x}", va, frame.kva);
        Ok(())
    }

    /// Destroy the page at `va` and drop it from the table
    pub fn remove(&self, va: VirtAddress) -> Result<(), VmError> {
        let mut spt = self.spt.lock();
        let page = spt.remove(va).ok_or(VmError::NotMapped(trunc_page(va)))?;
        page.destroy(&self.vm, &*self.pmap)
    }

    /// Release every page, frame, swap slot and mapped file (process exit)
    pub fn destroy_all(&self) {
        let mut spt = self.spt.lock();
        let (pages, regions) = spt.drain();
        let count = pages.len();
        for page in pages {
            let va = page.va;
            if let Err(err) = page.destroy(&self.vm, &*self.pmap) {
                log::warn!("exit: tearing down {:#x} failed: {}", va, err);
            }
        }
        drop(spt);
        drop(regions);
        log::debug!("space {}: destroyed {} pages", self.id.0, count);
    }

    // ========================================================================
    // Fork
    // ========================================================================

    /// Copy every page of this space into the empty space `dst`
    pub fn copy_into(&self, dst: &AddressSpace) -> Result<(), VmError> {
        let seeds = self.fork_seeds()?;

        let mut eager = Vec::new();
        {
            let mut dst_spt = dst.spt.lock();
            let (pages, regions) = seeds;
            for region in regions {
                dst_spt.insert_region(region);
            }
            for seed in pages {
                if let Some(dirty) = seed.eager {
                    eager.push((seed.page.va, dirty));
                }
                dst_spt.insert(seed.page)?;
            }
        }

        for (va, dirty) in eager {
            dst.claim_with(va, dirty)?;
        }
        Ok(())
    }

    /// Snapshot this space for a child, under this space's lock
    fn fork_seeds(&self) -> Result<(Vec<ForkSeed>, Vec<MappedRegion>), VmError> {
        let spt = self.spt.lock();

        let mut regions = Vec::new();
        for region in spt.regions() {
            regions.push(file::reopen_region(region)?);
        }
        let handle_for = |start: Option<VirtAddress>| -> Option<FileRef> {
            let start = start?;
            regions
                .iter()
                .find(|region| region.start == start)
                .map(|region| region.file.clone())
        };

        let mut seeds = Vec::with_capacity(spt.len());
        for page in spt.iter() {
            let resident = match page.frame {
                Some(id) => self.vm.frame_address(id),
                None => None,
            };
            let snapshot: Option<Box<PageBuf>> = match resident {
                Some(kva) => {
                    let mut buf = zeroed_page();
                    self.vm.phys().read_page(kva, &mut buf);
                    Some(buf)
                }
                None => None,
            };
            let dirty = resident.is_some() && self.pmap.is_dirty(page.va);

            let backing = match &page.backing {
                Backing::Uninit(uninit) => {
                    let lazy = match (uninit.target, &uninit.lazy, handle_for(uninit.region)) {
                        (PageKind::File, Some(lazy), Some(handle)) => {
                            Some(LazyLoad::new(handle, lazy.offset, lazy.read_bytes))
                        }
                        (_, lazy, _) => lazy.clone(),
                    };
                    Backing::Uninit(UninitPage {
                        target: uninit.target,
                        lazy,
                        region: uninit.region,
                    })
                }
                Backing::Anon(_) => Backing::Anon(AnonPage::new()),
                Backing::File(file_page) => {
                    let handle = handle_for(file_page.region)
                        .unwrap_or_else(|| file_page.file.clone());
                    Backing::File(file::rebind(file_page, &handle))
                }
            };

            let inherited = match snapshot {
                Some(buf) => Some(buf),
                None => match &page.backing {
                    Backing::Anon(anon) if anon.slot.is_some() => anon.read_swapped(&self.vm)?,
                    _ => page.inherited.clone(),
                },
            };

            seeds.push(ForkSeed {
                page: Page {
                    va: page.va,
                    writable: page.writable,
                    backing,
                    frame: None,
                    stack: page.stack,
                    inherited,
                },
                eager: resident.map(|_| dirty),
            });
        }
        Ok((seeds, regions))
    }

    /// Create a child space holding a private copy of this one
    pub fn fork(&self, pmap: Arc<dyn PageTable>) -> Result<Arc<AddressSpace>, VmError> {
        let child = AddressSpace::new(self.vm.clone(), pmap);
        child.set_saved_user_sp(self.saved_user_sp());
        self.copy_into(&child)?;
        log::debug!("fork: space {} -> space {}", self.id.0, child.id.0);
        Ok(child)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
