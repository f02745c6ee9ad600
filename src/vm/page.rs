//! Virtual Pages
//!
//! A [`Page`] describes one page-aligned user address: its permissions, its
//! backing store and, while resident, the frame holding its contents.
//!
//! ## Backing Kinds
//!
//! - **Uninit**: registered but never touched. Carries the kind it turns
//!   into on the first fault plus an optional lazy-load descriptor.
//! - **Anon**: swap-backed memory (stack, heap, executable data after load).
//! - **File**: a chunk of a memory-mapped file, written back when dirty.
//!
//! Swap operations dispatch on the kind with a plain `match`; the kind-
//! specific code lives in `anon` and `file`.

use alloc::boxed::Box;

use super::anon::AnonPage;
use super::file::FilePage;
use super::frame::FrameId;
use super::hal::{self, zeroed_page, FileRef, PageBuf, PageTable};
use super::swap::SwapSlot;
use super::{VmError, VmSystem, PAGE_SIZE};
use crate::types::{PhysAddress, VirtAddress};

/// Page kind as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Not yet materialized
    Uninit,
    /// Anonymous, swap-backed
    Anon,
    /// Backed by a mapped file
    File,
}

/// Deferred file read performed on first access
#[derive(Clone)]
pub struct LazyLoad {
    /// Source file
    pub file: FileRef,
    /// Byte offset of the page's data in the file
    pub offset: u64,
    /// Bytes to read; the rest of the page is zero-filled
    pub read_bytes: usize,
}

impl LazyLoad {
    pub fn new(file: FileRef, offset: u64, read_bytes: usize) -> Self {
        Self {
            file,
            offset,
            read_bytes: read_bytes.min(PAGE_SIZE),
        }
    }

    /// Bytes zero-filled after the file data
    pub fn zero_bytes(&self) -> usize {
        PAGE_SIZE - self.read_bytes
    }

    /// Read the file bytes into the frame at `kva`, then zeros
    pub(crate) fn load(&self, vm: &VmSystem, kva: PhysAddress) -> Result<(), VmError> {
        let mut buf = zeroed_page();
        hal::read_exact_at(&*self.file, &mut buf[..self.read_bytes], self.offset)?;
        vm.phys().write_page(kva, &buf);
        vm.stats().incr_file_reads();
        Ok(())
    }
}

/// Page not yet touched
pub(crate) struct UninitPage {
    /// Kind the page becomes on first claim
    pub target: PageKind,
    pub lazy: Option<LazyLoad>,
    /// Start of the mapped region for file pages
    pub region: Option<VirtAddress>,
}

pub(crate) enum Backing {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

/// One entry of the supplemental page table
pub struct Page {
    pub(crate) va: VirtAddress,
    pub(crate) writable: bool,
    pub(crate) backing: Backing,
    pub(crate) frame: Option<FrameId>,
    /// Created by stack growth or stack setup
    pub(crate) stack: bool,
    /// Contents inherited from a fork parent, consumed by the next swap-in
    pub(crate) inherited: Option<Box<PageBuf>>,
}

/// Read-only view of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub va: VirtAddress,
    pub kind: PageKind,
    /// Kind after materialization
    pub target: PageKind,
    pub writable: bool,
    pub resident: bool,
    pub stack: bool,
    pub swap_slot: Option<SwapSlot>,
}

impl Page {
    pub(crate) fn uninit(
        va: VirtAddress,
        writable: bool,
        target: PageKind,
        lazy: Option<LazyLoad>,
        region: Option<VirtAddress>,
    ) -> Self {
        Self {
            va,
            writable,
            backing: Backing::Uninit(UninitPage {
                target,
                lazy,
                region,
            }),
            frame: None,
            stack: false,
            inherited: None,
        }
    }

    pub(crate) fn anon(va: VirtAddress, writable: bool) -> Self {
        Self {
            va,
            writable,
            backing: Backing::Anon(AnonPage::new()),
            frame: None,
            stack: false,
            inherited: None,
        }
    }

    pub(crate) fn with_stack(mut self) -> Self {
        self.stack = true;
        self
    }

    pub fn va(&self) -> VirtAddress {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    /// Current kind
    pub fn kind(&self) -> PageKind {
        match self.backing {
            Backing::Uninit(_) => PageKind::Uninit,
            Backing::Anon(_) => PageKind::Anon,
            Backing::File(_) => PageKind::File,
        }
    }

    /// Kind, looking through an uninitialized page to what it will become
    pub fn target_kind(&self) -> PageKind {
        match &self.backing {
            Backing::Uninit(uninit) => uninit.target,
            _ => self.kind(),
        }
    }

    pub fn info(&self) -> PageInfo {
        let swap_slot = match &self.backing {
            Backing::Anon(anon) => anon.slot,
            _ => None,
        };
        PageInfo {
            va: self.va,
            kind: self.kind(),
            target: self.target_kind(),
            writable: self.writable,
            resident: self.is_resident(),
            stack: self.stack,
            swap_slot,
        }
    }

    /// Fill the frame at `kva` with this page's contents
    ///
    /// Nothing about the page changes, so a claim that fails later can drop
    /// the frame and the page is still reconstructible. [`Page::commit`]
    /// finishes the transition once the frame is mapped.
    pub(crate) fn fill(&self, vm: &VmSystem, kva: PhysAddress) -> Result<(), VmError> {
        if let Some(bytes) = &self.inherited {
            vm.phys().write_page(kva, bytes);
            return Ok(());
        }
        match &self.backing {
            Backing::Uninit(uninit) => match (&uninit.lazy, uninit.target) {
                (Some(lazy), _) => lazy.load(vm, kva),
                (None, PageKind::File) => Err(VmError::InvalidBacking(self.va)),
                (None, _) => {
                    AnonPage::zero(vm, kva);
                    Ok(())
                }
            },
            Backing::Anon(anon) => anon.fill(vm, kva),
            Backing::File(file) => file.fill(vm, kva),
        }
    }

    /// Record that the frame filled by [`Page::fill`] is now mapped
    ///
    /// An uninitialized page becomes its target kind, inherited contents
    /// are dropped and a swap slot that was read back is freed.
    pub(crate) fn commit(&mut self, vm: &VmSystem) {
        self.inherited = None;
        if let Backing::Uninit(uninit) = &mut self.backing {
            let backing = match (uninit.target, uninit.lazy.take()) {
                (PageKind::File, Some(lazy)) => Backing::File(FilePage::new(lazy, uninit.region)),
                _ => Backing::Anon(AnonPage::new()),
            };
            self.backing = backing;
        }
        if let Backing::Anon(anon) = &mut self.backing {
            anon.commit(vm);
        }
    }

    /// Save this page's contents and drop its hardware mapping
    ///
    /// On success the frame at `kva` holds nothing the page still needs.
    pub(crate) fn swap_out(
        &mut self,
        vm: &VmSystem,
        pmap: &dyn PageTable,
        kva: PhysAddress,
    ) -> Result<(), VmError> {
        match &mut self.backing {
            Backing::Anon(anon) => anon.swap_out(vm, pmap, self.va, self.writable, kva),
            Backing::File(file) => file.swap_out(vm, pmap, self.va, self.writable, kva),
            Backing::Uninit(_) => {
                pmap.unmap(self.va);
                Ok(())
            }
        }
    }

    /// Release everything the page holds
    ///
    /// Dirty file contents are written back before the frame is freed.
    pub(crate) fn destroy(mut self, vm: &VmSystem, pmap: &dyn PageTable) -> Result<(), VmError> {
        let mut result = Ok(());
        if let Some(id) = self.frame.take() {
            if let Backing::File(file) = &self.backing {
                if let Some(kva) = vm.frame_address(id) {
                    result = file.flush(vm, pmap, self.va, kva);
                }
            }
            vm.release_frame(id);
        }
        if let Backing::Anon(anon) = &mut self.backing {
            anon.destroy(vm);
        }
        result
    }
}
