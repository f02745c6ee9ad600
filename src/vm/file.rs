//! File-Backed Pages and Memory-Mapped Files
//!
//! `mmap` splits a file range into page-sized chunks, each registered as a
//! lazily loaded file page sharing one reopened handle. The last chunk may be
//! short; the rest of its page is zero-filled and never written back.
//!
//! ## Write-Back
//!
//! A resident file page is written back to its file only when the hardware
//! dirty bit is set, either when the clock evicts it or when the region is
//! unmapped. Clean pages are simply dropped and re-read on the next fault.

use alloc::sync::Arc;
use thiserror::Error;

use super::hal::{self, zeroed_page, FileRef, IoError, PageTable, VmFile};
use super::page::{LazyLoad, Page, PageKind};
use super::space::AddressSpace;
use super::spt::MappedRegion;
use super::{is_page_aligned, VmError, VmSystem, PAGE_SIZE};
use crate::types::{PhysAddress, VirtAddress};

// ============================================================================
// Mapping Errors
// ============================================================================

/// Reasons an `mmap` or `munmap` request is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmapError {
    /// Mapping at address zero
    #[error("cannot map at address zero")]
    NullAddress,
    /// Zero-length mapping
    #[error("mapping length is zero")]
    ZeroLength,
    /// Address is not page aligned
    #[error("mapping address {0:#x} is not page aligned")]
    Unaligned(VirtAddress),
    /// File offset is not page aligned
    #[error("file offset {0:#x} is not page aligned")]
    UnalignedOffset(u64),
    /// Part of the range lies outside user space
    #[error("mapping at {0:#x} leaves user space")]
    OutsideUserSpace(VirtAddress),
    /// A page of the range is already in use
    #[error("page {0:#x} is already mapped")]
    Overlap(VirtAddress),
    /// The file has no contents
    #[error("cannot map an empty file")]
    EmptyFile,
    /// No mapping starts at this address
    #[error("no mapping starts at {0:#x}")]
    NotMapped(VirtAddress),
    /// The file could not be reopened
    #[error("i/o: {0}")]
    Io(#[from] IoError),
    /// Tearing the mapping down failed
    #[error("vm: {0}")]
    Vm(#[from] VmError),
}

// ============================================================================
// File Page
// ============================================================================

/// A page-sized chunk of a mapped file
pub(crate) struct FilePage {
    pub file: FileRef,
    pub offset: u64,
    /// Valid file bytes in this page
    pub read_bytes: usize,
    /// Start of the owning region
    pub region: Option<VirtAddress>,
}

impl FilePage {
    pub fn new(lazy: LazyLoad, region: Option<VirtAddress>) -> Self {
        Self {
            file: lazy.file,
            offset: lazy.offset,
            read_bytes: lazy.read_bytes,
            region,
        }
    }

    /// Read the valid bytes and zero-pad the rest of the frame
    pub fn fill(&self, vm: &VmSystem, kva: PhysAddress) -> Result<(), VmError> {
        let mut buf = zeroed_page();
        hal::read_exact_at(&*self.file, &mut buf[..self.read_bytes], self.offset)?;
        vm.phys().write_page(kva, &buf);
        vm.stats().incr_file_reads();
        Ok(())
    }

    /// Drop the mapping, writing the frame back first if it is dirty
    ///
    /// A failed write-back reinstates the dirty mapping.
    pub fn swap_out(
        &mut self,
        vm: &VmSystem,
        pmap: &dyn PageTable,
        va: VirtAddress,
        writable: bool,
        kva: PhysAddress,
    ) -> Result<(), VmError> {
        let dirty = pmap.is_dirty(va);
        pmap.unmap(va);
        if !dirty {
            return Ok(());
        }
        if let Err(err) = self.write_back(vm, kva) {
            pmap.map(va, kva, writable)?;
            pmap.set_dirty(va, true);
            return Err(err);
        }
        Ok(())
    }

    /// Final write-back before the page goes away
    pub fn flush(
        &self,
        vm: &VmSystem,
        pmap: &dyn PageTable,
        va: VirtAddress,
        kva: PhysAddress,
    ) -> Result<(), VmError> {
        let dirty = pmap.is_dirty(va);
        pmap.unmap(va);
        if dirty {
            self.write_back(vm, kva)?;
        }
        Ok(())
    }

    fn write_back(&self, vm: &VmSystem, kva: PhysAddress) -> Result<(), VmError> {
        let mut buf = zeroed_page();
        vm.phys().read_page(kva, &mut buf);
        hal::write_all_at(&*self.file, &buf[..self.read_bytes], self.offset)?;
        vm.stats().incr_file_writebacks();
        log::debug!(
            "file: wrote back {} bytes at offset {:#x}",
            self.read_bytes,
            self.offset
        );
        Ok(())
    }
}

// ============================================================================
// mmap / munmap
// ============================================================================

impl AddressSpace {
    /// Map `length` bytes of `file` starting at `offset` to `addr`
    ///
    /// Pages are registered lazily; nothing is read until the first fault.
    /// The mapping uses its own handle on the file, so closing the caller's
    /// handle does not affect it. Returns the mapped address.
    pub fn map_file(
        &self,
        addr: VirtAddress,
        length: u64,
        writable: bool,
        file: &dyn VmFile,
        offset: u64,
    ) -> Result<VirtAddress, MmapError> {
        if addr == 0 {
            return Err(MmapError::NullAddress);
        }
        if length == 0 {
            return Err(MmapError::ZeroLength);
        }
        if !is_page_aligned(addr) {
            return Err(MmapError::Unaligned(addr));
        }
        if !is_page_aligned(offset) {
            return Err(MmapError::UnalignedOffset(offset));
        }
        if !self.config().is_user_range(addr, length) {
            return Err(MmapError::OutsideUserSpace(addr));
        }

        let file_len = file.length();
        if file_len == 0 {
            return Err(MmapError::EmptyFile);
        }
        let handle = file.reopen()?;

        let page_count = length.div_ceil(PAGE_SIZE as u64) as usize;
        let region = MappedRegion {
            start: addr,
            page_count,
            file: handle.clone(),
            offset,
            length,
            writable,
        };

        let mut spt = self.spt.lock();
        if let Some(taken) = region.pages().find(|&va| spt.contains(va)) {
            return Err(MmapError::Overlap(taken));
        }

        for (i, va) in region.pages().enumerate() {
            let chunk_start = (i * PAGE_SIZE) as u64;
            let chunk_len = (length - chunk_start).min(PAGE_SIZE as u64);
            let file_pos = offset + chunk_start;
            let read_bytes = chunk_len.min(file_len.saturating_sub(file_pos)) as usize;
            let lazy = LazyLoad::new(handle.clone(), file_pos, read_bytes);
            spt.insert(Page::uninit(va, writable, PageKind::File, Some(lazy), Some(addr)))?;
        }
        spt.insert_region(region);

        log::debug!(
            "mmap: {:#x}..{:#x} ({} pages, offset {:#x}, {})",
            addr,
            addr + length,
            page_count,
            offset,
            if writable { "rw" } else { "ro" }
        );
        Ok(addr)
    }

    /// Remove the mapping that starts at `addr`
    ///
    /// Dirty resident pages are written back, every page of the run is
    /// dropped and the mapping's file handle is closed. Every page is torn
    /// down even if a write-back fails; the first failure is reported.
    pub fn unmap_file(&self, addr: VirtAddress) -> Result<(), MmapError> {
        let mut spt = self.spt.lock();
        let region = spt.remove_region(addr).ok_or(MmapError::NotMapped(addr))?;

        let mut result = Ok(());
        for va in region.pages() {
            let Some(page) = spt.remove(va) else {
                continue;
            };
            if let Err(err) = page.destroy(self.vm(), self.pmap()) {
                log::warn!("munmap: write-back of {:#x} failed: {}", va, err);
                if result.is_ok() {
                    result = Err(err.into());
                }
            }
        }
        drop(spt);

        log::debug!("munmap: {:#x} ({} pages)", addr, region.page_count);
        drop(region);
        result
    }
}

/// Handle for a region after reopening, keyed by region start
pub(crate) fn reopen_region(region: &MappedRegion) -> Result<MappedRegion, IoError> {
    Ok(MappedRegion {
        start: region.start,
        page_count: region.page_count,
        file: region.file.reopen()?,
        offset: region.offset,
        length: region.length,
        writable: region.writable,
    })
}

/// Re-point a file page at a different handle of the same file
pub(crate) fn rebind(file: &FilePage, handle: &FileRef) -> FilePage {
    FilePage {
        file: Arc::clone(handle),
        offset: file.offset,
        read_bytes: file.read_bytes,
        region: file.region,
    }
}
