//! Supplemental Page Table
//!
//! Per-address-space map from page address to [`Page`], plus the record of
//! each memory-mapped file region. The hardware table only knows about
//! resident pages; this table knows about every page the process may touch.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::hal::FileRef;
use super::page::{Page, PageInfo};
use super::{trunc_page, VmError, PAGE_SIZE};
use crate::types::VirtAddress;

/// A contiguous run of file-backed pages created by one `mmap`
pub(crate) struct MappedRegion {
    pub start: VirtAddress,
    pub page_count: usize,
    /// Reopened handle shared by every page of the run
    pub file: FileRef,
    pub offset: u64,
    pub length: u64,
    pub writable: bool,
}

impl MappedRegion {
    /// Page addresses covered by the region
    pub fn pages(&self) -> impl Iterator<Item = VirtAddress> {
        let start = self.start;
        (0..self.page_count).map(move |i| start + (i * PAGE_SIZE) as u64)
    }
}

#[derive(Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<VirtAddress, Page>,
    regions: BTreeMap<VirtAddress, MappedRegion>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a page; its address must be free
    pub(crate) fn insert(&mut self, page: Page) -> Result<(), VmError> {
        let va = page.va;
        if self.pages.contains_key(&va) {
            return Err(VmError::AlreadyMapped(va));
        }
        self.pages.insert(va, page);
        Ok(())
    }

    /// Page containing `addr`
    pub fn get(&self, addr: VirtAddress) -> Option<&Page> {
        self.pages.get(&trunc_page(addr))
    }

    pub(crate) fn get_mut(&mut self, addr: VirtAddress) -> Option<&mut Page> {
        self.pages.get_mut(&trunc_page(addr))
    }

    pub fn contains(&self, addr: VirtAddress) -> bool {
        self.pages.contains_key(&trunc_page(addr))
    }

    pub(crate) fn remove(&mut self, addr: VirtAddress) -> Option<Page> {
        self.pages.remove(&trunc_page(addr))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Pages in address order
    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }

    pub fn infos(&self) -> Vec<PageInfo> {
        self.pages.values().map(Page::info).collect()
    }

    pub fn resident_count(&self) -> usize {
        self.pages.values().filter(|page| page.is_resident()).count()
    }

    pub(crate) fn insert_region(&mut self, region: MappedRegion) {
        self.regions.insert(region.start, region);
    }

    pub(crate) fn remove_region(&mut self, start: VirtAddress) -> Option<MappedRegion> {
        self.regions.remove(&start)
    }

    pub(crate) fn regions(&self) -> impl Iterator<Item = &MappedRegion> {
        self.regions.values()
    }

    /// Empty the table, handing back every page and region
    pub(crate) fn drain(&mut self) -> (Vec<Page>, Vec<MappedRegion>) {
        let pages = core::mem::take(&mut self.pages).into_values().collect();
        let regions = core::mem::take(&mut self.regions).into_values().collect();
        (pages, regions)
    }
}
