//! In-Memory Machine Model
//!
//! Host-side implementations of the collaborator traits: a physical page
//! pool, a page table with accessed/dirty bits, a sector disk and shared
//! byte-vector files. Used by the test suite and handy for bring-up before a
//! real MMU backend exists.

use alloc::collections::BTreeMap;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use super::hal::{
    AccessFault, BlockDevice, FileRef, IoError, PageTable, PhysMemory, PmapError, SectorBuf,
    Translation, VmFile,
};
use super::{PAGE_SIZE, SECTOR_SIZE};
use crate::types::{PhysAddress, VirtAddress};

/// Physical address of the first simulated frame
const SIM_PHYS_BASE: PhysAddress = 0x10_0000;

// ============================================================================
// Physical Memory
// ============================================================================

struct PhysPool {
    memory: Vec<u8>,
    free: BTreeSet<usize>,
}

/// Fixed pool of page frames, allocated lowest first
pub struct SimPhysMemory {
    pool: Mutex<PhysPool>,
    frames: usize,
}

impl SimPhysMemory {
    pub fn new(frames: usize) -> Self {
        Self {
            pool: Mutex::new(PhysPool {
                memory: vec![0; frames * PAGE_SIZE],
                free: (0..frames).collect(),
            }),
            frames,
        }
    }

    /// Total frames in the pool
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Frames not currently allocated
    pub fn free_count(&self) -> usize {
        self.pool.lock().free.len()
    }

    fn index(pa: PhysAddress) -> usize {
        ((pa - SIM_PHYS_BASE) as usize) / PAGE_SIZE
    }

    fn range(pa: PhysAddress, offset: usize, len: usize) -> core::ops::Range<usize> {
        let start = Self::index(pa) * PAGE_SIZE + offset;
        start..start + len
    }
}

impl PhysMemory for SimPhysMemory {
    fn alloc_page(&self) -> Option<PhysAddress> {
        let mut pool = self.pool.lock();
        let index = pool.free.pop_first()?;
        Some(SIM_PHYS_BASE + (index * PAGE_SIZE) as u64)
    }

    fn free_page(&self, pa: PhysAddress) {
        let mut pool = self.pool.lock();
        if !pool.free.insert(Self::index(pa)) {
            log::warn!("sim: double free of frame {:#x}", pa);
        }
    }

    fn read(&self, pa: PhysAddress, offset: usize, buf: &mut [u8]) {
        let pool = self.pool.lock();
        buf.copy_from_slice(&pool.memory[Self::range(pa, offset, buf.len())]);
    }

    fn write(&self, pa: PhysAddress, offset: usize, buf: &[u8]) {
        let mut pool = self.pool.lock();
        pool.memory[Self::range(pa, offset, buf.len())].copy_from_slice(buf);
    }
}

// ============================================================================
// Page Table
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Pte {
    phys: PhysAddress,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// Single-level page table keyed by page address
#[derive(Default)]
pub struct SimPageTable {
    entries: Mutex<BTreeMap<VirtAddress, Pte>>,
}

impl SimPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of valid translations
    pub fn mapped_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl PageTable for SimPageTable {
    fn map(&self, va: VirtAddress, pa: PhysAddress, writable: bool) -> Result<(), PmapError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&va) {
            return Err(PmapError::AlreadyMapped(va));
        }
        entries.insert(
            va,
            Pte {
                phys: pa,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        Ok(())
    }

    fn unmap(&self, va: VirtAddress) {
        self.entries.lock().remove(&va);
    }

    fn translate(&self, va: VirtAddress) -> Option<Translation> {
        self.entries.lock().get(&va).map(|pte| Translation {
            phys: pte.phys,
            writable: pte.writable,
        })
    }

    fn is_accessed(&self, va: VirtAddress) -> bool {
        self.entries.lock().get(&va).is_some_and(|pte| pte.accessed)
    }

    fn set_accessed(&self, va: VirtAddress, accessed: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&va) {
            pte.accessed = accessed;
        }
    }

    fn is_dirty(&self, va: VirtAddress) -> bool {
        self.entries.lock().get(&va).is_some_and(|pte| pte.dirty)
    }

    fn set_dirty(&self, va: VirtAddress, dirty: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&va) {
            pte.dirty = dirty;
        }
    }

    /// Holds the table lock for the whole access, so an eviction cannot
    /// unmap the page halfway through.
    fn access(
        &self,
        va: VirtAddress,
        write: bool,
        f: &mut dyn FnMut(PhysAddress),
    ) -> Result<(), AccessFault> {
        let mut entries = self.entries.lock();
        let pte = entries.get_mut(&va).ok_or(AccessFault::NotPresent)?;
        if write && !pte.writable {
            return Err(AccessFault::Protection);
        }
        pte.accessed = true;
        if write {
            pte.dirty = true;
        }
        f(pte.phys);
        Ok(())
    }
}

// ============================================================================
// Disk
// ============================================================================

/// Sector-addressed RAM disk with optional failure injection
pub struct SimDisk {
    data: Mutex<Vec<u8>>,
    sectors: usize,
    failing: Mutex<BTreeSet<u32>>,
}

impl SimDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; sectors * SECTOR_SIZE]),
            sectors,
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    /// Make every later access to `sector` fail
    pub fn fail_sector(&self, sector: u32) {
        self.failing.lock().insert(sector);
    }

    fn check(&self, sector: u32) -> Result<core::ops::Range<usize>, IoError> {
        if sector as usize >= self.sectors {
            return Err(IoError::SectorOutOfRange(sector));
        }
        if self.failing.lock().contains(&sector) {
            return Err(IoError::Device(sector));
        }
        let start = sector as usize * SECTOR_SIZE;
        Ok(start..start + SECTOR_SIZE)
    }
}

impl BlockDevice for SimDisk {
    fn sector_count(&self) -> u32 {
        self.sectors as u32
    }

    fn read_sector(&self, sector: u32, buf: &mut SectorBuf) -> Result<(), IoError> {
        let range = self.check(sector)?;
        buf.copy_from_slice(&self.data.lock()[range]);
        Ok(())
    }

    fn write_sector(&self, sector: u32, buf: &SectorBuf) -> Result<(), IoError> {
        let range = self.check(sector)?;
        self.data.lock()[range].copy_from_slice(buf);
        Ok(())
    }
}

// ============================================================================
// Files
// ============================================================================

struct Inode {
    data: Mutex<Vec<u8>>,
    open: AtomicUsize,
}

/// An open handle on a shared in-memory file
///
/// Every handle on the same file sees the same bytes. Writes never extend
/// the file. Dropping a handle closes it.
pub struct SimFile {
    inode: Arc<Inode>,
}

impl SimFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            inode: Arc::new(Inode {
                data: Mutex::new(data),
                open: AtomicUsize::new(1),
            }),
        }
    }

    /// Current file contents
    pub fn contents(&self) -> Vec<u8> {
        self.inode.data.lock().clone()
    }

    /// Handles open on this file, this one included
    pub fn open_handles(&self) -> usize {
        self.inode.open.load(Ordering::SeqCst)
    }
}

impl VmFile for SimFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.inode.data.lock();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        let mut data = self.inode.data.lock();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        n
    }

    fn length(&self) -> u64 {
        self.inode.data.lock().len() as u64
    }

    fn reopen(&self) -> Result<FileRef, IoError> {
        self.inode.open.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimFile {
            inode: Arc::clone(&self.inode),
        }))
    }
}

impl Drop for SimFile {
    fn drop(&mut self) {
        self.inode.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phys_lowest_first() {
        let phys = SimPhysMemory::new(3);
        let a = phys.alloc_page().unwrap();
        let b = phys.alloc_page().unwrap();
        assert_eq!(b, a + PAGE_SIZE as u64);
        phys.free_page(a);
        assert_eq!(phys.alloc_page(), Some(a));
        assert_eq!(phys.free_count(), 1);
    }

    #[test]
    fn test_access_sets_bits() {
        let pmap = SimPageTable::new();
        pmap.map(0x1000, SIM_PHYS_BASE, false).unwrap();
        let mut seen = 0;
        pmap.access(0x1000, false, &mut |pa| seen = pa).unwrap();
        assert_eq!(seen, SIM_PHYS_BASE);
        assert!(pmap.is_accessed(0x1000));
        assert!(!pmap.is_dirty(0x1000));
        assert_eq!(
            pmap.access(0x1000, true, &mut |_| {}),
            Err(AccessFault::Protection)
        );
        assert_eq!(
            pmap.access(0x2000, false, &mut |_| {}),
            Err(AccessFault::NotPresent)
        );
    }

    #[test]
    fn test_file_handles_share_inode() {
        let file = SimFile::new(b"hello".to_vec());
        let other = file.reopen().unwrap();
        assert_eq!(file.open_handles(), 2);
        assert_eq!(other.write_at(b"J", 0), 1);
        assert_eq!(other.write_at(b"!!", 4), 1);
        assert_eq!(file.contents(), b"Jell!".to_vec());
        drop(other);
        assert_eq!(file.open_handles(), 1);
    }

    #[test]
    fn test_disk_bounds_and_failures() {
        let disk = SimDisk::new(2);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(disk.read_sector(2, &mut buf), Err(IoError::SectorOutOfRange(2)));
        disk.fail_sector(1);
        assert_eq!(disk.write_sector(1, &buf), Err(IoError::Device(1)));
        assert!(disk.write_sector(0, &[5; SECTOR_SIZE]).is_ok());
        disk.read_sector(0, &mut buf).unwrap();
        assert_eq!(buf[0], 5);
    }
}
