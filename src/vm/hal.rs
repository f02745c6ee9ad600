//! Collaborator Interfaces
//!
//! The pager never touches hardware or the file system directly. Everything
//! it needs from the rest of the kernel is reached through the traits in this
//! module:
//!
//! - [`PhysMemory`]: the physical page allocator and kernel access to frames
//! - [`PageTable`]: one hardware page table per address space, with the
//!   accessed/dirty bits the MMU maintains
//! - [`BlockDevice`]: the swap disk, addressed in fixed-size sectors
//! - [`VmFile`]: an open file handle with positional I/O
//!
//! ## Design Notes
//!
//! Hardware mappings are installed only after a frame has been populated, and
//! removed before a frame's contents are read for eviction, so a user access
//! can never observe a half-filled frame or land in a frame that is already
//! being written out.

use alloc::boxed::Box;
use alloc::sync::Arc;
use thiserror::Error;

use super::{PAGE_SIZE, SECTOR_SIZE};
use crate::types::{PhysAddress, VirtAddress};

/// Contents of one page
pub type PageBuf = [u8; PAGE_SIZE];

/// Contents of one disk sector
pub type SectorBuf = [u8; SECTOR_SIZE];

/// Allocate a zeroed page buffer on the heap
pub fn zeroed_page() -> Box<PageBuf> {
    Box::new([0u8; PAGE_SIZE])
}

// ============================================================================
// Errors
// ============================================================================

/// Hardware page table errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PmapError {
    /// Page table not initialized
    #[error("page table not initialized")]
    NotInitialized,
    /// Address not mapped
    #[error("address {0:#x} is not mapped")]
    NotMapped(VirtAddress),
    /// Address already mapped
    #[error("address {0:#x} is already mapped")]
    AlreadyMapped(VirtAddress),
    /// No memory left for page-table pages
    #[error("out of page-table memory")]
    OutOfMemory,
}

/// Block and file I/O errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoError {
    /// Sector index past the end of the device
    #[error("sector {0} is out of range")]
    SectorOutOfRange(u32),
    /// Device reported a failure
    #[error("device error on sector {0}")]
    Device(u32),
    /// Fewer bytes transferred than requested
    #[error("short transfer: expected {expected} bytes, got {actual}")]
    Short { expected: usize, actual: usize },
    /// File handle could not be reopened
    #[error("file could not be reopened")]
    Reopen,
}

/// Why the MMU refused an access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFault {
    /// No valid translation
    NotPresent,
    /// Translation present but it forbids the access
    Protection,
}

// ============================================================================
// Physical Memory
// ============================================================================

/// Physical page allocator and kernel access to frame contents
pub trait PhysMemory: Send + Sync {
    /// Allocate one user-pool page, `None` when the pool is exhausted
    fn alloc_page(&self) -> Option<PhysAddress>;

    /// Return a page to the pool
    fn free_page(&self, pa: PhysAddress);

    /// Copy bytes out of a frame starting at `offset`
    fn read(&self, pa: PhysAddress, offset: usize, buf: &mut [u8]);

    /// Copy bytes into a frame starting at `offset`
    fn write(&self, pa: PhysAddress, offset: usize, buf: &[u8]);

    /// Read a whole frame
    fn read_page(&self, pa: PhysAddress, buf: &mut PageBuf) {
        self.read(pa, 0, buf);
    }

    /// Overwrite a whole frame
    fn write_page(&self, pa: PhysAddress, buf: &PageBuf) {
        self.write(pa, 0, buf);
    }

    /// Zero-fill a frame
    fn zero_page(&self, pa: PhysAddress) {
        self.write_page(pa, &zeroed_page());
    }
}

// ============================================================================
// Hardware Page Table
// ============================================================================

/// A valid hardware translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Frame the page maps to
    pub phys: PhysAddress,
    /// Whether user writes are allowed
    pub writable: bool,
}

/// Per-address-space hardware page table
pub trait PageTable: Send + Sync {
    /// Install a mapping from `va` to `pa`
    fn map(&self, va: VirtAddress, pa: PhysAddress, writable: bool) -> Result<(), PmapError>;

    /// Remove the mapping for `va`, if any
    fn unmap(&self, va: VirtAddress);

    /// Current translation for `va`
    fn translate(&self, va: VirtAddress) -> Option<Translation>;

    /// Hardware accessed bit
    fn is_accessed(&self, va: VirtAddress) -> bool;

    /// Set or clear the accessed bit
    fn set_accessed(&self, va: VirtAddress, accessed: bool);

    /// Hardware dirty bit
    fn is_dirty(&self, va: VirtAddress) -> bool;

    /// Set or clear the dirty bit
    fn set_dirty(&self, va: VirtAddress, dirty: bool);

    /// Perform one access the way the MMU does
    ///
    /// Checks the translation and permissions, sets the accessed bit (and the
    /// dirty bit for writes), then runs `f` on the backing frame. Hardware
    /// models should keep the translation stable while `f` runs; the default
    /// implementation does not.
    fn access(
        &self,
        va: VirtAddress,
        write: bool,
        f: &mut dyn FnMut(PhysAddress),
    ) -> Result<(), AccessFault> {
        let translation = self.translate(va).ok_or(AccessFault::NotPresent)?;
        if write && !translation.writable {
            return Err(AccessFault::Protection);
        }
        self.set_accessed(va, true);
        if write {
            self.set_dirty(va, true);
        }
        f(translation.phys);
        Ok(())
    }
}

// ============================================================================
// Block Device
// ============================================================================

/// Sector-addressed block device backing the swap area
pub trait BlockDevice: Send + Sync {
    /// Number of sectors on the device
    fn sector_count(&self) -> u32;

    /// Read one sector
    fn read_sector(&self, sector: u32, buf: &mut SectorBuf) -> Result<(), IoError>;

    /// Write one sector
    fn write_sector(&self, sector: u32, buf: &SectorBuf) -> Result<(), IoError>;
}

// ============================================================================
// Files
// ============================================================================

/// Shared handle to an open file
///
/// Dropping the last clone of a handle closes it.
pub type FileRef = Arc<dyn VmFile>;

/// Positional file I/O used by file-backed pages and the executable loader
pub trait VmFile: Send + Sync {
    /// Read into `buf` starting at `offset`, returning the bytes read
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Write `buf` starting at `offset`, returning the bytes written
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;

    /// File length in bytes
    fn length(&self) -> u64;

    /// Open an independent handle on the same file
    fn reopen(&self) -> Result<FileRef, IoError>;
}

/// Read exactly `buf.len()` bytes or fail
pub fn read_exact_at(file: &dyn VmFile, buf: &mut [u8], offset: u64) -> Result<(), IoError> {
    let actual = file.read_at(buf, offset);
    if actual != buf.len() {
        return Err(IoError::Short {
            expected: buf.len(),
            actual,
        });
    }
    Ok(())
}

/// Write exactly `buf.len()` bytes or fail
pub fn write_all_at(file: &dyn VmFile, buf: &[u8], offset: u64) -> Result<(), IoError> {
    let actual = file.write_at(buf, offset);
    if actual != buf.len() {
        return Err(IoError::Short {
            expected: buf.len(),
            actual,
        });
    }
    Ok(())
}
