//! Swap Area - Slot Allocator
//!
//! The swap device is divided into page-sized slots of
//! [`SECTORS_PER_PAGE`] consecutive sectors. Slot `n` occupies sectors
//! `n * SECTORS_PER_PAGE .. (n + 1) * SECTORS_PER_PAGE`.
//!
//! Occupancy is kept in a bitmap (1 = in use), 64 slots per word, scanned
//! first-fit so allocation order is deterministic.

use alloc::vec;
use alloc::vec::Vec;
use alloc::sync::Arc;
use spin::Mutex;

use super::hal::{BlockDevice, IoError, PageBuf, SectorBuf};
use super::{VmError, SECTORS_PER_PAGE, SECTOR_SIZE};

const BITS_PER_WORD: usize = 64;

/// Index of a page-sized slot on the swap device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub u32);

impl SwapSlot {
    /// First sector of this slot
    pub fn first_sector(self) -> u32 {
        self.0 * SECTORS_PER_PAGE as u32
    }
}

/// Swap slot table
pub struct SwapTable {
    device: Arc<dyn BlockDevice>,
    capacity: usize,
    bitmap: Mutex<Vec<u64>>,
}

impl SwapTable {
    /// Build a table covering the whole device, all slots free
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let capacity = device.sector_count() as usize / SECTORS_PER_PAGE;
        let words = capacity.div_ceil(BITS_PER_WORD);
        Self {
            device,
            capacity,
            bitmap: Mutex::new(vec![0u64; words]),
        }
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim the lowest free slot
    pub fn alloc(&self) -> Option<SwapSlot> {
        let mut bitmap = self.bitmap.lock();
        for (idx, word) in bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let slot = idx * BITS_PER_WORD + bit;
            if slot >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            return Some(SwapSlot(slot as u32));
        }
        None
    }

    /// Return a slot to the free pool
    pub fn free(&self, slot: SwapSlot) {
        let (idx, bit) = Self::locate(slot);
        let mut bitmap = self.bitmap.lock();
        if let Some(word) = bitmap.get_mut(idx) {
            if *word & (1 << bit) == 0 {
                log::warn!("swap: double free of slot {}", slot.0);
            }
            *word &= !(1 << bit);
        }
    }

    /// Check whether a slot is allocated
    pub fn is_used(&self, slot: SwapSlot) -> bool {
        let (idx, bit) = Self::locate(slot);
        self.bitmap
            .lock()
            .get(idx)
            .is_some_and(|word| word & (1 << bit) != 0)
    }

    /// Number of allocated slots
    pub fn used_slots(&self) -> usize {
        self.bitmap
            .lock()
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum()
    }

    /// Write a page into a slot
    pub fn write_slot(&self, slot: SwapSlot, page: &PageBuf) -> Result<(), IoError> {
        let base = slot.first_sector();
        for (i, chunk) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            let mut sector: SectorBuf = [0; SECTOR_SIZE];
            sector.copy_from_slice(chunk);
            self.device.write_sector(base + i as u32, &sector)?;
        }
        Ok(())
    }

    /// Read a page out of a slot
    pub fn read_slot(&self, slot: SwapSlot, page: &mut PageBuf) -> Result<(), IoError> {
        let base = slot.first_sector();
        for (i, chunk) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let mut sector: SectorBuf = [0; SECTOR_SIZE];
            self.device.read_sector(base + i as u32, &mut sector)?;
            chunk.copy_from_slice(&sector);
        }
        Ok(())
    }

    /// Allocate a slot and write `page` into it
    ///
    /// The slot is released again if the write fails.
    pub fn store(&self, page: &PageBuf) -> Result<SwapSlot, VmError> {
        let slot = self.alloc().ok_or(VmError::SwapExhausted)?;
        if let Err(err) = self.write_slot(slot, page) {
            self.free(slot);
            return Err(err.into());
        }
        Ok(slot)
    }

    fn locate(slot: SwapSlot) -> (usize, usize) {
        let n = slot.0 as usize;
        (n / BITS_PER_WORD, n % BITS_PER_WORD)
    }
}
