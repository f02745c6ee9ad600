//! Demand-Paged Virtual Memory Subsystem
//!
//! Gives each process a private user address space whose pages are backed by
//! physical frames allocated on first touch:
//! - swap: slot allocator over the swap block device
//! - frame: global frame table and second-chance (clock) eviction
//! - page / spt: per-address-space supplemental page table
//! - anon / file: the two backing strategies (swap-backed and mmap)
//! - fault: page-fault resolution and stack growth
//! - space: the address space tying the pieces together
//!
//! All shared state hangs off a [`VmSystem`] built once at kernel startup and
//! handed to every address space by `Arc`.

pub mod anon;
pub mod fault;
pub mod file;
pub mod frame;
pub mod hal;
pub mod page;
pub mod sim;
pub mod space;
pub mod spt;
pub mod stats;
pub mod swap;

use alloc::sync::Arc;
use thiserror::Error;

pub use fault::{FaultError, PageFault};
pub use file::MmapError;
pub use frame::{Frame, FrameId, FrameSnapshot, FrameTable};
pub use hal::{
    BlockDevice, FileRef, IoError, PageBuf, PageTable, PhysMemory, PmapError, Translation,
    VmFile,
};
pub use page::{LazyLoad, Page, PageInfo, PageKind};
pub use space::AddressSpace;
pub use spt::SupplementalPageTable;
pub use stats::{VmStats, VmStatsSnapshot};
pub use swap::{SwapSlot, SwapTable};

use crate::types::{PhysAddress, VirtAddress};

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Disk sector size
pub const SECTOR_SIZE: usize = 512;

/// Sectors making up one swap slot
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Top of the user stack (exclusive)
pub const USER_STACK: VirtAddress = 0x4748_0000;

/// First kernel address; everything below is user space
pub const KERN_BASE: VirtAddress = 0x80_0400_0000;

/// Maximum size the user stack may grow to
pub const STACK_LIMIT: u64 = 1 << 20;

/// Distance below the stack pointer still treated as a stack access
/// (`push` faults before updating the stack pointer)
pub const STACK_SLACK: u64 = 8;

/// Round address down to page boundary
pub const fn trunc_page(addr: VirtAddress) -> VirtAddress {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round address up to page boundary
pub const fn round_page(addr: VirtAddress) -> VirtAddress {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Offset of an address within its page
pub const fn page_offset(addr: VirtAddress) -> usize {
    (addr & (PAGE_SIZE as u64 - 1)) as usize
}

/// Check page alignment
pub const fn is_page_aligned(addr: VirtAddress) -> bool {
    page_offset(addr) == 0
}

// ============================================================================
// Configuration
// ============================================================================

/// Address-space layout used by the pager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Top of the user stack
    pub user_stack: VirtAddress,
    /// Start of the kernel's reserved range
    pub kern_base: VirtAddress,
    /// Maximum stack size
    pub stack_limit: u64,
}

impl VmConfig {
    /// Set the top of the user stack
    pub fn with_user_stack(mut self, user_stack: VirtAddress) -> Self {
        self.user_stack = user_stack;
        self
    }

    /// Set the start of the kernel range
    pub fn with_kern_base(mut self, kern_base: VirtAddress) -> Self {
        self.kern_base = kern_base;
        self
    }

    /// Set the maximum stack size
    pub fn with_stack_limit(mut self, stack_limit: u64) -> Self {
        self.stack_limit = stack_limit;
        self
    }

    /// Check if an address lies in user space
    pub fn is_user_vaddr(&self, addr: VirtAddress) -> bool {
        addr < self.kern_base
    }

    /// Check if `[addr, addr + len)` lies entirely in user space
    pub fn is_user_range(&self, addr: VirtAddress, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => end <= self.kern_base,
            None => false,
        }
    }

    /// Lowest address the stack may grow down to
    pub fn stack_floor(&self) -> VirtAddress {
        self.user_stack.saturating_sub(self.stack_limit)
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_stack: USER_STACK,
            kern_base: KERN_BASE,
            stack_limit: STACK_LIMIT,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// VM subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// A page is already registered at this address
    #[error("page {0:#x} is already mapped")]
    AlreadyMapped(VirtAddress),
    /// No page registered at this address
    #[error("no page at {0:#x}")]
    NotMapped(VirtAddress),
    /// Address is not page aligned
    #[error("address {0:#x} is not page aligned")]
    Unaligned(VirtAddress),
    /// Address lies outside user space
    #[error("address {0:#x} is outside user space")]
    KernelAddress(VirtAddress),
    /// Page cannot be created with the requested backing
    #[error("invalid backing for page {0:#x}")]
    InvalidBacking(VirtAddress),
    /// Eviction needed a swap slot and the device is full
    #[error("swap device is full")]
    SwapExhausted,
    /// The physical pool is empty and no frame is resident to evict
    #[error("no evictable frame")]
    NoEvictableFrame,
    /// Hardware page table failure
    #[error("page table: {0}")]
    Pmap(#[from] PmapError),
    /// Disk or file I/O failure
    #[error("i/o: {0}")]
    Io(#[from] IoError),
}

impl VmError {
    /// Errors with no process-level recovery
    pub fn is_kernel_fatal(&self) -> bool {
        matches!(self, VmError::SwapExhausted | VmError::NoEvictableFrame)
    }
}

// ============================================================================
// VM System
// ============================================================================

/// Shared VM state: physical pool, frame table, swap area and counters
pub struct VmSystem {
    config: VmConfig,
    phys: Arc<dyn PhysMemory>,
    frames: FrameTable,
    swap: SwapTable,
    stats: VmStats,
}

impl VmSystem {
    /// Build the VM subsystem over a physical pool and a swap device
    pub fn new(
        config: VmConfig,
        phys: Arc<dyn PhysMemory>,
        swap_device: Arc<dyn BlockDevice>,
    ) -> Arc<Self> {
        let swap = SwapTable::new(swap_device);
        log::debug!(
            "vm: init, stack top {:#x}, kernel base {:#x}, {} swap slots",
            config.user_stack,
            config.kern_base,
            swap.capacity()
        );
        Arc::new(Self {
            config,
            phys,
            frames: FrameTable::new(),
            swap,
            stats: VmStats::new(),
        })
    }

    /// Layout configuration
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Physical memory
    pub fn phys(&self) -> &dyn PhysMemory {
        &*self.phys
    }

    /// Frame table
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// Swap table
    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// Counters
    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    /// Obtain a pinned, ownerless frame, evicting if the pool is empty
    pub fn acquire_frame(&self) -> Result<Frame, VmError> {
        self.frames.acquire(self)
    }

    /// Unmap, free and forget a frame
    pub fn release_frame(&self, id: FrameId) {
        self.frames.release(self, id);
    }

    /// Physical address behind a frame handle
    pub fn frame_address(&self, id: FrameId) -> Option<PhysAddress> {
        self.frames.kva(id)
    }
}

/// Initialize the VM subsystem
///
/// Counterpart of the kernel's `vm_init`: called once at boot with the user
/// pool and the swap disk; the returned handle is passed to every address
/// space and dropped at shutdown.
pub fn init(
    config: VmConfig,
    phys: Arc<dyn PhysMemory>,
    swap_device: Arc<dyn BlockDevice>,
) -> Arc<VmSystem> {
    VmSystem::new(config, phys, swap_device)
}
