//! Common types used across the pager
//!
//! This module defines shared types to avoid circular dependencies.

use core::sync::atomic::{AtomicU64, Ordering};

/// User virtual address
pub type VirtAddress = u64;

/// Physical (kernel-visible) address of a frame
pub type PhysAddress = u64;

/// Address space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SpaceId(pub u64);

impl SpaceId {
    /// Create a new space ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SpaceId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(pub u64);

impl Pid {
    /// Create a new process ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Pid(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}
