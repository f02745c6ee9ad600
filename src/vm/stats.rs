//! VM Statistics
//!
//! Lock-free counters bumped by the fault path, the clock and the swap
//! allocator. Readers take a [`VmStatsSnapshot`].

use core::sync::atomic::{AtomicU64, Ordering};

/// VM event counters
pub struct VmStats {
    /// Page faults handled
    pub faults: AtomicU64,
    /// Faults that ended in an error
    pub fault_failures: AtomicU64,
    /// Pages created by stack growth
    pub stack_growths: AtomicU64,
    /// Pages brought into a frame
    pub claims: AtomicU64,
    /// Frames filled with zeros
    pub zero_fills: AtomicU64,
    /// Frames filled from swap
    pub swap_ins: AtomicU64,
    /// Pages written to swap
    pub swap_outs: AtomicU64,
    /// Frames filled from a file
    pub file_reads: AtomicU64,
    /// Dirty file pages written back
    pub file_writebacks: AtomicU64,
    /// Frames reclaimed by the clock
    pub evictions: AtomicU64,
    /// Frames given a second chance
    pub second_chances: AtomicU64,
    /// Frames skipped because they were pinned or their owner was busy
    pub skipped: AtomicU64,
}

impl VmStats {
    pub const fn new() -> Self {
        Self {
            faults: AtomicU64::new(0),
            fault_failures: AtomicU64::new(0),
            stack_growths: AtomicU64::new(0),
            claims: AtomicU64::new(0),
            zero_fills: AtomicU64::new(0),
            swap_ins: AtomicU64::new(0),
            swap_outs: AtomicU64::new(0),
            file_reads: AtomicU64::new(0),
            file_writebacks: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            second_chances: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn incr_faults(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_fault_failures(&self) {
        self.fault_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_stack_growths(&self) {
        self.stack_growths.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_claims(&self) {
        self.claims.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_zero_fills(&self) {
        self.zero_fills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_swap_ins(&self) {
        self.swap_ins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_swap_outs(&self) {
        self.swap_outs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_file_reads(&self) {
        self.file_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_file_writebacks(&self) {
        self.file_writebacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_evictions(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_second_chances(&self) {
        self.second_chances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter
    pub fn snapshot(&self) -> VmStatsSnapshot {
        VmStatsSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            fault_failures: self.fault_failures.load(Ordering::Relaxed),
            stack_growths: self.stack_growths.load(Ordering::Relaxed),
            claims: self.claims.load(Ordering::Relaxed),
            zero_fills: self.zero_fills.load(Ordering::Relaxed),
            swap_ins: self.swap_ins.load(Ordering::Relaxed),
            swap_outs: self.swap_outs.load(Ordering::Relaxed),
            file_reads: self.file_reads.load(Ordering::Relaxed),
            file_writebacks: self.file_writebacks.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            second_chances: self.second_chances.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

impl Default for VmStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`VmStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStatsSnapshot {
    pub faults: u64,
    pub fault_failures: u64,
    pub stack_growths: u64,
    pub claims: u64,
    pub zero_fills: u64,
    pub swap_ins: u64,
    pub swap_outs: u64,
    pub file_reads: u64,
    pub file_writebacks: u64,
    pub evictions: u64,
    pub second_chances: u64,
    pub skipped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = VmStats::new();
        stats.incr_faults();
        stats.incr_faults();
        stats.incr_evictions();
        let snap = stats.snapshot();
        assert_eq!(snap.faults, 2);
        assert_eq!(snap.evictions, 1);
        assert_eq!(snap.swap_outs, 0);
    }
}
