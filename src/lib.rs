//! demand_pager - Demand-paged virtual memory for a small teaching kernel
//!
//! This crate provides per-process user address spaces whose pages are
//! backed lazily by physical frames, evicted under memory pressure with a
//! second-chance clock, and persisted either to a swap device (anonymous
//! memory) or back to the file they were mapped from.
//!
//! The rest of the kernel is reached only through the traits in
//! [`vm::hal`]; [`vm::sim`] implements them in memory for host testing.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// Core types
pub mod types;

// Virtual memory subsystem
pub mod vm;

// Kernel entry points into the pager
pub mod copyio;
pub mod process;
pub mod syscall;
pub mod trap;

pub use vm::{init, AddressSpace, VmConfig, VmError, VmSystem};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = "demand_pager";
