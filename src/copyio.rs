//! Copyin/Copyout - Kernel Access to User Memory
//!
//! System calls read and write user buffers through the process's hardware
//! page table, exactly as the MMU would: every access sets the accessed bit,
//! writes set the dirty bit, and a missing page goes through the normal
//! fault path (including stack growth) before the access is retried.
//!
//! Transfers are split at page boundaries; each page is accessed while its
//! translation is held stable by the page table.

use crate::trap::TrapFrame;
use crate::types::VirtAddress;
use crate::vm::hal::AccessFault;
use crate::vm::{page_offset, trunc_page, AddressSpace, FaultError, PageFault, PAGE_SIZE};
use thiserror::Error;

/// Maximum size for a single copy operation
pub const COPYIO_MAX_SIZE: usize = 64 * 1024;

/// Errors that can occur during copy operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CopyError {
    /// Null, kernel or wrapping user address
    #[error("bad user address {0:#x}")]
    BadAddress(VirtAddress),
    /// Transfer larger than [`COPYIO_MAX_SIZE`]
    #[error("copy of {0} bytes is too large")]
    TooLarge(usize),
    /// The page could not be brought in
    #[error("fault: {0}")]
    Fault(#[from] FaultError),
}

fn validate(space: &AddressSpace, addr: VirtAddress, len: usize) -> Result<(), CopyError> {
    if len > COPYIO_MAX_SIZE {
        return Err(CopyError::TooLarge(len));
    }
    if addr == 0 || !space.config().is_user_range(addr, len as u64) {
        return Err(CopyError::BadAddress(addr));
    }
    Ok(())
}

/// Run `f` on the frame behind `addr`, faulting the page in as needed
///
/// Retries for as long as each fault is resolved; a page evicted again
/// before the access lands is simply faulted in once more.
fn with_page(
    space: &AddressSpace,
    frame: &TrapFrame,
    addr: VirtAddress,
    write: bool,
    f: &mut dyn FnMut(u64),
) -> Result<(), CopyError> {
    let va = trunc_page(addr);
    loop {
        let not_present = match space.pmap().access(va, write, f) {
            Ok(()) => return Ok(()),
            Err(AccessFault::NotPresent) => true,
            Err(AccessFault::Protection) => false,
        };
        let fault = PageFault::new(addr, false, write, not_present);
        space.resolve_fault(&fault, frame)?;
    }
}

/// Copy `dst.len()` bytes from user address `src`
pub fn copy_in(
    space: &AddressSpace,
    frame: &TrapFrame,
    src: VirtAddress,
    dst: &mut [u8],
) -> Result<usize, CopyError> {
    validate(space, src, dst.len())?;
    let phys = space.vm().phys();
    let mut done = 0;
    while done < dst.len() {
        let addr = src + done as u64;
        let offset = page_offset(addr);
        let len = (dst.len() - done).min(PAGE_SIZE - offset);
        let chunk = &mut dst[done..done + len];
        with_page(space, frame, addr, false, &mut |pa| phys.read(pa, offset, chunk))?;
        done += len;
    }
    Ok(done)
}

/// Copy `src` to user address `dst`
pub fn copy_out(
    space: &AddressSpace,
    frame: &TrapFrame,
    src: &[u8],
    dst: VirtAddress,
) -> Result<usize, CopyError> {
    validate(space, dst, src.len())?;
    let phys = space.vm().phys();
    let mut done = 0;
    while done < src.len() {
        let addr = dst + done as u64;
        let offset = page_offset(addr);
        let len = (src.len() - done).min(PAGE_SIZE - offset);
        let chunk = &src[done..done + len];
        with_page(space, frame, addr, true, &mut |pa| phys.write(pa, offset, chunk))?;
        done += len;
    }
    Ok(done)
}

/// Read one `u64` from user memory
pub fn fuword64(space: &AddressSpace, frame: &TrapFrame, addr: VirtAddress) -> Result<u64, CopyError> {
    let mut bytes = [0u8; 8];
    copy_in(space, frame, addr, &mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Write one `u64` to user memory
pub fn suword64(
    space: &AddressSpace,
    frame: &TrapFrame,
    addr: VirtAddress,
    value: u64,
) -> Result<(), CopyError> {
    copy_out(space, frame, &value.to_le_bytes(), addr)?;
    Ok(())
}
