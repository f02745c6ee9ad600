//! Memory-mapping system calls
//!
//! Argument checking and result encoding for `mmap`/`munmap`. The dispatcher
//! resolves the file descriptor and passes the open file, or `None` when the
//! descriptor is invalid or names a console stream.

use crate::types::VirtAddress;
use crate::vm::{AddressSpace, MmapError, VmFile};

/// Value returned by `mmap` on failure
pub const MAP_FAILED: u64 = 0;

/// `mmap(addr, length, writable, fd, offset)`
///
/// Returns the mapped address, or [`MAP_FAILED`].
pub fn sys_mmap(
    space: &AddressSpace,
    addr: VirtAddress,
    length: u64,
    writable: bool,
    file: Option<&dyn VmFile>,
    offset: i64,
) -> u64 {
    let result = match (file, u64::try_from(offset)) {
        (Some(file), Ok(offset)) => space.map_file(addr, length, writable, file, offset),
        (None, _) => {
            log::debug!("mmap: bad file descriptor");
            return MAP_FAILED;
        }
        (_, Err(_)) => Err(MmapError::UnalignedOffset(offset as u64)),
    };
    match result {
        Ok(mapped) => mapped,
        Err(err) => {
            log::debug!("mmap: {:#x} refused: {}", addr, err);
            MAP_FAILED
        }
    }
}

/// `munmap(addr)`
///
/// Unknown addresses are ignored.
pub fn sys_munmap(space: &AddressSpace, addr: VirtAddress) {
    if let Err(err) = space.unmap_file(addr) {
        log::debug!("munmap: {:#x}: {}", addr, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::sim::{SimDisk, SimFile, SimPageTable, SimPhysMemory};
    use crate::vm::{VmConfig, VmSystem, PAGE_SIZE, SECTORS_PER_PAGE};
    use alloc::sync::Arc;
    use alloc::vec;

    fn space() -> Arc<AddressSpace> {
        let vm = VmSystem::new(
            VmConfig::default(),
            Arc::new(SimPhysMemory::new(2)),
            Arc::new(SimDisk::new(2 * SECTORS_PER_PAGE)),
        );
        AddressSpace::new(vm, Arc::new(SimPageTable::new()))
    }

    #[test]
    fn test_mmap_results() {
        let space = space();
        let file = SimFile::new(vec![3u8; PAGE_SIZE]);
        assert_eq!(sys_mmap(&space, 0x10000, 100, true, Some(&file), 0), 0x10000);
        assert_eq!(sys_mmap(&space, 0x10000, 100, true, Some(&file), 0), MAP_FAILED);
        assert_eq!(sys_mmap(&space, 0x20000, 100, true, None, 0), MAP_FAILED);
        assert_eq!(sys_mmap(&space, 0x20000, 100, true, Some(&file), -4096), MAP_FAILED);
        sys_munmap(&space, 0x10000);
        sys_munmap(&space, 0x10000);
        assert_eq!(file.open_handles(), 1);
    }
}
