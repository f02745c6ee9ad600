//! Anonymous Pages
//!
//! Memory with no file behind it. A page that has never been evicted is
//! zero-filled on first touch; an evicted page lives in exactly one swap slot
//! until it is read back, at which point the slot is freed.

use alloc::boxed::Box;

use super::hal::{zeroed_page, PageBuf, PageTable};
use super::swap::SwapSlot;
use super::{VmError, VmSystem};
use crate::types::{PhysAddress, VirtAddress};

/// Swap state of an anonymous page
pub(crate) struct AnonPage {
    /// Slot holding the contents while evicted
    pub slot: Option<SwapSlot>,
}

impl AnonPage {
    pub fn new() -> Self {
        Self { slot: None }
    }

    /// Zero-fill a fresh frame
    pub fn zero(vm: &VmSystem, kva: PhysAddress) {
        vm.phys().zero_page(kva);
        vm.stats().incr_zero_fills();
    }

    /// Fill a frame from the swap slot, or with zeros if there is none
    ///
    /// The slot stays allocated until [`AnonPage::commit`].
    pub fn fill(&self, vm: &VmSystem, kva: PhysAddress) -> Result<(), VmError> {
        let Some(slot) = self.slot else {
            Self::zero(vm, kva);
            return Ok(());
        };
        let mut buf = zeroed_page();
        vm.swap().read_slot(slot, &mut buf)?;
        vm.phys().write_page(kva, &buf);
        Ok(())
    }

    /// Free the slot whose contents are now mapped
    pub fn commit(&mut self, vm: &VmSystem) {
        if let Some(slot) = self.slot.take() {
            vm.swap().free(slot);
            vm.stats().incr_swap_ins();
            log::debug!("anon: swapped in slot {}", slot.0);
        }
    }

    /// Write the frame to a fresh slot
    ///
    /// The mapping is removed before the frame is read so later user writes
    /// fault instead of being lost. If no slot can be written the mapping is
    /// restored.
    pub fn swap_out(
        &mut self,
        vm: &VmSystem,
        pmap: &dyn PageTable,
        va: VirtAddress,
        writable: bool,
        kva: PhysAddress,
    ) -> Result<(), VmError> {
        pmap.unmap(va);
        let mut buf = zeroed_page();
        vm.phys().read_page(kva, &mut buf);
        match vm.swap().store(&buf) {
            Ok(slot) => {
                self.slot = Some(slot);
                vm.stats().incr_swap_outs();
                log::debug!("anon: swapped out {:#x} to slot {}", va, slot.0);
                Ok(())
            }
            Err(err) => {
                if err == VmError::SwapExhausted {
                    log::error!("anon: swap exhausted evicting {:#x}", va);
                }
                pmap.map(va, kva, writable)?;
                pmap.set_dirty(va, true);
                Err(err)
            }
        }
    }

    /// Copy of the page as last swapped out, leaving the slot in place
    pub fn read_swapped(&self, vm: &VmSystem) -> Result<Option<Box<PageBuf>>, VmError> {
        let Some(slot) = self.slot else {
            return Ok(None);
        };
        let mut buf = zeroed_page();
        vm.swap().read_slot(slot, &mut buf)?;
        Ok(Some(buf))
    }

    pub fn destroy(&mut self, vm: &VmSystem) {
        if let Some(slot) = self.slot.take() {
            vm.swap().free(slot);
        }
    }
}
