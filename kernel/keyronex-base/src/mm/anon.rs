//! Anonymous pages.
//!
//! An [`Anon`] is a single refcounted anonymous (non-file-backed) page. It
//! is shared copy-on-write between an [`super::amap::Amap`] and every fork
//! child that still points at the same physical page; the first writer to
//! see a refcount above one copies it.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::paging::{PhysFrame, Size4KiB};
use crate::sync::SpinLock;

/// A single anonymous page, possibly resident or swapped out.
pub struct Anon {
    state: SpinLock<AnonState>,
    dirty: AtomicBool,
}

enum AnonState {
    /// Backed by a physical page.
    Resident(PhysFrame<Size4KiB>),
    /// Written out to backing store at the given swap slot.
    Swapped(u64),
}

impl Anon {
    /// Wraps a freshly allocated, resident page.
    #[must_use]
    pub fn new_resident(frame: PhysFrame<Size4KiB>) -> Arc<Self> {
        Arc::new(Self {
            state: SpinLock::new(AnonState::Resident(frame)),
            dirty: AtomicBool::new(false),
        })
    }

    /// Returns the backing frame if resident.
    #[must_use]
    pub fn resident_frame(&self) -> Option<PhysFrame<Size4KiB>> {
        match *self.state.lock() {
            AnonState::Resident(f) => Some(f),
            AnonState::Swapped(_) => None,
        }
    }

    /// Returns `true` if the page has been written out to swap.
    #[must_use]
    pub fn is_swapped(&self) -> bool {
        matches!(*self.state.lock(), AnonState::Swapped(_))
    }

    /// Returns the swap slot this page was written to, if currently
    /// swapped -- the id a swap-in IOP reads back.
    #[must_use]
    pub fn swap_slot(&self) -> Option<u64> {
        match *self.state.lock() {
            AnonState::Swapped(slot) => Some(slot),
            AnonState::Resident(_) => None,
        }
    }

    /// Records that the page has been paged out to `slot`.
    pub fn mark_swapped(&self, slot: u64) {
        *self.state.lock() = AnonState::Swapped(slot);
    }

    /// Records that the page has been paged back in to `frame`.
    pub fn mark_resident(&self, frame: PhysFrame<Size4KiB>) {
        *self.state.lock() = AnonState::Resident(frame);
    }

    /// Marks the page dirty (written since last clean).
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Clears the dirty bit, returning its previous value.
    pub fn clear_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    /// Returns `true` if this is the sole owner, meaning a write fault can
    /// modify the page in place instead of copying it.
    #[must_use]
    pub fn is_unique(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PhysAddr;

    fn frame(addr: u64) -> PhysFrame<Size4KiB> {
        PhysFrame::from_start_address(PhysAddr::new_truncate(addr)).unwrap()
    }

    #[test]
    fn new_anon_is_resident_and_unique() {
        let a = Anon::new_resident(frame(0x1000));
        assert_eq!(a.resident_frame(), Some(frame(0x1000)));
        assert!(a.is_unique());
    }

    #[test]
    fn shared_anon_is_not_unique() {
        let a = Anon::new_resident(frame(0x1000));
        let _b = a.clone();
        assert!(!a.is_unique());
    }

    #[test]
    fn swap_out_and_back_in() {
        let a = Anon::new_resident(frame(0x1000));
        a.mark_swapped(7);
        assert!(a.is_swapped());
        assert_eq!(a.resident_frame(), None);
        a.mark_resident(frame(0x2000));
        assert!(!a.is_swapped());
        assert_eq!(a.resident_frame(), Some(frame(0x2000)));
    }

    #[test]
    fn dirty_tracking() {
        let a = Anon::new_resident(frame(0x1000));
        assert!(!a.clear_dirty());
        a.mark_dirty();
        assert!(a.clear_dirty());
        assert!(!a.clear_dirty());
    }
}
