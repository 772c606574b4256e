//! The PFN (page frame number) database.
//!
//! Every physical page of managed memory has one entry here, indexed by
//! its frame number. This is the kernel's single source of truth for what
//! a page is being used for and who is mapping it; the PFN database, not
//! any particular address space, owns a page's lifetime once it has been
//! handed out by [`alloc_page`].
//!
//! All operations take the database's spinlock, which is acquired at
//! [`crate::ipl::Ipl::Dispatch`] per the kernel's lock hierarchy: callers
//! must not block (or take a lower-ranked lock) while holding it.

use alloc::vec::Vec;

use crate::paging::{PhysFrame, Size4KiB};
use crate::sync::SpinLock;

/// What a physical page is currently being used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageUse {
    /// On the free list, not backing anything.
    Free,
    /// Backing an anonymous (swap-backed) page.
    Anonymous,
    /// Cached page data belonging to a vnode-backed VM object.
    ObjectCached,
    /// Wired down permanently for kernel use (page tables, kernel stacks).
    Wired,
    /// Internal VM bookkeeping (e.g. amap radix tree nodes).
    VmInternal,
    /// A DMA/device buffer page.
    DeviceBuffer,
}

/// A page's position in its residency lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Wired: never reclaimed, wire count > 0.
    Wired,
    /// On a process's working set and reachable.
    Active,
    /// Unmapped from all address spaces but still holds valid data
    /// (clean pages here are reclaimed first).
    Inactive,
    /// Undergoing I/O (page-in or page-out); must not be touched.
    Busy,
}

/// A single page-table mapping of a physical page, recorded so that
/// unmapping or protection changes can find every mapping to shoot down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PvEntry {
    /// Opaque id of the owning address space (its pmap root frame number
    /// works well here, since it's already unique and stable).
    pub address_space_id: u64,
    /// Virtual address the page is mapped at in that address space.
    pub vaddr: u64,
}

/// Per-page metadata.
#[derive(Debug, Clone)]
pub struct PfnEntry {
    pub(crate) page_use: PageUse,
    pub(crate) status: PageStatus,
    pub(crate) dirty: bool,
    pub(crate) wire_count: u16,
    /// Weak back-pointer to the owning VM object, by object id
    /// ([`crate::objmgr::ObjectHeader::id`]). Weak because the object owns
    /// the page strongly (through its amap/cache); a strong pointer here
    /// would form a cycle the object manager can't collect.
    pub(crate) owner: Option<u64>,
    pub(crate) pv_list: Vec<PvEntry>,
    /// Next free frame's index, when `page_use == Free`. `u64::MAX` ends
    /// the list.
    next_free: u64,
}

impl PfnEntry {
    const fn new_free() -> Self {
        Self {
            page_use: PageUse::Free,
            status: PageStatus::Inactive,
            dirty: false,
            wire_count: 0,
            owner: None,
            pv_list: Vec::new(),
            next_free: u64::MAX,
        }
    }
}

struct Inner {
    entries: Vec<PfnEntry>,
    free_head: u64,
    free_count: u64,
}

/// The PFN database: metadata and a free list for every managed physical
/// frame, indexed `[0, frame_count)` relative to `base_frame`.
pub struct PfnDatabase {
    inner: SpinLock<Inner>,
    base_frame: u64,
}

/// Errors returned by PFN database operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfnError {
    /// No free frames remain.
    OutOfMemory,
    /// The frame number is outside the database's managed range.
    OutOfRange,
}

impl PfnDatabase {
    /// Creates a database covering `frame_count` frames starting at
    /// `base_frame`, with every frame initially free.
    #[must_use]
    pub fn new(base_frame: u64, frame_count: u64) -> Self {
        let count = frame_count as usize;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let mut e = PfnEntry::new_free();
            e.next_free = if i + 1 < count { (i + 1) as u64 } else { u64::MAX };
            entries.push(e);
        }
        Self {
            inner: SpinLock::new(Inner {
                entries,
                free_head: if count > 0 { 0 } else { u64::MAX },
                free_count: frame_count,
            }),
            base_frame,
        }
    }

    fn index_of(&self, frame: PhysFrame<Size4KiB>) -> Option<usize> {
        let fno = frame.start_address().as_u64() >> 12;
        fno.checked_sub(self.base_frame).map(|i| i as usize)
    }

    /// Number of frames currently on the free list.
    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.inner.lock().free_count
    }

    /// Removes one frame from the free list and marks it for `use_`.
    pub fn alloc_page(&self, use_: PageUse) -> Result<PhysFrame<Size4KiB>, PfnError> {
        let mut inner = self.inner.lock();
        let idx = inner.free_head;
        if idx == u64::MAX {
            return Err(PfnError::OutOfMemory);
        }
        let next = inner.entries[idx as usize].next_free;
        inner.free_head = next;
        inner.free_count -= 1;

        let entry = &mut inner.entries[idx as usize];
        entry.page_use = use_;
        entry.status = PageStatus::Active;
        entry.dirty = false;
        entry.wire_count = 0;
        entry.owner = None;
        entry.pv_list.clear();

        let frame_addr = (self.base_frame + idx) << 12;
        Ok(PhysFrame::from_start_address(crate::addr::PhysAddr::new_truncate(frame_addr)).unwrap())
    }

    /// Returns a page to the free list.
    ///
    /// # Panics
    ///
    /// Panics (debug builds) if the page is still wired or has mappings.
    pub fn free_page(&self, frame: PhysFrame<Size4KiB>) -> Result<(), PfnError> {
        let idx = self.index_of(frame).ok_or(PfnError::OutOfRange)?;
        let mut inner = self.inner.lock();
        {
            let entry = inner
                .entries
                .get(idx)
                .ok_or(PfnError::OutOfRange)?;
            debug_assert_eq!(entry.wire_count, 0, "freeing a wired page");
            debug_assert!(entry.pv_list.is_empty(), "freeing a still-mapped page");
        }
        let head = inner.free_head;
        let entry = &mut inner.entries[idx];
        *entry = PfnEntry::new_free();
        entry.next_free = head;
        inner.free_head = idx as u64;
        inner.free_count += 1;
        Ok(())
    }

    /// Increments the wire count, pinning the page against reclamation.
    /// Sets status to [`PageStatus::Wired`].
    pub fn wire(&self, frame: PhysFrame<Size4KiB>) -> Result<u16, PfnError> {
        let idx = self.index_of(frame).ok_or(PfnError::OutOfRange)?;
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(idx).ok_or(PfnError::OutOfRange)?;
        entry.wire_count += 1;
        entry.status = PageStatus::Wired;
        Ok(entry.wire_count)
    }

    /// Decrements the wire count; once it reaches zero the page returns to
    /// [`PageStatus::Active`] (eligible for the inactive/reclaim path
    /// again).
    ///
    /// # Panics
    ///
    /// Panics (debug builds) on an unbalanced unwire.
    pub fn unwire(&self, frame: PhysFrame<Size4KiB>) -> Result<u16, PfnError> {
        let idx = self.index_of(frame).ok_or(PfnError::OutOfRange)?;
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(idx).ok_or(PfnError::OutOfRange)?;
        debug_assert!(entry.wire_count > 0, "unwiring a page with wire_count == 0");
        entry.wire_count = entry.wire_count.saturating_sub(1);
        if entry.wire_count == 0 {
            entry.status = PageStatus::Active;
        }
        Ok(entry.wire_count)
    }

    /// Sets the weak owning-object id.
    pub fn set_owner(&self, frame: PhysFrame<Size4KiB>, owner: Option<u64>) -> Result<(), PfnError> {
        let idx = self.index_of(frame).ok_or(PfnError::OutOfRange)?;
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(idx).ok_or(PfnError::OutOfRange)?;
        entry.owner = owner;
        Ok(())
    }

    /// Marks the page dirty or clean.
    pub fn mark_dirty(&self, frame: PhysFrame<Size4KiB>, dirty: bool) -> Result<(), PfnError> {
        let idx = self.index_of(frame).ok_or(PfnError::OutOfRange)?;
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(idx).ok_or(PfnError::OutOfRange)?;
        entry.dirty = dirty;
        Ok(())
    }

    /// Records a new mapping of this page.
    pub fn add_pv(&self, frame: PhysFrame<Size4KiB>, pv: PvEntry) -> Result<(), PfnError> {
        let idx = self.index_of(frame).ok_or(PfnError::OutOfRange)?;
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(idx).ok_or(PfnError::OutOfRange)?;
        entry.pv_list.push(pv);
        Ok(())
    }

    /// Removes a single mapping of this page, if present.
    pub fn remove_pv(&self, frame: PhysFrame<Size4KiB>, pv: PvEntry) -> Result<(), PfnError> {
        let idx = self.index_of(frame).ok_or(PfnError::OutOfRange)?;
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(idx).ok_or(PfnError::OutOfRange)?;
        if let Some(pos) = entry.pv_list.iter().position(|e| *e == pv) {
            entry.pv_list.swap_remove(pos);
        }
        Ok(())
    }

    /// Snapshots a page's metadata for diagnostics and tests.
    pub fn snapshot(&self, frame: PhysFrame<Size4KiB>) -> Result<PfnEntry, PfnError> {
        let idx = self.index_of(frame).ok_or(PfnError::OutOfRange)?;
        let inner = self.inner.lock();
        inner.entries.get(idx).cloned().ok_or(PfnError::OutOfRange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(i: u64) -> PhysFrame<Size4KiB> {
        PhysFrame::from_start_address(crate::addr::PhysAddr::new_truncate(i << 12)).unwrap()
    }

    #[test]
    fn alloc_and_free_roundtrip() {
        let db = PfnDatabase::new(0, 4);
        assert_eq!(db.free_count(), 4);
        let f = db.alloc_page(PageUse::Anonymous).unwrap();
        assert_eq!(db.free_count(), 3);
        db.free_page(f).unwrap();
        assert_eq!(db.free_count(), 4);
    }

    #[test]
    fn out_of_memory_when_exhausted() {
        let db = PfnDatabase::new(0, 1);
        db.alloc_page(PageUse::Anonymous).unwrap();
        assert_eq!(db.alloc_page(PageUse::Anonymous), Err(PfnError::OutOfMemory));
    }

    #[test]
    fn wire_unwire_tracks_count_and_status() {
        let db = PfnDatabase::new(0, 1);
        let f = db.alloc_page(PageUse::Anonymous).unwrap();
        assert_eq!(db.wire(f).unwrap(), 1);
        assert_eq!(db.snapshot(f).unwrap().status, PageStatus::Wired);
        assert_eq!(db.unwire(f).unwrap(), 0);
        assert_eq!(db.snapshot(f).unwrap().status, PageStatus::Active);
    }

    #[test]
    fn pv_list_add_remove() {
        let db = PfnDatabase::new(0, 1);
        let f = db.alloc_page(PageUse::Anonymous).unwrap();
        let pv = PvEntry {
            address_space_id: 1,
            vaddr: 0x4000,
        };
        db.add_pv(f, pv).unwrap();
        assert_eq!(db.snapshot(f).unwrap().pv_list.len(), 1);
        db.remove_pv(f, pv).unwrap();
        assert_eq!(db.snapshot(f).unwrap().pv_list.len(), 0);
    }

    #[test]
    fn free_resets_metadata() {
        let db = PfnDatabase::new(0, 1);
        let f = db.alloc_page(PageUse::ObjectCached).unwrap();
        db.set_owner(f, Some(42)).unwrap();
        db.mark_dirty(f, true).unwrap();
        db.free_page(f).unwrap();
        let f2 = db.alloc_page(PageUse::Anonymous).unwrap();
        assert_eq!(f, f2);
        let snap = db.snapshot(f2).unwrap();
        assert_eq!(snap.owner, None);
        assert!(!snap.dirty);
    }

    #[test]
    fn out_of_range_frame_is_rejected() {
        let db = PfnDatabase::new(100, 4);
        assert_eq!(db.wire(frame(0)), Err(PfnError::OutOfRange));
    }
}
