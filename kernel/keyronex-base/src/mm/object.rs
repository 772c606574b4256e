//! VM objects: the backing store a VAD maps.
//!
//! An anonymous object owns an [`Amap`] outright. A vnode-backed object
//! owns a cache of resident pages keyed by page index, backed by the
//! vnode for everything not currently cached; [`BTreeMap`] plays the role
//! of the red-black tree a C implementation would reach for.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::mm::amap::Amap;
use crate::objmgr::ObjectHeader;
use crate::paging::{PhysFrame, Size4KiB};
use crate::sync::SpinLock;

/// A single cached page of a vnode-backed object.
pub struct ObjectPage {
    frame: PhysFrame<Size4KiB>,
    dirty: AtomicBool,
}

impl ObjectPage {
    /// Wraps a freshly read-in page, initially clean.
    #[must_use]
    pub fn new(frame: PhysFrame<Size4KiB>) -> Arc<Self> {
        Arc::new(Self {
            frame,
            dirty: AtomicBool::new(false),
        })
    }

    /// The physical frame holding this page's data.
    #[must_use]
    pub fn frame(&self) -> PhysFrame<Size4KiB> {
        self.frame
    }

    /// Marks the page dirty (must be written back before reclaim).
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Clears the dirty bit, returning its previous value.
    pub fn clear_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }
}

/// What a VM object is backed by.
pub enum VmObjectKind {
    /// Pure anonymous memory: owns its amap outright.
    Anonymous(Amap),
    /// Backed by a vnode, identified here by object id ([`Weak`]-style:
    /// the vnode is not referenced strongly from here to avoid a cycle
    /// with the vnode's own object cache).
    Vnode {
        vnode_id: u64,
        pages: BTreeMap<u64, Arc<ObjectPage>>,
    },
}

/// A VM object: the thing a VAD's mapping ultimately resolves pages
/// against. Operations on the cache/amap are performed under the
/// object's own mutex.
pub struct VmObject {
    header: ObjectHeader,
    size: AtomicU64,
    kind: SpinLock<VmObjectKind>,
}

impl VmObject {
    /// Creates a new pure-anonymous object of `size` bytes.
    #[must_use]
    pub fn new_anonymous(size: u64) -> Arc<Self> {
        Arc::new(Self {
            header: ObjectHeader::new(crate::objmgr::ObjectKind::VmObject, None),
            size: AtomicU64::new(size),
            kind: SpinLock::new(VmObjectKind::Anonymous(Amap::new())),
        })
    }

    /// Creates a new vnode-backed object of `size` bytes, with an empty
    /// page cache.
    #[must_use]
    pub fn new_vnode(vnode_id: u64, size: u64) -> Arc<Self> {
        Arc::new(Self {
            header: ObjectHeader::new(crate::objmgr::ObjectKind::VmObject, None),
            size: AtomicU64::new(size),
            kind: SpinLock::new(VmObjectKind::Vnode {
                vnode_id,
                pages: BTreeMap::new(),
            }),
        })
    }

    /// This object's diagnostic header.
    #[must_use]
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Looks up the cached page at `page_index` for a vnode-backed object.
    /// Returns `None` for an anonymous object (callers go through its
    /// amap instead via [`Self::with_amap`]) or a cache miss.
    pub fn cached_page(&self, page_index: u64) -> Option<Arc<ObjectPage>> {
        match &*self.kind.lock() {
            VmObjectKind::Vnode { pages, .. } => pages.get(&page_index).cloned(),
            VmObjectKind::Anonymous(_) => None,
        }
    }

    /// Inserts a freshly read-in page into a vnode object's cache.
    ///
    /// # Panics
    ///
    /// Panics if called on an anonymous object.
    pub fn insert_cached_page(&self, page_index: u64, page: Arc<ObjectPage>) {
        match &mut *self.kind.lock() {
            VmObjectKind::Vnode { pages, .. } => {
                pages.insert(page_index, page);
            }
            VmObjectKind::Anonymous(_) => panic!("insert_cached_page on an anonymous object"),
        }
    }

    /// Runs `f` with access to this object's amap.
    ///
    /// # Panics
    ///
    /// Panics if called on a vnode-backed object.
    pub fn with_amap<R>(&self, f: impl FnOnce(&Amap) -> R) -> R {
        match &*self.kind.lock() {
            VmObjectKind::Anonymous(amap) => f(amap),
            VmObjectKind::Vnode { .. } => panic!("with_amap on a vnode-backed object"),
        }
    }

    /// The vnode id backing this object, if vnode-backed.
    #[must_use]
    pub fn vnode_id(&self) -> Option<u64> {
        match &*self.kind.lock() {
            VmObjectKind::Vnode { vnode_id, .. } => Some(*vnode_id),
            VmObjectKind::Anonymous(_) => None,
        }
    }
}

/// A weak reference to a VM object, used where a strong reference would
/// form a cycle (e.g. a VAD's inline amap referring back to its parent
/// object for copy-on-write faults).
pub type VmObjectWeak = Weak<VmObject>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PhysAddr;

    fn frame(addr: u64) -> PhysFrame<Size4KiB> {
        PhysFrame::from_start_address(PhysAddr::new_truncate(addr)).unwrap()
    }

    #[test]
    fn anonymous_object_exposes_amap() {
        let obj = VmObject::new_anonymous(0x10000);
        obj.with_amap(|amap| assert!(amap.is_empty()));
    }

    #[test]
    fn vnode_object_cache_roundtrip() {
        let obj = VmObject::new_vnode(99, 0x1000);
        assert_eq!(obj.vnode_id(), Some(99));
        assert!(obj.cached_page(0).is_none());
        obj.insert_cached_page(0, ObjectPage::new(frame(0x8000)));
        let page = obj.cached_page(0).unwrap();
        assert_eq!(page.frame(), frame(0x8000));
    }

    #[test]
    #[should_panic(expected = "with_amap on a vnode-backed object")]
    fn with_amap_panics_on_vnode_object() {
        let obj = VmObject::new_vnode(1, 0x1000);
        obj.with_amap(|_| ());
    }

    #[test]
    fn object_page_dirty_tracking() {
        let page = ObjectPage::new(frame(0x9000));
        assert!(!page.clear_dirty());
        page.mark_dirty();
        assert!(page.clear_dirty());
    }
}
