//! Virtual address descriptors: the map's unit of bookkeeping.
//!
//! A VAD describes one non-overlapping `[start, end)` range of a process's
//! address space and how faults inside it should be resolved. The map
//! itself (the VAD tree plus the virtual-address arena) lives in
//! [`super::address_space`]; a [`BTreeMap`](alloc::collections::BTreeMap)
//! keyed by start address stands in for the red-black tree a C
//! implementation would use.

use alloc::sync::Arc;

use crate::addr::VirtAddr;
use crate::mm::amap::Amap;
use crate::mm::mapper::MapFlags;
use crate::mm::object::VmObject;

/// What happens to a VAD's contents across [`super::address_space::AddressSpace::fork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inheritance {
    /// The child gets a VAD referencing the same object; no copy.
    Shared,
    /// The child gets its own copy-on-write amap shadowing the object.
    Copy,
    /// Only the invoking thread's stack region is duplicated.
    Stack,
}

/// A single virtual address descriptor.
///
/// The three shapes spec'd for a VAD all fall out of which of `object` and
/// `amap` are present:
///
/// | object | amap | shape                                        |
/// |--------|------|-----------------------------------------------|
/// | some   | none | shared object map: direct view of the vnode   |
/// | none   | some | pure anonymous: backed entirely by the amap   |
/// | some   | some | private (COW) object: amap shadows the object |
pub struct Vad {
    start: VirtAddr,
    end: VirtAddr,
    /// Offset into `object` that `start` corresponds to.
    offset: u64,
    object: Option<Arc<VmObject>>,
    amap: Option<Amap>,
    inheritance: Inheritance,
    protection: MapFlags,
    max_protection: MapFlags,
}

impl Vad {
    /// Creates a pure-anonymous VAD covering `[start, end)`.
    #[must_use]
    pub fn new_anonymous(
        start: VirtAddr,
        end: VirtAddr,
        inheritance: Inheritance,
        protection: MapFlags,
    ) -> Self {
        Self {
            start,
            end,
            offset: 0,
            object: None,
            amap: Some(Amap::new()),
            inheritance,
            protection,
            max_protection: protection,
        }
    }

    /// Creates a shared-object VAD: a direct view of `object`'s cache with
    /// no private amap.
    #[must_use]
    pub fn new_shared(
        start: VirtAddr,
        end: VirtAddr,
        offset: u64,
        object: Arc<VmObject>,
        protection: MapFlags,
    ) -> Self {
        Self {
            start,
            end,
            offset,
            object: Some(object),
            amap: None,
            inheritance: Inheritance::Shared,
            protection,
            max_protection: protection,
        }
    }

    /// Creates a private (copy-on-write) VAD: `object` backs reads, writes
    /// are captured in a private amap.
    #[must_use]
    pub fn new_private(
        start: VirtAddr,
        end: VirtAddr,
        offset: u64,
        object: Arc<VmObject>,
        protection: MapFlags,
    ) -> Self {
        Self {
            start,
            end,
            offset,
            object: Some(object),
            amap: Some(Amap::new()),
            inheritance: Inheritance::Copy,
            protection,
            max_protection: protection,
        }
    }

    /// Start of the covered range.
    #[must_use]
    pub const fn start(&self) -> VirtAddr {
        self.start
    }

    /// End (exclusive) of the covered range.
    #[must_use]
    pub const fn end(&self) -> VirtAddr {
        self.end
    }

    /// Length of the covered range in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns `true` if this VAD covers an empty range. Never constructed
    /// this way, but kept for the `len`/`is_empty` pair clippy expects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Returns `true` if `vaddr` falls within `[start, end)`.
    #[must_use]
    pub fn contains(&self, vaddr: VirtAddr) -> bool {
        vaddr.as_u64() >= self.start.as_u64() && vaddr.as_u64() < self.end.as_u64()
    }

    /// Offset into `object()` (if any) that `vaddr` resolves to.
    #[must_use]
    pub fn object_offset(&self, vaddr: VirtAddr) -> u64 {
        self.offset + (vaddr - self.start)
    }

    /// The backing object, if any.
    #[must_use]
    pub fn object(&self) -> Option<&Arc<VmObject>> {
        self.object.as_ref()
    }

    /// The private amap, if any.
    #[must_use]
    pub fn amap(&self) -> Option<&Amap> {
        self.amap.as_ref()
    }

    /// This VAD's inheritance disposition across fork.
    #[must_use]
    pub const fn inheritance(&self) -> Inheritance {
        self.inheritance
    }

    /// Current protection.
    #[must_use]
    pub const fn protection(&self) -> MapFlags {
        self.protection
    }

    /// Maximum protection this VAD may ever be widened to.
    #[must_use]
    pub const fn max_protection(&self) -> MapFlags {
        self.max_protection
    }

    /// Narrows or widens current protection, clamped to `max_protection`.
    pub fn set_protection(&mut self, protection: MapFlags) {
        self.protection = protection & self.max_protection;
    }

    /// Duplicates this VAD for a fork child per its inheritance tag.
    ///
    /// `Shared` VADs share the object with no amap copy. `Copy` VADs get a
    /// forked (refcount-bumped, structurally duplicated) amap. `Stack` is
    /// handled by the caller, which decides which stack VAD belongs to the
    /// forking thread; a VAD reached here with `Stack` inheritance during a
    /// non-stack fork pass is treated like `Copy`.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            start: self.start,
            end: self.end,
            offset: self.offset,
            object: self.object.clone(),
            amap: self.amap.as_ref().map(Amap::fork),
            inheritance: self.inheritance,
            protection: self.protection,
            max_protection: self.max_protection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(a: u64) -> VirtAddr {
        VirtAddr::new_truncate(a)
    }

    #[test]
    fn anonymous_vad_has_amap_no_object() {
        let vad = Vad::new_anonymous(va(0x1000), va(0x2000), Inheritance::Copy, MapFlags::WRITABLE);
        assert!(vad.amap().is_some());
        assert!(vad.object().is_none());
        assert_eq!(vad.len(), 0x1000);
    }

    #[test]
    fn shared_vad_has_object_no_amap() {
        let obj = VmObject::new_vnode(1, 0x1000);
        let vad = Vad::new_shared(va(0x1000), va(0x2000), 0, obj, MapFlags::empty());
        assert!(vad.object().is_some());
        assert!(vad.amap().is_none());
    }

    #[test]
    fn private_vad_has_both() {
        let obj = VmObject::new_vnode(1, 0x1000);
        let vad = Vad::new_private(va(0x1000), va(0x2000), 0, obj, MapFlags::WRITABLE);
        assert!(vad.object().is_some());
        assert!(vad.amap().is_some());
    }

    #[test]
    fn contains_is_half_open() {
        let vad = Vad::new_anonymous(va(0x1000), va(0x2000), Inheritance::Copy, MapFlags::empty());
        assert!(vad.contains(va(0x1000)));
        assert!(vad.contains(va(0x1FFF)));
        assert!(!vad.contains(va(0x2000)));
    }

    #[test]
    fn object_offset_accounts_for_vad_offset() {
        let obj = VmObject::new_vnode(1, 0x4000);
        let vad = Vad::new_shared(va(0x1000), va(0x3000), 0x2000, obj, MapFlags::empty());
        assert_eq!(vad.object_offset(va(0x1500)), 0x2500);
    }

    #[test]
    fn set_protection_clamps_to_max() {
        let mut vad = Vad::new_anonymous(va(0x1000), va(0x2000), Inheritance::Copy, MapFlags::empty());
        vad.max_protection = MapFlags::WRITABLE;
        vad.set_protection(MapFlags::WRITABLE | MapFlags::EXECUTABLE);
        assert_eq!(vad.protection(), MapFlags::WRITABLE);
    }

    #[test]
    fn fork_shares_object_and_forks_amap() {
        let obj = VmObject::new_vnode(1, 0x1000);
        let vad = Vad::new_private(va(0x1000), va(0x2000), 0, obj, MapFlags::WRITABLE);
        let child = vad.fork();
        assert!(Arc::ptr_eq(vad.object().unwrap(), child.object().unwrap()));
        assert!(child.amap().unwrap().is_empty());
    }
}
