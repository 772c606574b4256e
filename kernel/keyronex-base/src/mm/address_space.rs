//! Per-process address space: VAD tree, virtual-address arena, the page
//! fault handler, and fork.
//!
//! Generic over the architecture's pmap mapper, same as [`super::vmm::Vmm`]
//! on the kernel side. Every address space's root page table shares the
//! kernel's upper half via [`AddressSpaceRoot`], so a syscall or interrupt
//! taken while a user address space is current still sees live kernel
//! mappings. Every frame an address space maps -- its root, intermediate
//! page tables, and user data pages -- comes from the same [`PfnDatabase`]
//! it drops its root back into, so [`Drop`] never has to reason about a
//! second allocator's bookkeeping.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::addr::{PhysAddr, VirtAddr};
use crate::mm::amap::Amap;
use crate::mm::anon::Anon;
use crate::mm::hhdm;
use crate::mm::mapper::{AddressSpaceRoot, MapFlags, PageMapper, PageTranslator};
use crate::mm::pfn::{PageUse, PfnDatabase, PvEntry};
use crate::mm::region::FreeRegionAllocator;
use crate::mm::vad::{Inheritance, Vad};
use crate::mm::{PAGE_SIZE, zero_frame};
use crate::paging::{Page, PhysFrame, Size4KiB};
use crate::sync::SpinLock;

/// Capacity of a user address space's free-range arena.
const USER_VMEM_FREE_LIST_CAPACITY: usize = 64;

/// Outcome of [`AddressSpace::fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResult {
    /// The fault was resolved; the faulting instruction may be retried.
    Ok,
    /// No VAD covers the address, or the access violates its protection.
    Failure,
    /// Paging I/O was submitted; caller must release its locks and
    /// re-drive the fault once it completes.
    Retry,
    /// Resolving the fault needed a frame and the PFN database had none
    /// to give; distinct from [`Self::Failure`] because the access itself
    /// was valid and retrying after reclaim may succeed.
    PageShortage,
}

struct Inner<M> {
    mapper: M,
    /// Keyed by start address; stands in for a red-black tree.
    vads: BTreeMap<u64, Vad>,
    vmem: FreeRegionAllocator<USER_VMEM_FREE_LIST_CAPACITY>,
}

/// A process's virtual address space.
///
/// Dropping an `AddressSpace` frees its root page table frame back to the
/// [`PfnDatabase`] it was allocated from. It does not walk and unmap every
/// VAD first -- by the time a process's last handle to its address space
/// is gone, nothing can observe the individual unmaps, so only the root
/// itself needs reclaiming.
pub struct AddressSpace<M> {
    id: u64,
    root_phys: PhysAddr,
    pfn: Arc<PfnDatabase>,
    inner: SpinLock<Inner<M>>,
}

/// Copies one physical page's contents to another via the HHDM.
///
/// # Safety
///
/// Both frames must be valid, HHDM-accessible physical pages; `dst` must
/// not be concurrently accessed.
unsafe fn copy_page(src: PhysFrame<Size4KiB>, dst: PhysFrame<Size4KiB>) {
    let src_ptr = hhdm::phys_to_virt(src.start_address()).as_ptr::<u8>();
    let dst_ptr = hhdm::phys_to_virt(dst.start_address()).as_mut_ptr::<u8>();
    // SAFETY: both pointers are HHDM aliases of distinct physical frames.
    unsafe { core::ptr::copy_nonoverlapping(src_ptr, dst_ptr, PAGE_SIZE) };
}

impl<M: PageMapper<Size4KiB> + PageTranslator + AddressSpaceRoot> AddressSpace<M> {
    /// Allocates a page table frame from the PFN database and zeroes it,
    /// satisfying the zeroed-frame contract `PageMapper::map` requires of
    /// its `alloc` callback.
    ///
    /// # Panics
    ///
    /// Panics if the PFN database is exhausted. Page table frames are
    /// wired kernel memory; a system with none left to give is not in a
    /// state callers can usefully recover from mid-map.
    fn alloc_table_frame(pfn: &PfnDatabase) -> PhysFrame<Size4KiB> {
        let frame = pfn
            .alloc_page(PageUse::Wired)
            .expect("out of memory allocating page table frame");
        // SAFETY: frame was just allocated and is exclusively owned here.
        unsafe { zero_frame(hhdm::phys_to_virt(frame.start_address()).as_mut_ptr()) };
        frame
    }

    /// Creates a new address space with a fresh root aliasing
    /// `kernel_root`'s upper half, and a user region carved from
    /// `[user_base, user_base + user_size)`.
    pub fn new(
        mapper: M,
        kernel_root: PhysAddr,
        pfn: Arc<PfnDatabase>,
        user_base: VirtAddr,
        user_size: u64,
    ) -> Self {
        // SAFETY: kernel_root is the live kernel root page table.
        let root_phys =
            unsafe { mapper.new_root(kernel_root, &mut || Self::alloc_table_frame(&pfn)) };
        let id = root_phys.as_u64() >> 12;
        Self {
            id,
            root_phys,
            pfn,
            inner: SpinLock::new(Inner {
                mapper,
                vads: BTreeMap::new(),
                vmem: FreeRegionAllocator::new(user_base, user_size),
            }),
        }
    }

    /// Physical address of this address space's root page table.
    #[must_use]
    pub const fn root_phys(&self) -> PhysAddr {
        self.root_phys
    }

    /// Diagnostic/PV-list id for this address space (its root frame
    /// number, which is already unique and stable for its lifetime).
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Installs `vad` in the map. Callers reserve the range from
    /// [`Self::reserve`] first and build the VAD to match.
    pub fn insert_vad(&self, vad: Vad) {
        let mut inner = self.inner.lock();
        inner.vads.insert(vad.start().as_u64(), vad);
    }

    /// Carves `size` bytes (aligned to `align`) out of the user vmem
    /// arena without installing a VAD, for callers that build the VAD
    /// afterward from the returned range.
    pub fn reserve(
        &self,
        size: u64,
        align: u64,
    ) -> Result<VirtAddr, crate::mm::region::RegionError> {
        self.inner.lock().vmem.alloc(size, align)
    }

    fn find_vad(vads: &BTreeMap<u64, Vad>, vaddr: VirtAddr) -> Option<&Vad> {
        vads.range(..=vaddr.as_u64())
            .next_back()
            .map(|(_, vad)| vad)
            .filter(|vad| vad.contains(vaddr))
    }

    /// Resolves a page fault at `vaddr` requesting `flags` access.
    ///
    /// Implements the fault algorithm: amap hit (with copy-on-write on a
    /// shared, written anon), amap miss falling through to the backing
    /// object, and a pure anonymous miss allocating a fresh zero page.
    pub fn fault(&self, vaddr: VirtAddr, flags: MapFlags) -> FaultResult {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(vad) = Self::find_vad(&inner.vads, vaddr) else {
            return FaultResult::Failure;
        };
        let write = flags.contains(MapFlags::WRITABLE);
        if write && !vad.protection().contains(MapFlags::WRITABLE) {
            return FaultResult::Failure;
        }

        let page = Page::<Size4KiB>::containing_address(vaddr);
        let page_index = vad.object_offset(vaddr) / PAGE_SIZE as u64;
        let protection = vad.protection();
        let object = vad.object().cloned();

        if let Some(amap) = vad.amap() {
            if let Some(anon) = amap.lookup(page_index) {
                let frame = match anon.resident_frame() {
                    Some(frame) => frame,
                    None => {
                        // Hit, non-resident: read the page back from its
                        // swap slot through the pager. An anon with no
                        // slot yet (being written out, not yet resident)
                        // has nothing to read.
                        let Some(slot) = anon.swap_slot() else {
                            return FaultResult::Retry;
                        };
                        let Some(frame) = crate::mm::pager::read_swap_page(&self.pfn, slot) else {
                            return FaultResult::Retry;
                        };
                        anon.mark_resident(frame);
                        frame
                    }
                };
                let (enter_frame, enter_prot) = if write && !anon.is_unique() {
                    let Ok(new_frame) = self.pfn.alloc_page(PageUse::Anonymous) else {
                        return FaultResult::PageShortage;
                    };
                    // SAFETY: `frame` is live and resident; `new_frame`
                    // was just allocated and is exclusively owned here.
                    unsafe { copy_page(frame, new_frame) };
                    amap.insert(page_index, Anon::new_resident(new_frame));
                    (new_frame, protection)
                } else if anon.is_unique() {
                    (frame, protection)
                } else {
                    (frame, protection.difference(MapFlags::WRITABLE))
                };
                self.enter(&inner.mapper, page, enter_frame, enter_prot);
                return FaultResult::Ok;
            }

            if object.is_none() {
                // Miss, no object parent: fresh zero page.
                let Ok(frame) = self.pfn.alloc_page(PageUse::Anonymous) else {
                    return FaultResult::PageShortage;
                };
                // SAFETY: frame was just allocated and is exclusively
                // owned here.
                unsafe { zero_frame(hhdm::phys_to_virt(frame.start_address()).as_mut_ptr()) };
                amap.insert(page_index, Anon::new_resident(frame));
                self.enter(&inner.mapper, page, frame, protection);
                return FaultResult::Ok;
            }
        }

        let Some(object) = object else {
            return FaultResult::Failure;
        };
        // Cache miss against the object: read it in through the pager.
        // `None` (no resolver registered for this vnode, or the PFN
        // database/read itself failed) falls through to the same Retry
        // a bare cache miss always returned.
        let cached = object.cached_page(page_index).or_else(|| {
            let vnode_id = object.vnode_id()?;
            let frame = crate::mm::pager::read_object_page(&self.pfn, vnode_id, page_index)?;
            let cached = crate::mm::object::ObjectPage::new(frame);
            object.insert_cached_page(page_index, cached.clone());
            Some(cached)
        });
        match cached {
            Some(cached) => {
                if write {
                    match vad.amap() {
                        Some(amap) => {
                            let Ok(new_frame) = self.pfn.alloc_page(PageUse::Anonymous) else {
                                return FaultResult::PageShortage;
                            };
                            // SAFETY: `cached` backs a live object page;
                            // `new_frame` was just allocated.
                            unsafe { copy_page(cached.frame(), new_frame) };
                            amap.insert(page_index, Anon::new_resident(new_frame));
                            self.enter(&inner.mapper, page, new_frame, protection);
                        }
                        None => {
                            // Shared object map: writes go straight through.
                            self.enter(&inner.mapper, page, cached.frame(), protection);
                        }
                    }
                } else {
                    self.enter(
                        &inner.mapper,
                        page,
                        cached.frame(),
                        protection.difference(MapFlags::WRITABLE),
                    );
                }
                FaultResult::Ok
            }
            None => FaultResult::Retry,
        }
    }

    fn enter(&self, mapper: &M, page: Page<Size4KiB>, frame: PhysFrame<Size4KiB>, protection: MapFlags) {
        let flags = protection | MapFlags::USER;
        // SAFETY: root_phys is this address space's live root; frame is
        // owned (directly or via an amap/object) by the VAD covering
        // `page`.
        unsafe {
            mapper.map(self.root_phys, page, frame, flags, &mut || {
                Self::alloc_table_frame(&self.pfn)
            })
        }
        .ignore();
        let _ = self.pfn.add_pv(
            frame,
            PvEntry {
                address_space_id: self.id,
                vaddr: page.start_address().as_u64(),
            },
        );
    }

    /// Demotes every mapping this address space holds of `amap`'s
    /// resident anons to read-only, by walking each anon's PV list under
    /// the PFN lock. Used by [`Self::fork`] so a forked child's
    /// copy-on-write amap is actually write-protected in the parent too.
    fn demote_to_readonly(&self, mapper: &M, amap: &Amap) {
        amap.for_each(|_, anon| {
            let Some(frame) = anon.resident_frame() else {
                return;
            };
            let Ok(snapshot) = self.pfn.snapshot(frame) else {
                return;
            };
            for pv in snapshot
                .pv_list
                .iter()
                .filter(|pv| pv.address_space_id == self.id)
            {
                let page = Page::<Size4KiB>::containing_address(VirtAddr::new_truncate(pv.vaddr));
                // SAFETY: root_phys is this address space's live root;
                // the PV entry records that `page` maps `frame` here.
                unsafe {
                    let _ = mapper.update_flags(self.root_phys, page, MapFlags::USER);
                }
            }
        });
    }

    /// Forks this address space into a new child, duplicating VADs per
    /// their inheritance tag. `mapper` is the child's own pmap mapper
    /// (stateless per architecture, so a fresh instance suffices).
    pub fn fork(&self, mapper: M, kernel_root: PhysAddr) -> Self {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // SAFETY: kernel_root is the live kernel root page table.
        let child_root =
            unsafe { mapper.new_root(kernel_root, &mut || Self::alloc_table_frame(&self.pfn)) };

        let mut child_vads = BTreeMap::new();
        for (start, vad) in inner.vads.iter() {
            if vad.inheritance() == Inheritance::Copy {
                if let Some(amap) = vad.amap() {
                    self.demote_to_readonly(&inner.mapper, amap);
                }
            }
            child_vads.insert(*start, vad.fork());
        }

        Self {
            id: child_root.as_u64() >> 12,
            root_phys: child_root,
            pfn: self.pfn.clone(),
            inner: SpinLock::new(Inner {
                mapper,
                vads: child_vads,
                vmem: inner.vmem.clone(),
            }),
        }
    }
}

impl<M: AddressSpaceRoot> Drop for AddressSpace<M> {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        // SAFETY: root_phys was returned by `new_root` for this address
        // space and this is its sole owner; nothing can have it loaded as
        // a live root by now.
        unsafe {
            inner.mapper.free_root(self.root_phys, &mut |frame| {
                let _ = self.pfn.free_page(frame);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::mapper::{MapFlush, UnmapError};
    use crate::mm::vad::Inheritance;

    /// A fake mapper that just records calls; good enough to exercise the
    /// fault/fork algorithms without real page tables.
    struct FakeMapper;

    unsafe impl PageMapper<Size4KiB> for FakeMapper {
        unsafe fn map(
            &self,
            _root: PhysAddr,
            page: Page<Size4KiB>,
            _frame: PhysFrame<Size4KiB>,
            _flags: MapFlags,
            _alloc: &mut dyn FnMut() -> PhysFrame<Size4KiB>,
        ) -> MapFlush {
            MapFlush::new(page.start_address())
        }

        unsafe fn unmap(
            &self,
            _root: PhysAddr,
            page: Page<Size4KiB>,
        ) -> Result<(PhysFrame<Size4KiB>, MapFlush), UnmapError> {
            Ok((
                PhysFrame::containing_address(PhysAddr::new_truncate(0)),
                MapFlush::new(page.start_address()),
            ))
        }

        unsafe fn update_flags(
            &self,
            _root: PhysAddr,
            page: Page<Size4KiB>,
            _flags: MapFlags,
        ) -> Result<MapFlush, UnmapError> {
            Ok(MapFlush::new(page.start_address()))
        }
    }

    unsafe impl PageTranslator for FakeMapper {
        unsafe fn translate_addr(&self, _root: PhysAddr, _virt: VirtAddr) -> Option<PhysAddr> {
            None
        }
    }

    unsafe impl AddressSpaceRoot for FakeMapper {
        unsafe fn new_root(
            &self,
            _kernel_root: PhysAddr,
            alloc: &mut dyn FnMut() -> PhysFrame<Size4KiB>,
        ) -> PhysAddr {
            alloc().start_address()
        }

        unsafe fn free_root(&self, root: PhysAddr, dealloc: &mut dyn FnMut(PhysFrame<Size4KiB>)) {
            dealloc(PhysFrame::containing_address(root));
        }
    }

    fn set_hhdm() {
        hhdm::init(0x1000_0000_0000);
    }

    fn va(a: u64) -> VirtAddr {
        VirtAddr::new_truncate(a)
    }

    fn make_space() -> AddressSpace<FakeMapper> {
        set_hhdm();
        let pfn = Arc::new(PfnDatabase::new(0x100, 64));
        AddressSpace::new(
            FakeMapper,
            PhysAddr::new_truncate(0),
            pfn,
            va(0x2000_0000),
            0x10_0000,
        )
    }

    #[test]
    fn fault_outside_any_vad_fails() {
        let space = make_space();
        let result = space.fault(va(0x2000_0000), MapFlags::empty());
        assert_eq!(result, FaultResult::Failure);
    }

    #[test]
    fn anonymous_miss_allocates_zero_page() {
        let space = make_space();
        space.insert_vad(Vad::new_anonymous(
            va(0x2000_0000),
            va(0x2000_1000),
            Inheritance::Copy,
            MapFlags::WRITABLE,
        ));
        let result = space.fault(va(0x2000_0000), MapFlags::WRITABLE);
        assert_eq!(result, FaultResult::Ok);
    }

    #[test]
    fn write_to_read_only_vad_fails() {
        let space = make_space();
        space.insert_vad(Vad::new_anonymous(
            va(0x2000_0000),
            va(0x2000_1000),
            Inheritance::Copy,
            MapFlags::empty(),
        ));
        let result = space.fault(va(0x2000_0000), MapFlags::WRITABLE);
        assert_eq!(result, FaultResult::Failure);
    }

    #[test]
    fn write_fault_on_shared_anon_copies() {
        let space = make_space();
        space.insert_vad(Vad::new_anonymous(
            va(0x2000_0000),
            va(0x2000_1000),
            Inheritance::Copy,
            MapFlags::WRITABLE,
        ));
        // First fault installs the anon.
        space.fault(va(0x2000_0000), MapFlags::WRITABLE);

        let kernel_root = PhysAddr::new_truncate(0);
        let child = space.fork(FakeMapper, kernel_root);
        assert_ne!(child.root_phys(), space.root_phys());

        // Parent's anon is now shared (refcount 2); a second write fault
        // to the parent must copy rather than write in place.
        let result = space.fault(va(0x2000_0000), MapFlags::WRITABLE);
        assert_eq!(result, FaultResult::Ok);
    }

    #[test]
    fn fork_child_sees_same_vad_ranges() {
        let space = make_space();
        space.insert_vad(Vad::new_anonymous(
            va(0x2000_0000),
            va(0x2000_1000),
            Inheritance::Copy,
            MapFlags::WRITABLE,
        ));
        let kernel_root = PhysAddr::new_truncate(0);
        let child = space.fork(FakeMapper, kernel_root);
        let child_result = child.fault(va(0x2000_0000), MapFlags::empty());
        assert_eq!(child_result, FaultResult::Ok);
    }

    #[test]
    fn shared_vad_inherits_with_no_amap_copy() {
        let space = make_space();
        let obj = crate::mm::object::VmObject::new_vnode(1, 0x1000);
        space.insert_vad(Vad::new_shared(
            va(0x2000_0000),
            va(0x2000_1000),
            0,
            obj,
            MapFlags::empty(),
        ));
        let kernel_root = PhysAddr::new_truncate(0);
        let child = space.fork(FakeMapper, kernel_root);
        // A cache miss against the shared object still falls to retry,
        // not failure -- the VAD and its object carried over intact.
        let result = child.fault(va(0x2000_0000), MapFlags::empty());
        assert_eq!(result, FaultResult::Retry);
    }

    struct ImmediateOkHandler;
    impl crate::iop::IopHandler for ImmediateOkHandler {
        fn dispatch(&self, _iop: &crate::iop::Iop, _frame_index: usize) -> crate::iop::IopRet {
            crate::iop::IopRet::Completed
        }
    }

    fn resolve_immediate_ok(_id: u64) -> Option<Arc<dyn crate::iop::IopHandler>> {
        Some(Arc::new(ImmediateOkHandler))
    }

    fn no_vnode_resolver(_id: u64) -> Option<Arc<dyn crate::iop::IopHandler>> {
        None
    }

    #[test]
    fn vnode_cache_miss_resolves_through_the_registered_pager() {
        let space = make_space();
        let obj = crate::mm::object::VmObject::new_vnode(1, 0x1000);
        space.insert_vad(Vad::new_shared(
            va(0x2000_0000),
            va(0x2000_1000),
            0,
            obj,
            MapFlags::empty(),
        ));
        // SAFETY: test-only, single-threaded-enough use of the hook.
        unsafe { crate::mm::pager::set_vnode_resolver(resolve_immediate_ok) };
        let result = space.fault(va(0x2000_0000), MapFlags::empty());
        unsafe { crate::mm::pager::set_vnode_resolver(no_vnode_resolver) };
        assert_eq!(result, FaultResult::Ok);
    }

    #[test]
    fn reserve_carves_distinct_ranges() {
        let space = make_space();
        let a = space.reserve(0x1000, 0x1000).unwrap();
        let b = space.reserve(0x1000, 0x1000).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn drop_frees_root_frame() {
        set_hhdm();
        let pfn = Arc::new(PfnDatabase::new(0x100, 4));
        let before = pfn.free_count();
        let space = AddressSpace::new(
            FakeMapper,
            PhysAddr::new_truncate(0),
            pfn.clone(),
            va(0x2000_0000),
            0x1000,
        );
        drop(space);
        assert_eq!(pfn.free_count(), before);
    }
}
