//! Kernel-side virtual memory manager.
//!
//! Owns the kernel pmap root and hands out mappings within the regions
//! described by [`MemoryLayout`]: the kernel heap (monotonically grown),
//! MMIO windows (allocated from a free-range arena and never reused while
//! mapped), and guarded kernel stacks.
//!
//! Generic over the architecture's [`PageMapper`] so the same logic backs
//! every target; the kernel picks the concrete mapper type.

use crate::addr::{PhysAddr, VirtAddr};
use crate::mm::hhdm;
use crate::mm::layout::{self, MemoryLayout};
use crate::mm::mapper::{MapFlags, PageMapper, PageTranslator};
use crate::mm::region::{FreeRegionAllocator, RegionError};
use crate::mm::{FrameAllocator, PAGE_SIZE, VmmError, zero_frame};
use crate::paging::{Page, PhysFrame, Size4KiB};

/// Capacity of the MMIO region's free-range arena.
const MMIO_FREE_LIST_CAPACITY: usize = 64;

/// Default size of a kernel stack, excluding its guard page.
const DEFAULT_KERNEL_STACK_SIZE: u64 = 64 * 1024;

/// A guarded kernel stack: a mapped region preceded by one unmapped guard
/// page, so a stack overflow faults instead of corrupting adjacent memory.
#[derive(Debug, Clone, Copy)]
pub struct KernelStack {
    guard: VirtAddr,
    bottom: VirtAddr,
    top: VirtAddr,
}

impl KernelStack {
    /// Address of the unmapped guard page below the stack.
    #[must_use]
    pub const fn guard(&self) -> VirtAddr {
        self.guard
    }

    /// Lowest mapped address of the stack (growth limit).
    #[must_use]
    pub const fn bottom(&self) -> VirtAddr {
        self.bottom
    }

    /// Initial stack pointer value (top of the mapped region).
    #[must_use]
    pub const fn top(&self) -> VirtAddr {
        self.top
    }
}

/// A mapped MMIO window.
#[derive(Debug, Clone, Copy)]
pub struct MmioMapping {
    virt_base: VirtAddr,
    size: u64,
}

impl MmioMapping {
    /// Virtual base address of the mapping.
    #[must_use]
    pub const fn virt_base(&self) -> VirtAddr {
        self.virt_base
    }

    /// Size in bytes of the mapping.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

/// The kernel virtual memory manager.
pub struct Vmm<M> {
    root_phys: PhysAddr,
    mapper: M,
    layout: MemoryLayout,
    heap_cursor: VirtAddr,
    stack_cursor: VirtAddr,
    mmio_alloc: FreeRegionAllocator<MMIO_FREE_LIST_CAPACITY>,
}

fn map_range<M: PageMapper<Size4KiB>>(
    mapper: &M,
    root: PhysAddr,
    start: VirtAddr,
    size: u64,
    flags: MapFlags,
    alloc: &mut impl FrameAllocator<Size4KiB>,
) -> Result<(), VmmError> {
    let page_count = size.div_ceil(PAGE_SIZE as u64);
    for i in 0..page_count {
        let page = Page::<Size4KiB>::containing_address(start + i * PAGE_SIZE as u64);
        let frame = alloc.allocate_frame().ok_or(VmmError::OutOfMemory)?;
        // SAFETY: frame was just allocated, uniquely owned; root is the
        // live kernel pmap root.
        unsafe {
            let virt = hhdm::phys_to_virt(frame.start_address());
            zero_frame(virt.as_mut_ptr());
            mapper.map(root, page, frame, flags, &mut || {
                alloc.allocate_frame().expect("page table frame allocation failed")
            })
        }
        .ignore();
    }
    Ok(())
}

impl<M: PageMapper<Size4KiB> + PageTranslator> Vmm<M> {
    /// Creates a new VMM over the given pmap root and mapper.
    pub fn new(root_phys: PhysAddr, mapper: M, hhdm_offset: u64, max_phys: u64) -> Self {
        let layout = MemoryLayout::new(hhdm_offset, max_phys);
        let mmio_alloc = FreeRegionAllocator::new(layout.mmio.base(), layout.mmio.max_size());
        Self {
            root_phys,
            mapper,
            heap_cursor: layout.heap.base(),
            stack_cursor: layout.stacks.base(),
            mmio_alloc,
            layout,
        }
    }

    /// Returns the kernel pmap root.
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root_phys
    }

    /// Returns the kernel's virtual address space layout.
    #[must_use]
    pub const fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// Maps and zeroes the initial kernel heap region.
    ///
    /// Returns `(base, size)` of the mapped region.
    pub fn map_initial_heap(
        &mut self,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<(VirtAddr, u64), VmmError> {
        let base = self.heap_cursor;
        let size = layout::INITIAL_HEAP_SIZE;
        map_range(&self.mapper, self.root_phys, base, size, MapFlags::WRITABLE, alloc)?;
        self.heap_cursor = base + size;
        Ok((base, size))
    }

    /// Grows the heap by at least `min_bytes`, rounded up to
    /// [`layout::HEAP_GROW_MIN`]. Returns `(new_region_base, size)`.
    pub fn grow_heap(
        &mut self,
        min_bytes: u64,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<(VirtAddr, u64), VmmError> {
        let grow = min_bytes.div_ceil(layout::HEAP_GROW_MIN) * layout::HEAP_GROW_MIN;
        let base = self.heap_cursor;
        if (base.as_u64() + grow) - self.layout.heap.base().as_u64() > self.layout.heap.max_size() {
            return Err(VmmError::RegionExhausted);
        }
        map_range(&self.mapper, self.root_phys, base, grow, MapFlags::WRITABLE, alloc)?;
        self.heap_cursor = base + grow;
        Ok((base, grow))
    }

    /// Maps a physical region into the MMIO window, uncached by default.
    ///
    /// `extra_flags` are ORed in on top of `WRITABLE | CACHE_DISABLE`
    /// (pass `None` for plain device memory).
    pub fn map_mmio(
        &mut self,
        phys: PhysAddr,
        size: u64,
        alloc: &mut impl FrameAllocator<Size4KiB>,
        extra_flags: Option<MapFlags>,
    ) -> Result<MmioMapping, VmmError> {
        let aligned_size = size.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
        let virt_base = self
            .mmio_alloc
            .alloc(aligned_size, PAGE_SIZE as u64)
            .map_err(|e| match e {
                RegionError::Exhausted | RegionError::TooFragmented => VmmError::RegionExhausted,
            })?;

        let flags = MapFlags::WRITABLE | MapFlags::CACHE_DISABLE | extra_flags.unwrap_or(MapFlags::empty());
        let page_count = aligned_size / PAGE_SIZE as u64;
        for i in 0..page_count {
            let page = Page::<Size4KiB>::containing_address(virt_base + i * PAGE_SIZE as u64);
            let frame = PhysFrame::<Size4KiB>::containing_address(phys + i * PAGE_SIZE as u64);
            // SAFETY: root is the live kernel pmap root; frame is supplied
            // by the caller as a valid device-memory physical range.
            unsafe {
                self.mapper.map(self.root_phys, page, frame, flags, &mut || {
                    alloc.allocate_frame().expect("page table frame allocation failed")
                })
            }
            .ignore();
        }

        Ok(MmioMapping {
            virt_base,
            size: aligned_size,
        })
    }

    /// Allocates and maps a guarded kernel stack.
    ///
    /// `size` defaults to [`DEFAULT_KERNEL_STACK_SIZE`] when `None`. The
    /// page immediately below the stack is left unmapped as a guard.
    pub fn alloc_kernel_stack(
        &mut self,
        alloc: &mut impl FrameAllocator<Size4KiB>,
        size: Option<u64>,
    ) -> Result<KernelStack, VmmError> {
        let size = size.unwrap_or(DEFAULT_KERNEL_STACK_SIZE);
        let aligned_size = size.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;

        let guard = self.stack_cursor;
        let bottom = guard + PAGE_SIZE as u64;
        if (bottom.as_u64() + aligned_size) - self.layout.stacks.base().as_u64()
            > self.layout.stacks.max_size()
        {
            return Err(VmmError::RegionExhausted);
        }

        map_range(&self.mapper, self.root_phys, bottom, aligned_size, MapFlags::WRITABLE, alloc)?;
        self.stack_cursor = bottom + aligned_size + PAGE_SIZE as u64;

        Ok(KernelStack {
            guard,
            bottom,
            top: bottom + aligned_size,
        })
    }

    /// Translates a kernel virtual address to physical, if mapped.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: root_phys is the live kernel pmap root.
        unsafe { self.mapper.translate_addr(self.root_phys, virt) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::{PageSize, Size2MiB};

    struct NullMapper;

    unsafe impl PageMapper<Size4KiB> for NullMapper {
        unsafe fn map(
            &self,
            _root: PhysAddr,
            page: Page<Size4KiB>,
            _frame: PhysFrame<Size4KiB>,
            _flags: MapFlags,
            _alloc: &mut dyn FnMut() -> PhysFrame<Size4KiB>,
        ) -> crate::mm::mapper::MapFlush {
            crate::mm::mapper::MapFlush::new(page.start_address())
        }

        unsafe fn unmap(
            &self,
            _root: PhysAddr,
            page: Page<Size4KiB>,
        ) -> Result<(PhysFrame<Size4KiB>, crate::mm::mapper::MapFlush), crate::mm::mapper::UnmapError>
        {
            Ok((
                PhysFrame::containing_address(PhysAddr::new_truncate(0)),
                crate::mm::mapper::MapFlush::new(page.start_address()),
            ))
        }

        unsafe fn update_flags(
            &self,
            _root: PhysAddr,
            page: Page<Size4KiB>,
            _flags: MapFlags,
        ) -> Result<crate::mm::mapper::MapFlush, crate::mm::mapper::UnmapError> {
            Ok(crate::mm::mapper::MapFlush::new(page.start_address()))
        }
    }

    unsafe impl PageTranslator for NullMapper {
        unsafe fn translate_addr(&self, _root: PhysAddr, _virt: VirtAddr) -> Option<PhysAddr> {
            None
        }
    }

    struct BumpAlloc {
        next: u64,
    }

    unsafe impl FrameAllocator<Size4KiB> for BumpAlloc {
        fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
            let f = PhysFrame::containing_address(PhysAddr::new_truncate(self.next));
            self.next += Size4KiB::SIZE;
            Some(f)
        }
    }

    #[test]
    fn map_initial_heap_advances_cursor() {
        let mut vmm = Vmm::new(PhysAddr::new_truncate(0), NullMapper, 0x1000_0000_0000, 0x1_0000_0000);
        let mut alloc = BumpAlloc { next: 0x10_0000 };
        let (base, size) = vmm.map_initial_heap(&mut alloc).unwrap();
        assert_eq!(base, vmm.layout().heap.base());
        assert_eq!(size, layout::INITIAL_HEAP_SIZE);
        assert_eq!(vmm.heap_cursor, base + size);
    }

    #[test]
    fn grow_heap_rounds_up_and_continues_from_cursor() {
        let mut vmm = Vmm::new(PhysAddr::new_truncate(0), NullMapper, 0x1000_0000_0000, 0x1_0000_0000);
        let mut alloc = BumpAlloc { next: 0x10_0000 };
        let (initial_base, initial_size) = vmm.map_initial_heap(&mut alloc).unwrap();
        let (grown_base, grown_size) = vmm.grow_heap(1, &mut alloc).unwrap();
        assert_eq!(grown_base, initial_base + initial_size);
        assert_eq!(grown_size, layout::HEAP_GROW_MIN);
    }

    #[test]
    fn kernel_stack_has_guard_below_bottom() {
        let mut vmm = Vmm::new(PhysAddr::new_truncate(0), NullMapper, 0x1000_0000_0000, 0x1_0000_0000);
        let mut alloc = BumpAlloc { next: 0x20_0000 };
        let stack = vmm.alloc_kernel_stack(&mut alloc, Some(0x1000)).unwrap();
        assert_eq!(stack.bottom(), stack.guard() + PAGE_SIZE as u64);
        assert_eq!(stack.top(), stack.bottom() + 0x1000);
    }

    #[test]
    fn second_stack_does_not_overlap_first() {
        let mut vmm = Vmm::new(PhysAddr::new_truncate(0), NullMapper, 0x1000_0000_0000, 0x1_0000_0000);
        let mut alloc = BumpAlloc { next: 0x20_0000 };
        let s1 = vmm.alloc_kernel_stack(&mut alloc, Some(0x1000)).unwrap();
        let s2 = vmm.alloc_kernel_stack(&mut alloc, Some(0x1000)).unwrap();
        assert!(s2.guard().as_u64() >= s1.top().as_u64());
    }

    #[test]
    fn map_mmio_allocates_distinct_windows() {
        let mut vmm = Vmm::new(PhysAddr::new_truncate(0), NullMapper, 0x1000_0000_0000, 0x1_0000_0000);
        let mut alloc = BumpAlloc { next: 0x30_0000 };
        let m1 = vmm
            .map_mmio(PhysAddr::new_truncate(0xFEE0_0000), PAGE_SIZE as u64, &mut alloc, None)
            .unwrap();
        let m2 = vmm
            .map_mmio(PhysAddr::new_truncate(0xFEC0_0000), PAGE_SIZE as u64, &mut alloc, None)
            .unwrap();
        assert_ne!(m1.virt_base(), m2.virt_base());
        assert!(vmm.layout().mmio.contains(m1.virt_base()));
    }
}
