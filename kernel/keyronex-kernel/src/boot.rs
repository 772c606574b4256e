//! Bootloader-agnostic boot information types and kernel entry point.
//!
//! This module defines the [`BootInfo`] trait that abstracts over different bootloaders
//! (Limine, UEFI stub, etc.) and provides a uniform interface for the kernel to access
//! boot-time information such as the memory map, framebuffer, and HHDM offset.

extern crate alloc;
use alloc::vec::Vec;

use crate::addr::{PhysAddr, VirtAddr};

/// The kind of a physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Normal usable RAM.
    Usable,
    /// Reserved by firmware or hardware.
    Reserved,
    /// ACPI tables that can be reclaimed after parsing.
    AcpiReclaimable,
    /// ACPI Non-Volatile Storage -- must not be used.
    AcpiNvs,
    /// Defective physical memory.
    BadMemory,
    /// Memory used by the bootloader, reclaimable after boot.
    BootloaderReclaimable,
    /// Memory occupied by the kernel image and loaded modules.
    KernelAndModules,
    /// Memory-mapped framebuffer region.
    Framebuffer,
}

/// A contiguous physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Physical start address.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// Kind of memory region.
    pub kind: MemoryRegionKind,
}

/// Pixel format of a framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 32-bit RGB (red at lowest byte offset). UEFI `RedGreenBlueReserved8BitPerColor`.
    Rgb32,
    /// 32-bit BGR (blue at lowest byte offset). UEFI `BlueGreenRedReserved8BitPerColor`.
    Bgr32,
    /// Arbitrary bitmask layout described by per-channel size and shift.
    Bitmask {
        /// Number of bits in the red channel.
        red_size: u8,
        /// Bit position of the red channel (from LSB).
        red_shift: u8,
        /// Number of bits in the green channel.
        green_size: u8,
        /// Bit position of the green channel (from LSB).
        green_shift: u8,
        /// Number of bits in the blue channel.
        blue_size: u8,
        /// Bit position of the blue channel (from LSB).
        blue_shift: u8,
    },
}

/// Information about a linear framebuffer.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Virtual address of the framebuffer (HHDM-mapped).
    pub address: VirtAddr,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Bits per pixel.
    pub bpp: u8,
    /// Pixel format.
    pub pixel_format: PixelFormat,
}

/// Physical and virtual base addresses of the loaded kernel image.
#[derive(Debug, Clone, Copy)]
pub struct KernelAddressInfo {
    /// Physical base address of the kernel.
    pub physical_base: PhysAddr,
    /// Virtual base address of the kernel.
    pub virtual_base: VirtAddr,
}

/// The paging mode configured by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// 4-level paging (48-bit virtual address space).
    #[cfg(target_arch = "x86_64")]
    Level4,
    /// 5-level paging with LA57 (57-bit virtual address space).
    #[cfg(target_arch = "x86_64")]
    Level5,

    /// 4-level paging (48-bit virtual address space).
    #[cfg(target_arch = "aarch64")]
    Level4,
    /// 5-level paging (52-bit virtual address space).
    #[cfg(target_arch = "aarch64")]
    Level5,
}

/// Information about the initial ramdisk loaded by the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct InitrdInfo {
    /// Physical address of the initrd in memory.
    pub phys_addr: PhysAddr,
    /// Size of the initrd in bytes.
    pub size: u64,
}

/// Information about a single CPU for SMP bootstrap.
///
/// The `goto_address_ptr` and `extra_argument_ptr` fields point to
/// bootloader-owned memory. Writing the entry function address to
/// `goto_address_ptr` (after writing `extra_argument_ptr`) atomically
/// starts the AP.
#[derive(Debug, Clone, Copy)]
pub struct SmpCpuEntry {
    /// Bootloader-assigned processor ID.
    pub processor_id: u32,
    /// Local APIC ID.
    pub lapic_id: u32,
    /// Pointer to the goto_address field in bootloader-owned memory.
    pub goto_address_ptr: *mut u64,
    /// Pointer to the extra_argument field in bootloader-owned memory.
    pub extra_argument_ptr: *mut u64,
}

// SAFETY: The pointers reference bootloader-owned memory that is accessible
// from any CPU via the HHDM mapping.
unsafe impl Send for SmpCpuEntry {}
unsafe impl Sync for SmpCpuEntry {}

impl SmpCpuEntry {
    /// Starts this AP by writing the extra argument and then the entry address.
    ///
    /// # Safety
    ///
    /// - `entry` must be the address of a valid `extern "C" fn(u64, u64) -> !`.
    /// - `extra` is passed in RSI to the entry function.
    /// - The pointed-to bootloader memory must still be valid and mapped.
    pub unsafe fn start(&self, entry: usize, extra: u64) {
        use core::sync::atomic::{Ordering, fence};
        // SAFETY: Caller guarantees the pointers are still valid.
        unsafe {
            core::ptr::write_volatile(self.extra_argument_ptr, extra);
            fence(Ordering::Release);
            core::ptr::write_volatile(self.goto_address_ptr, entry as u64);
        }
    }
}

/// Bootloader-agnostic boot information.
///
/// Each bootloader stub (Limine, UEFI, etc.) implements this trait by converting
/// its native data structures into the kernel's canonical types before calling
/// [`kernel_init`].
pub trait BootInfo {
    /// Physical memory map, sorted by start address.
    fn memory_map(&self) -> &[MemoryRegion];

    /// HHDM offset: `virtual = physical + hhdm_offset()`.
    fn hhdm_offset(&self) -> u64;

    /// Kernel load addresses (physical and virtual base).
    fn kernel_address(&self) -> KernelAddressInfo;

    /// Active paging mode configured by the bootloader.
    fn paging_mode(&self) -> PagingMode;

    /// All available framebuffers.
    fn framebuffers(&self) -> &[FramebufferInfo];

    /// ACPI RSDP physical address, if available.
    fn rsdp_address(&self) -> Option<PhysAddr>;

    /// Device Tree Blob physical address, if available.
    fn dtb_address(&self) -> Option<PhysAddr>;

    /// Kernel command line, if any.
    fn command_line(&self) -> Option<&str>;

    /// SMBIOS entry point addresses: (32-bit, 64-bit). Either may be `None`.
    fn smbios_address(&self) -> (Option<PhysAddr>, Option<PhysAddr>);

    /// Physical address of the root page table (PML4 on x86_64, TTBR1 value on aarch64).
    fn page_table_root(&self) -> PhysAddr;

    /// Initial ramdisk (CPIO archive), if loaded by the bootloader.
    fn initrd(&self) -> Option<InitrdInfo>;

    /// SMP CPU entries for AP bootstrap. Empty if single-processor.
    fn smp_cpus(&self) -> &[SmpCpuEntry];

    /// BSP Local APIC ID (x86_64).
    fn bsp_lapic_id(&self) -> u32;
}

/// A concrete container for boot information, populated by a bootloader stub.
pub struct BootInfoData {
    /// Physical memory map.
    pub memory_map: Vec<MemoryRegion>,
    /// HHDM offset.
    pub hhdm_offset: u64,
    /// Kernel load addresses.
    pub kernel_address: KernelAddressInfo,
    /// Active paging mode.
    pub paging_mode: PagingMode,
    /// Available framebuffers.
    pub framebuffers: Vec<FramebufferInfo>,
    /// ACPI RSDP physical address.
    pub rsdp_address: Option<PhysAddr>,
    /// DTB physical address.
    pub dtb_address: Option<PhysAddr>,
    /// Kernel command line.
    pub command_line: Option<&'static str>,
    /// SMBIOS 32-bit entry point address.
    pub smbios_32: Option<PhysAddr>,
    /// SMBIOS 64-bit entry point address.
    pub smbios_64: Option<PhysAddr>,
    /// Physical address of the root page table (PML4 on x86_64, TTBR1 value on aarch64).
    pub page_table_root: PhysAddr,
    /// Initial ramdisk information, if loaded by the bootloader.
    pub initrd: Option<InitrdInfo>,
    /// SMP CPU entries for AP bootstrap.
    pub smp_cpus: Vec<SmpCpuEntry>,
    /// BSP Local APIC ID.
    pub bsp_lapic_id: u32,
}

impl BootInfo for BootInfoData {
    fn memory_map(&self) -> &[MemoryRegion] {
        self.memory_map.as_slice()
    }

    fn hhdm_offset(&self) -> u64 {
        self.hhdm_offset
    }

    fn kernel_address(&self) -> KernelAddressInfo {
        self.kernel_address
    }

    fn paging_mode(&self) -> PagingMode {
        self.paging_mode
    }

    fn framebuffers(&self) -> &[FramebufferInfo] {
        self.framebuffers.as_slice()
    }

    fn rsdp_address(&self) -> Option<PhysAddr> {
        self.rsdp_address
    }

    fn dtb_address(&self) -> Option<PhysAddr> {
        self.dtb_address
    }

    fn command_line(&self) -> Option<&str> {
        self.command_line
    }

    fn smbios_address(&self) -> (Option<PhysAddr>, Option<PhysAddr>) {
        (self.smbios_32, self.smbios_64)
    }

    fn page_table_root(&self) -> PhysAddr {
        self.page_table_root
    }

    fn initrd(&self) -> Option<InitrdInfo> {
        self.initrd
    }

    fn smp_cpus(&self) -> &[SmpCpuEntry] {
        self.smp_cpus.as_slice()
    }

    fn bsp_lapic_id(&self) -> u32 {
        self.bsp_lapic_id
    }
}

/// Kernel entry point, called by every bootloader stub.
///
/// The boot stub constructs a [`BootInfo`] implementation from its native data,
/// then calls this function. Static dispatch ensures zero overhead.
pub fn kernel_init(boot_info: &impl BootInfo) -> ! {
    // 1. Arch-specific CPU init (GDT, IDT, early exception handlers).
    crate::arch::cpu_init();

    // 2. Initialize HHDM global offset.
    crate::mm::hhdm::init(boot_info.hhdm_offset());
    crate::kinfo!("HHDM initialized at offset {:#x}", boot_info.hhdm_offset());

    // 3. Physical page-frame database: bitmap allocator over the firmware
    //    memory map, the base of every PFN entry this core hands out.
    crate::mm::pmm::init(boot_info);
    crate::mm::pmm::with_pmm(|pmm| {
        let free = pmm.free_frames();
        let total = pmm.total_frames();
        crate::kinfo!(
            "PFN database: {} MiB free / {} MiB total",
            free * 4 / 1024,
            total * 4 / 1024
        );
    });

    // 4. Kernel virtual memory manager (pmap root, kernel map layout).
    crate::mm::vmm::init(boot_info);

    // 4b. Allocate a guarded kernel stack for the BSP (replaces the early BSS stack).
    {
        use crate::mm::pmm::BitmapFrameAllocRef;
        crate::mm::pmm::with_pmm(|pmm| {
            let mut alloc = BitmapFrameAllocRef(pmm);
            crate::mm::vmm::with_vmm(|vmm| {
                let stack = vmm
                    .alloc_kernel_stack(&mut alloc, None)
                    .expect("failed to allocate guarded kernel stack");
                crate::kinfo!(
                    "Guarded kernel stack: {:#x}..{:#x} (guard at {:#x})",
                    stack.bottom().as_u64(),
                    stack.top().as_u64(),
                    stack.guard().as_u64(),
                );
                // SAFETY: The stack was just allocated and mapped, and no
                // interrupt or syscall uses the old stack between these
                // stores (interrupts are still disabled).
                unsafe {
                    crate::percpu::set_kernel_rsp(stack.top().as_u64());
                    crate::arch::x86_64::gdt::set_tss_rsp0(stack.top().as_u64());
                }
            });
        });
    }

    // 5. Kernel heap.
    crate::mm::heap::init();
    crate::kinfo!("Heap allocator initialized");

    // 6. Full logger (replaces early serial-only printing).
    crate::log::init_logger();

    // 7. Arch-specific platform bring-up (interrupt controllers, platform
    //    timer, anything the periodic tick and IPI delivery depend on).
    //    Device enumeration and driver probing are outside this core's
    //    scope; a platform integration built on top of it performs them
    //    before calling further into the executive core.
    crate::arch::platform_init(boot_info);

    crate::kinfo!("Keyronex executive core initialized.");

    // 8. Cross-CPU wakeup IPI, then boot Application Processors. Every AP
    //    enters the scheduler's idle loop on its own runqueue.
    crate::sched::smp::init();
    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::smp::boot_aps(boot_info);

    // 9. Per-CPU executor state (runqueue, DPC draining) initializes itself
    //    lazily on first access; kick off the remaining arch-specific tasks.
    crate::arch::spawn_platform_tasks();

    // 10. Root namecache + VFS. A platform integration mounts real
    //     filesystems on top; here only the root entry and its backing
    //     VFS instance exist, consistent with filesystem drivers being
    //     external collaborators.
    crate::fs::vfs::init();

    // 11. Enable BSP interrupts now that the IDT, LAPIC, I/O APIC, per-CPU
    //     state and SMP are all initialized.
    // SAFETY: every subsystem an interrupt handler can touch is initialized.
    unsafe { crate::arch::x86_64::instructions::interrupts::enable() };
    crate::kinfo!("BSP interrupts enabled");

    // 12. Run the executor — drives the idle loop and every spawned task
    //     on this CPU, picking up whatever the reschedule IPI or hardclock
    //     hands it.
    crate::sched::executor().run();
}
