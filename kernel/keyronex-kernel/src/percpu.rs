//! Per-CPU state foundation (SMP-ready).
//!
//! Provides a per-CPU data structure that holds CPU-local state such as
//! the kernel RSP, APIC ID, and CPU ID. Each CPU accesses its own instance
//! via `GS:[0]` self-pointer. The BSP uses a static instance; APs allocate
//! theirs on the heap during bootstrap.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

/// A logical CPU identifier, stable for the lifetime of the boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// Wraps a raw CPU index.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw CPU index.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Dedicated stack size for early boot, before a guarded kernel stack exists.
const EARLY_STACK_SIZE: usize = 16384;

#[repr(align(16))]
struct AlignedStack([u8; EARLY_STACK_SIZE]);

/// Early-boot kernel stack (BSP only). Replaced by a guarded, VMM-allocated
/// stack once the VMM is initialized; see `set_kernel_rsp`.
static mut EARLY_STACK: AlignedStack = AlignedStack([0; EARLY_STACK_SIZE]);

/// Per-CPU data structure.
///
/// `#[repr(C)]` gives deterministic field offsets for access via the GS-base
/// self-pointer pattern:
/// - offset  0: `self_ptr`
/// - offset  8: `kernel_rsp`
/// - offset 16: `cpu_id`
/// - offset 20: `apic_id`
/// - offset 21: `initialized`
pub struct PerCpu {
    /// Self-pointer for `GS:[0]` access (offset 0). Set during init.
    pub self_ptr: u64,
    /// Kernel stack pointer this CPU should use for interrupt/exception entry.
    pub kernel_rsp: u64,
    /// Logical CPU ID (0 for the bootstrap processor).
    pub cpu_id: AtomicU32,
    /// Local APIC ID.
    pub apic_id: AtomicU8,
    initialized: AtomicBool,
}

impl PerCpu {
    /// Creates a new uninitialized `PerCpu`.
    pub const fn new() -> Self {
        Self {
            self_ptr: 0,
            kernel_rsp: 0,
            cpu_id: AtomicU32::new(0),
            apic_id: AtomicU8::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    /// Initializes this per-CPU instance.
    pub fn init(&self, cpu_id: CpuId, apic_id: u8) {
        self.cpu_id.store(cpu_id.as_u32(), Ordering::Relaxed);
        self.apic_id.store(apic_id, Ordering::Relaxed);
        self.initialized.store(true, Ordering::Release);
    }

    /// Returns the CPU ID.
    pub fn get_cpu_id(&self) -> CpuId {
        CpuId::new(self.cpu_id.load(Ordering::Relaxed))
    }

    /// Returns the APIC ID.
    pub fn get_apic_id(&self) -> u8 {
        self.apic_id.load(Ordering::Relaxed)
    }

    /// Returns whether this instance has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

impl Default for PerCpu {
    fn default() -> Self {
        Self::new()
    }
}

/// BSP per-CPU data (single static instance for BSP).
static mut BSP_PERCPU: PerCpu = PerCpu::new();

/// Number of online CPUs.
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Returns the number of online CPUs.
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Sets the number of online CPUs.
pub fn set_cpu_count(count: u32) {
    CPU_COUNT.store(count, Ordering::Release);
}

/// Returns a reference to the current CPU's per-CPU data.
///
/// Reads the self-pointer from `GS:[0]`, which was set during CPU init.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub fn current_cpu() -> &'static PerCpu {
    unsafe {
        let ptr: u64;
        // SAFETY: GS:[0] holds the self_ptr field set by init_gs_base, valid
        // for the lifetime of the running kernel.
        core::arch::asm!("mov {}, gs:[0]", out(reg) ptr, options(readonly, nostack));
        &*(ptr as *const PerCpu)
    }
}

/// Host/non-x86_64 fallback: always the BSP instance.
#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
pub fn current_cpu() -> &'static PerCpu {
    // SAFETY: single-threaded host test harness; no concurrent access.
    unsafe { &*core::ptr::addr_of!(BSP_PERCPU) }
}

/// Initializes GS-base MSRs to point to the BSP per-CPU data.
///
/// # Safety
///
/// Must be called after GDT init and before any interrupt handler that
/// reads `GS:[0]` can fire.
#[cfg(target_arch = "x86_64")]
pub unsafe fn init_gs_base() {
    use crate::arch::x86_64::registers::model_specific::{IA32_GS_BASE, IA32_KERNEL_GS_BASE};

    let percpu_addr = core::ptr::addr_of!(BSP_PERCPU) as u64;
    let stack_top = core::ptr::addr_of!(EARLY_STACK) as u64 + EARLY_STACK_SIZE as u64;

    // SAFETY: BSP_PERCPU and EARLY_STACK are module-level statics; the caller
    // guarantees no interrupt relying on GS:[0] has fired yet. GS_BASE and
    // KERNEL_GS_BASE both point here so swapgs is a no-op in ring 0.
    unsafe {
        let percpu_ptr = core::ptr::addr_of_mut!(BSP_PERCPU);
        (*percpu_ptr).self_ptr = percpu_addr;
        (*percpu_ptr).kernel_rsp = stack_top;

        IA32_GS_BASE.write(percpu_addr);
        IA32_KERNEL_GS_BASE.write(percpu_addr);
    }

    crate::kdebug!(
        "GS base initialized: percpu={:#x}, kernel_rsp={:#x}",
        percpu_addr,
        stack_top
    );
}

/// Maximum supported CPUs.
pub use crate::config::MAX_CPUS;

/// CPU-local storage. Wraps `[T; MAX_CPUS]`, indexed by current CPU ID.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Creates a new `CpuLocal` wrapping the given array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns a reference to the current CPU's instance.
    pub fn get(&self) -> &T {
        &self.data[current_cpu().get_cpu_id().as_u32() as usize]
    }

    /// Returns a reference to a specific CPU's instance.
    pub fn get_for(&self, cpu_id: CpuId) -> &T {
        &self.data[cpu_id.as_u32() as usize]
    }
}

// SAFETY: each CPU only accesses its own slot by construction of `get()`.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send> Sync for CpuLocal<T> {}

/// Returns the early-boot kernel RSP (top of the static BSS stack).
/// Used during TSS initialization before the guarded stack is allocated.
pub fn early_kernel_rsp() -> u64 {
    core::ptr::addr_of!(EARLY_STACK) as u64 + EARLY_STACK_SIZE as u64
}

/// Updates the stored kernel RSP in the current per-CPU data.
///
/// # Safety
///
/// Must only be called when it is safe to change the interrupt-entry stack.
pub unsafe fn set_kernel_rsp(rsp: u64) {
    // SAFETY: BSP_PERCPU is a module-level static; the caller guarantees
    // it is safe to retarget the interrupt-entry stack.
    unsafe {
        let percpu_ptr = core::ptr::addr_of_mut!(BSP_PERCPU);
        (*percpu_ptr).kernel_rsp = rsp;
    }
}
