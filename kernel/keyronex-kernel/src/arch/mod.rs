//! Architecture-specific modules and uniform facade.

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

// --- Arch facade: uniform API re-exported from the active arch ---

/// Architecture-specific CPU initialization (GDT+IDT on x86_64, exception vectors on aarch64).
pub fn cpu_init() {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { x86_64::gdt::init() };
        unsafe { x86_64::idt::init() };
        unsafe { crate::percpu::init_gs_base() };
    }
    #[cfg(target_arch = "aarch64")]
    {
        aarch64::cpu_init();
    }

    // One-time registration: `ipl` calls back into this crate's real,
    // GS-base-backed (or per-arch equivalent) per-CPU id to index its IPL
    // table. A single dynamic hook suffices for every CPU — each AP's
    // `current_cpu()` already resolves to its own block once its own
    // per-CPU bring-up has run.
    unsafe {
        keyronex_base::ipl::set_cpu_id_fn(|| crate::percpu::current_cpu().get_cpu_id().as_u32());
    }
}

/// Architecture-specific platform initialization: interrupt controllers
/// and the platform timer, just enough hardware bring-up for the IPL
/// ladder and the periodic tick to function.
///
/// Device enumeration and driver matching (PCI, bus trees, driver
/// registries) are the platform integration's job, not the executive
/// core's; they run, if at all, after this returns.
pub fn platform_init(boot_info: &impl crate::boot::BootInfo) {
    #[cfg(target_arch = "x86_64")]
    {
        x86_64::acpi::init(boot_info.rsdp_address());
    }
    #[cfg(target_arch = "aarch64")]
    {
        aarch64::platform_init(boot_info);
    }
}

/// Spawn arch-specific async tasks.
///
/// The serial echo task is now spawned by the serial driver during probe
/// via [`KernelServices::spawn_task`]. This function handles any remaining
/// arch-specific platform tasks.
pub fn spawn_platform_tasks() {
    #[cfg(target_arch = "aarch64")]
    {
        aarch64::spawn_platform_tasks();
    }
}

/// Arch-uniform interrupt facade.
pub mod interrupts {
    #[cfg(target_arch = "aarch64")]
    pub use super::aarch64::interrupts::*;
    #[cfg(target_arch = "x86_64")]
    pub use super::x86_64::interrupts::*;
}
