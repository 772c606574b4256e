//! CR0/CR2/CR3/CR4 control registers.

use crate::addr::PhysAddr;

bitflags::bitflags! {
    /// CR0 register flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0Flags: u64 {
        /// Protected mode enable.
        const PROTECTED_MODE = 1 << 0;
        /// Write protect.
        const WRITE_PROTECT  = 1 << 16;
        /// Paging enable.
        const PAGING         = 1 << 31;
    }
}

bitflags::bitflags! {
    /// CR4 register flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4Flags: u64 {
        /// Page Size Extensions.
        const PSE  = 1 << 4;
        /// Physical Address Extension.
        const PAE  = 1 << 5;
        /// Page Global Enable.
        const PGE  = 1 << 7;
        /// 57-bit linear addresses (5-level paging).
        const LA57 = 1 << 12;
    }
}

/// CR0 register.
pub struct Cr0;

impl Cr0 {
    /// Reads the current CR0 value.
    #[inline]
    #[must_use]
    pub fn read() -> Cr0Flags {
        let value: u64;
        // SAFETY: reading CR0 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        Cr0Flags::from_bits_truncate(value)
    }

    /// Writes a new value to CR0.
    ///
    /// # Safety
    ///
    /// Changing CR0 flags can affect the CPU's operating mode (paging,
    /// protection) immediately.
    #[inline]
    pub unsafe fn write(flags: Cr0Flags) {
        // SAFETY: caller guarantees the new flags leave the CPU in a
        // consistent state.
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) flags.bits(), options(nostack, preserves_flags));
        }
    }
}

/// CR2 register: the linear address that caused the most recent page fault.
pub struct Cr2;

impl Cr2 {
    /// Reads the faulting linear address from CR2.
    #[inline]
    #[must_use]
    pub fn read() -> u64 {
        let value: u64;
        // SAFETY: reading CR2 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        value
    }
}

/// CR3: the physical address of the current top-level page table.
///
/// Only the frame address is modeled; PCID bits are not used by this
/// kernel's paging setup.
pub struct Cr3;

impl Cr3 {
    /// Reads the current page table root.
    #[inline]
    #[must_use]
    pub fn read() -> PhysAddr {
        let value: u64;
        // SAFETY: reading CR3 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        PhysAddr::new_truncate(value & 0x000F_FFFF_FFFF_F000)
    }

    /// Writes a new page table root, flushing non-global TLB entries.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid, fully populated top-level page table
    /// matching the paging mode currently enabled.
    #[inline]
    pub unsafe fn write(root: PhysAddr) {
        // SAFETY: caller guarantees `root` is a valid page table root.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
        }
    }
}

/// CR4 register.
pub struct Cr4;

impl Cr4 {
    /// Reads the current CR4 value.
    #[inline]
    #[must_use]
    pub fn read() -> Cr4Flags {
        let value: u64;
        // SAFETY: reading CR4 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        Cr4Flags::from_bits_truncate(value)
    }

    /// Writes a new value to CR4.
    ///
    /// # Safety
    ///
    /// Changing CR4 flags can affect the CPU's operating mode (e.g.
    /// paging levels) immediately.
    #[inline]
    pub unsafe fn write(flags: Cr4Flags) {
        // SAFETY: caller guarantees the new flags leave the CPU in a
        // consistent state.
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) flags.bits(), options(nostack, preserves_flags));
        }
    }
}
