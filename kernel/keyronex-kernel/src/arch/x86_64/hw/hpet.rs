//! HPET (High Precision Event Timer) driver.
//!
//! Used as a calibration reference for the Local APIC timer and, once
//! enabled, as the global [`crate::time`] tick source.

use crate::addr::VirtAddr;

const REG_CAPABILITIES: u64 = 0x000;
const REG_CONFIG: u64 = 0x010;
const REG_MAIN_COUNTER: u64 = 0x0F0;

const CONFIG_ENABLE: u64 = 1 << 0;

/// HPET driver using MMIO register access.
pub struct Hpet {
    base: VirtAddr,
    period_fs: u64,
}

impl Hpet {
    /// Creates a new HPET driver and reads the counter period from the
    /// capabilities register.
    ///
    /// # Safety
    ///
    /// `virt_base` must be a valid mapping of the HPET MMIO region.
    pub unsafe fn new(virt_base: VirtAddr) -> Self {
        // SAFETY: `virt_base` is valid per the caller's contract.
        let caps = unsafe {
            core::ptr::read_volatile((virt_base.as_u64() + REG_CAPABILITIES) as *const u64)
        };
        let period_fs = caps >> 32;
        Self {
            base: virt_base,
            period_fs,
        }
    }

    /// Enables the main counter.
    pub fn enable(&self) {
        let cfg = self.read_reg(REG_CONFIG);
        self.write_reg(REG_CONFIG, cfg | CONFIG_ENABLE);
    }

    /// Disables the main counter.
    pub fn disable(&self) {
        let cfg = self.read_reg(REG_CONFIG);
        self.write_reg(REG_CONFIG, cfg & !CONFIG_ENABLE);
    }

    /// Returns the counter tick period in femtoseconds.
    pub fn period_fs(&self) -> u64 {
        self.period_fs
    }

    /// Returns the counter frequency in Hz.
    pub fn frequency_hz(&self) -> u64 {
        if self.period_fs == 0 {
            0
        } else {
            1_000_000_000_000_000 / self.period_fs
        }
    }

    /// Returns the number of comparators implemented (bits 8:12 of capabilities).
    pub fn num_comparators(&self) -> u8 {
        // SAFETY: `self.base` is valid per the `new` contract.
        let caps = unsafe {
            core::ptr::read_volatile((self.base.as_u64() + REG_CAPABILITIES) as *const u64)
        };
        (((caps >> 8) & 0x1F) + 1) as u8
    }

    /// Returns the current main counter value.
    pub fn counter(&self) -> u64 {
        self.read_reg(REG_MAIN_COUNTER)
    }

    /// Busy-waits for approximately `ms` milliseconds using the main counter.
    pub fn busy_wait_ms(&self, ms: u64) {
        if self.period_fs == 0 {
            return;
        }
        let ticks = (ms * 1_000_000_000_000) / self.period_fs;
        let start = self.counter();
        while self.counter().wrapping_sub(start) < ticks {
            core::hint::spin_loop();
        }
    }

    #[inline]
    fn read_reg(&self, reg: u64) -> u64 {
        // SAFETY: The caller of `Hpet::new` guarantees `self.base` points to a
        // valid HPET MMIO region.
        unsafe { core::ptr::read_volatile((self.base.as_u64() + reg) as *const u64) }
    }

    #[inline]
    fn write_reg(&self, reg: u64, value: u64) {
        // SAFETY: See `read_reg`.
        unsafe { core::ptr::write_volatile((self.base.as_u64() + reg) as *mut u64, value) }
    }
}
