//! Interrupt-safe spin lock.
//!
//! Disables interrupts before acquiring the inner spinlock and restores
//! the previous interrupt state on release. This prevents deadlocks when
//! a lock is shared between interrupt handlers and normal kernel code.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spin lock that disables interrupts while held.
pub struct IrqSpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
    /// Diagnostic name, used by lock-ordering debug builds and panic dumps.
    name: &'static str,
    /// IPL / lock-ordering level this lock is acquired at; higher acquires
    /// after lower. Zero for locks that don't participate in level checking.
    level: u8,
}

#[cfg(keyronex_lock_debug)]
static IRQ_LOCK_DEPTH: crate::percpu::CpuLocal<core::sync::atomic::AtomicU32> =
    crate::percpu::CpuLocal::new(
        [const { core::sync::atomic::AtomicU32::new(0) }; crate::config::MAX_CPUS],
    );

/// Number of [`IrqSpinLock`]s currently held on this CPU.
///
/// Used by [`Mutex`](super::Mutex) to forbid blocking lock acquisitions while
/// a spinlock is held, since that would keep interrupts disabled across a
/// potential task yield.
#[cfg(keyronex_lock_debug)]
pub(crate) fn irq_lock_depth() -> u32 {
    IRQ_LOCK_DEPTH.get().load(Ordering::Relaxed)
}

#[cfg(keyronex_lock_debug)]
fn irq_lock_depth_inc() {
    IRQ_LOCK_DEPTH.get().fetch_add(1, Ordering::Relaxed);
}

#[cfg(keyronex_lock_debug)]
fn irq_lock_depth_dec() {
    IRQ_LOCK_DEPTH.get().fetch_sub(1, Ordering::Relaxed);
}

// SAFETY: Same reasoning as SpinLock — atomic ops ensure exclusive access.
unsafe impl<T: Send> Send for IrqSpinLock<T> {}
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    /// Creates a new unlocked `IrqSpinLock`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
            name: "",
            level: 0,
        }
    }

    /// Creates a new unlocked, named `IrqSpinLock` at a given IPL/ordering
    /// level. See [`keyronex_base::sync::SpinLock::leveled`] for the
    /// rationale — `name`/`level` are diagnostic only.
    pub const fn leveled(name: &'static str, level: u8, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
            name,
            level,
        }
    }

    /// Returns this lock's diagnostic name, or `""` if unset.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns this lock's ordering level, or `0` if unset.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Acquires the lock, disabling interrupts first.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        // Save current RFLAGS and disable interrupts.
        let saved_flags = save_flags_and_cli();
        // Interrupts are physically masked above; raising IPL to High keeps
        // the kernel's own IPL bookkeeping (preemption checks, DPC queuing)
        // consistent with what the hardware is actually doing.
        let prev_ipl = keyronex_base::ipl::raise(keyronex_base::ipl::Ipl::High);

        // TTAS spin to acquire.
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                #[cfg(keyronex_lock_debug)]
                irq_lock_depth_inc();
                return IrqSpinLockGuard {
                    lock: self,
                    saved_flags,
                    prev_ipl,
                };
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let saved_flags = save_flags_and_cli();
        let prev_ipl = keyronex_base::ipl::raise(keyronex_base::ipl::Ipl::High);
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            #[cfg(keyronex_lock_debug)]
            irq_lock_depth_inc();
            Some(IrqSpinLockGuard {
                lock: self,
                saved_flags,
                prev_ipl,
            })
        } else {
            // Failed — undo the IPL raise and restore flags.
            keyronex_base::ipl::lower(prev_ipl);
            restore_flags(saved_flags);
            None
        }
    }
}

/// RAII guard that restores interrupt state on drop.
pub struct IrqSpinLockGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    saved_flags: u64,
    /// IPL to restore on release — the level observed just before this
    /// lock raised to [`keyronex_base::ipl::Ipl::High`].
    prev_ipl: keyronex_base::ipl::Ipl,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: The lock is held, so we have exclusive access to the data.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The lock is held, so we have exclusive access to the data.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        #[cfg(keyronex_lock_debug)]
        irq_lock_depth_dec();
        // Lower IPL (draining any DPCs queued while above dispatch level)
        // before restoring the real interrupt-enable flag, so a DPC can't
        // be left queued with interrupts already back on and nothing ever
        // told to look at it again.
        keyronex_base::ipl::lower(self.prev_ipl);
        restore_flags(self.saved_flags);
    }
}

/// !Send — must not be sent across threads (interrupt state is per-CPU).
impl<T> !Send for IrqSpinLockGuard<'_, T> {}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn save_flags_and_cli() -> u64 {
    let flags: u64;
    // SAFETY: Reading RFLAGS and disabling interrupts is safe in kernel mode.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem),
        );
    }
    flags
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn restore_flags(flags: u64) {
    // Only restore the IF bit — push full flags and use popfq.
    if flags & (1 << 9) != 0 {
        // SAFETY: Re-enabling interrupts is safe; we are restoring a previous state.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
#[inline]
fn save_flags_and_cli() -> u64 {
    let flags: u64;
    // SAFETY: Reading DAIF and masking interrupts is safe in kernel mode.
    unsafe {
        core::arch::asm!(
            "mrs {}, DAIF",
            "msr DAIFSet, #0xf",
            out(reg) flags,
            options(nomem),
        );
    }
    flags
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
#[inline]
fn restore_flags(flags: u64) {
    // SAFETY: Restoring DAIF is safe; we are restoring a previous state.
    unsafe {
        core::arch::asm!(
            "msr DAIF, {}",
            in(reg) flags,
            options(nomem, nostack, preserves_flags),
        );
    }
}

#[cfg(not(target_os = "none"))]
#[inline]
fn save_flags_and_cli() -> u64 {
    0
}

#[cfg(not(target_os = "none"))]
#[inline]
fn restore_flags(_flags: u64) {}
