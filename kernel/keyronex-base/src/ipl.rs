//! Interrupt priority levels (IPL).
//!
//! The kernel runs at one of a small number of priority levels at all times.
//! Raising IPL masks interrupt sources at or below the new level on the
//! current CPU; lowering it unmasks them again. Levels are totally ordered:
//! code running at a given level never needs to worry about preemption by
//! anything at the same level or below.
//!
//! Levels are per-CPU. Raising and lowering must nest: a lowered level must
//! match a level previously raised to (or passed through) on the same CPU.
//! The current-CPU lookup is a registrable hook (see [`set_cpu_id_fn`])
//! rather than a direct call into the runtime crate's per-CPU block, since
//! this crate sits below it in the dependency graph; until the hook is
//! registered every CPU resolves to slot 0, which is correct for the BSP
//! and for host tests.

use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

/// Interrupt priority levels, lowest to highest.
///
/// Mirrors the classic NT/BSD-style IPL hierarchy, trimmed to what this
/// kernel's scheduler and device model actually need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Ipl {
    /// Normal thread execution. All interrupts enabled.
    Passive = 0,
    /// Asynchronous procedure calls. Above passive so APC delivery can't
    /// itself be interrupted by another APC.
    Apc = 1,
    /// Dispatcher level. The scheduler, dispatcher objects, and the PFN
    /// and pmap spinlocks all run here. Most of the kernel's own
    /// synchronization happens at this level.
    Dispatch = 2,
    /// Device level, low tier. Slower peripherals.
    Device0 = 3,
    /// Device level, mid tier.
    Device1 = 4,
    /// Device level, high tier. Fast/latency-sensitive peripherals.
    Device2 = 5,
    /// Clock level. The periodic timer tick runs here, above all device
    /// interrupts so timekeeping is never delayed by device work.
    Clock = 6,
    /// High level. Inter-processor interrupts, machine check, NMI-adjacent
    /// work. Nothing may be masked above this.
    High = 7,
}

impl Ipl {
    const COUNT: u8 = 8;

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Ipl::Passive,
            1 => Ipl::Apc,
            2 => Ipl::Dispatch,
            3 => Ipl::Device0,
            4 => Ipl::Device1,
            5 => Ipl::Device2,
            6 => Ipl::Clock,
            _ => Ipl::High,
        }
    }

    /// This level's numeric rank, for comparisons against raw thresholds.
    #[must_use]
    pub fn rank(self) -> u8 {
        self as u8
    }
}

/// Maximum number of CPUs this module tracks IPL for.
///
/// `keyronex-base` cannot depend on the runtime crate's real per-CPU block
/// (wrong direction — the runtime crate depends on this one), so this is
/// a fixed-size table sized to the same bound the runtime crate uses for
/// its own per-CPU storage, indexed through [`set_cpu_id_fn`].
pub const MAX_CPUS: usize = 64;

/// The signature of the current-CPU-id hook.
pub type CpuIdFn = fn() -> u32;

fn default_cpu_id() -> u32 {
    0
}

static CPU_ID_FN: AtomicPtr<()> = AtomicPtr::new(default_cpu_id as *mut ());

/// Registers the function this module calls to learn the current CPU's id.
///
/// Before this is called, every CPU is treated as CPU 0, which is correct
/// for host tests and early boot on the BSP but wrong once APs are
/// running. The runtime kernel crate registers its real, GS-base-backed
/// `current_cpu()` lookup here once GS-base is set up on each CPU (see
/// `keyronex-kernel`'s `arch::cpu_init`).
///
/// # Safety
///
/// The provided function must be callable from any context (including
/// interrupt context) and must return a value less than [`MAX_CPUS`].
pub unsafe fn set_cpu_id_fn(f: CpuIdFn) {
    CPU_ID_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn cpu_id_fn() -> CpuIdFn {
    let ptr = CPU_ID_FN.load(Ordering::Acquire);
    // SAFETY: only valid `CpuIdFn` pointers (or the initial `default_cpu_id`)
    // are ever stored into `CPU_ID_FN`.
    unsafe { core::mem::transmute(ptr) }
}

#[inline]
fn this_cpu() -> usize {
    (cpu_id_fn())() as usize % MAX_CPUS
}

/// Per-CPU current IPL, one slot per CPU.
static CURRENT_IPL: [AtomicU8; MAX_CPUS] = [const { AtomicU8::new(0) }; MAX_CPUS];

/// Returns the current CPU's IPL.
#[must_use]
pub fn current() -> Ipl {
    Ipl::from_u8(CURRENT_IPL[this_cpu()].load(Ordering::Relaxed))
}

/// Raises IPL to `new` on the current CPU, returning the previous level.
///
/// Idempotent: raising to the current level (or below it) is a no-op that
/// simply returns the current level unchanged. It is a logic error to
/// raise to a level below the current one; callers that need to go lower
/// must call [`lower`] instead.
pub fn raise(new: Ipl) -> Ipl {
    let slot = &CURRENT_IPL[this_cpu()];
    let old = Ipl::from_u8(slot.load(Ordering::Relaxed));
    if new.rank() > old.rank() {
        slot.store(new.rank(), Ordering::Relaxed);
    }
    old
}

/// Lowers IPL back to `old`.
///
/// `old` must be less than or equal to the current level; lowering below
/// a dispatch-level boundary drains any deferred procedure calls (DPCs)
/// queued while running above dispatch level.
///
/// # Panics
///
/// Panics (debug builds) if `old` is numerically above the current IPL,
/// since that would mean raising, not lowering.
pub fn lower(old: Ipl) {
    let slot = &CURRENT_IPL[this_cpu()];
    let cur = Ipl::from_u8(slot.load(Ordering::Relaxed));
    debug_assert!(
        old.rank() <= cur.rank(),
        "ipl::lower called with a level above current"
    );
    let crossing_dispatch = cur.rank() > Ipl::Dispatch.rank() && old.rank() <= Ipl::Dispatch.rank();
    slot.store(old.rank(), Ordering::Relaxed);
    if crossing_dispatch {
        crate::dispatch::drain_dpcs();
    }
}

/// Runs `f` with IPL raised to `new`, restoring the previous level
/// afterwards (even on panic-unwind in host tests).
pub fn at<R>(new: Ipl, f: impl FnOnce() -> R) -> R {
    let old = raise(new);
    let r = f();
    lower(old);
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() {
        CURRENT_IPL[this_cpu()].store(0, Ordering::Relaxed);
    }

    #[test]
    fn starts_passive() {
        reset();
        assert_eq!(current(), Ipl::Passive);
    }

    #[test]
    fn raise_then_lower_restores() {
        reset();
        let old = raise(Ipl::Dispatch);
        assert_eq!(old, Ipl::Passive);
        assert_eq!(current(), Ipl::Dispatch);
        lower(old);
        assert_eq!(current(), Ipl::Passive);
    }

    #[test]
    fn raise_is_idempotent_at_same_level() {
        reset();
        raise(Ipl::Dispatch);
        let old = raise(Ipl::Dispatch);
        assert_eq!(old, Ipl::Dispatch);
        assert_eq!(current(), Ipl::Dispatch);
        lower(Ipl::Passive);
    }

    #[test]
    fn raise_ignores_lower_target() {
        reset();
        raise(Ipl::Clock);
        raise(Ipl::Dispatch);
        assert_eq!(current(), Ipl::Clock);
        lower(Ipl::Passive);
    }

    #[test]
    fn nested_at_restores_correctly() {
        reset();
        at(Ipl::Dispatch, || {
            assert_eq!(current(), Ipl::Dispatch);
            at(Ipl::Clock, || {
                assert_eq!(current(), Ipl::Clock);
            });
            assert_eq!(current(), Ipl::Dispatch);
        });
        assert_eq!(current(), Ipl::Passive);
    }

    #[test]
    fn cpu_id_hook_selects_an_independent_slot() {
        reset();
        CURRENT_IPL[1].store(0, Ordering::Relaxed);
        unsafe { set_cpu_id_fn(|| 1) };
        raise(Ipl::Clock);
        assert_eq!(current(), Ipl::Clock);
        assert_eq!(CURRENT_IPL[0].load(Ordering::Relaxed), Ipl::Passive.rank());
        lower(Ipl::Passive);
        unsafe { set_cpu_id_fn(default_cpu_id) };
    }

    #[test]
    fn ordering_is_total() {
        assert!(Ipl::Passive < Ipl::Apc);
        assert!(Ipl::Apc < Ipl::Dispatch);
        assert!(Ipl::Dispatch < Ipl::Device0);
        assert!(Ipl::Clock < Ipl::High);
        assert_eq!(Ipl::COUNT, 8);
    }
}
