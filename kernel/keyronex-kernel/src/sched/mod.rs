//! Kernel task scheduler.
//!
//! The executor, ready queues, timer-wheel wakeups, and waker encoding are
//! plain modules of this crate (unlike most of the rest of the kernel, they
//! need no unsafe arch access and are exercised by host-side unit tests).
//! This file adds the cross-CPU glue: the global preemption flag the timer
//! ISR sets, and re-exports for the submodules other code reaches for.

use core::sync::atomic::{AtomicBool, Ordering};

pub use executor::Executor;
pub use task::{Priority, TaskMeta};

use crate::task;

pub mod block_on;
pub mod executor;
pub mod primitives;
pub mod smp;
pub mod timer;
pub mod waker;

/// Returns a reference to the current CPU's executor.
#[inline]
pub fn executor() -> &'static Executor {
    executor::global()
}

/// Set by the timer ISR; cleared by the executor at the top of each batch.
///
/// The executor runs with interrupts disabled while polling a batch of
/// ready tasks, so a timer tick during that window can't preempt it
/// directly — it instead sets this flag, which the poll loop checks between
/// tasks to decide whether to break out and let the CPU halt.
static PREEMPT_PENDING: AtomicBool = AtomicBool::new(false);

/// Requests that the executor yield at its next opportunity.
pub fn set_preempt_pending() {
    PREEMPT_PENDING.store(true, Ordering::Release);
}

/// Returns whether a preemption has been requested since the last clear.
pub fn preempt_pending() -> bool {
    PREEMPT_PENDING.load(Ordering::Acquire)
}

/// Clears the preemption request flag.
pub fn clear_preempt_pending() {
    PREEMPT_PENDING.store(false, Ordering::Release);
}

/// Spawns a task at `Normal` priority on the current CPU's executor.
pub fn spawn(future: impl core::future::Future<Output = ()> + Send + 'static) -> task::TaskId {
    executor().spawn(future)
}

/// Spawns a task at `Critical` priority, which always preempts Normal and
/// Background work. No task of any priority is ever migrated off the CPU
/// it was spawned on.
pub fn spawn_critical(
    future: impl core::future::Future<Output = ()> + Send + 'static,
) -> task::TaskId {
    executor().spawn_with_meta(future, TaskMeta::with_priority(Priority::Critical))
}

/// Spawns a task at `Background` priority, subject to starvation prevention
/// against a steady stream of Normal work.
pub fn spawn_background(
    future: impl core::future::Future<Output = ()> + Send + 'static,
) -> task::TaskId {
    executor().spawn_with_meta(future, TaskMeta::with_priority(Priority::Background))
}

/// Spawns a task with caller-provided metadata (priority, name).
pub fn spawn_with(
    future: impl core::future::Future<Output = ()> + Send + 'static,
    meta: TaskMeta,
) -> task::TaskId {
    executor().spawn_with_meta(future, meta)
}
