//! Synchronization primitives for the kernel.
//!
//! Provides [`SpinLock`] and [`LazyLock`], suitable for use in `static`
//! items and usable before any allocator or scheduler is available.
//! Blocking synchronization for tasks (mutex, events, semaphores) lives
//! in [`crate::dispatch`] instead, built on top of these.

mod lazy;
mod spinlock;

#[cfg(test)]
pub(crate) mod test_waker;

pub use lazy::LazyLock;
pub use spinlock::{SpinLock, SpinLockGuard};
