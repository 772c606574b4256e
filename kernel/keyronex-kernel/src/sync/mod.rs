//! Higher-level synchronization primitives.
//!
//! [`keyronex_base::sync`] provides the bare spin lock used before the
//! scheduler exists; everything here assumes an executor is running and can
//! park/wake tasks. [`IrqSpinLock`] is the exception: it is still a spin
//! lock, but one that also disables interrupts, for data shared with
//! interrupt handlers.

mod irq_spinlock;
mod lazylock;
mod lockdep;
mod mutex;
mod rwlock;
mod waitqueue;

#[cfg(test)]
pub(crate) mod test_waker;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use keyronex_base::sync::{SpinLock, SpinLockGuard};
pub use lazylock::LazyLock;
pub use mutex::{Mutex, MutexGuard, MutexLockFuture};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use waitqueue::WaitQueue;
