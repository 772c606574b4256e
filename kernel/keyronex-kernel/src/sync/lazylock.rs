//! A `no_std` lazily-initialized cell, usable inside `static` items.
//!
//! Used for per-CPU state that can't be built with a `const fn` (the
//! executor's ready queues use heap-backed collections) but still needs to
//! live in a `static [T; MAX_CPUS]` array touched from multiple CPUs.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// A value that is computed on first access and cached thereafter.
///
/// `F` must be a zero-sized or `Copy` initializer (typically a bare `fn()
/// -> T`), since it is stored alongside the value for the lifetime of the
/// cell and called at most once.
pub struct LazyLock<T, F = fn() -> T> {
    state: AtomicU8,
    init: UnsafeCell<Option<F>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: access to `init`/`value` is gated by the `state` state machine,
// which only ever lets one CPU run the initializer and only exposes `value`
// once it is `READY`. `T: Sync` is required because, once ready, the value
// is shared across every CPU that derefs this cell.
unsafe impl<T: Sync, F> Sync for LazyLock<T, F> {}

impl<T, F: FnOnce() -> T> LazyLock<T, F> {
    /// Creates a `LazyLock` that will call `init` on first access.
    pub const fn new(init: F) -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            init: UnsafeCell::new(Some(init)),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Forces evaluation, returning a reference to the initialized value.
    pub fn force(&self) -> &T {
        loop {
            match self.state.compare_exchange(
                EMPTY,
                INITIALIZING,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // SAFETY: we are the only caller that won the CAS out of
                    // EMPTY, so we have exclusive access to `init`/`value`.
                    let f = unsafe { (*self.init.get()).take() }
                        .expect("LazyLock initializer missing after winning init race");
                    let value = f();
                    unsafe { (*self.value.get()).write(value) };
                    self.state.store(READY, Ordering::Release);
                    break;
                }
                Err(READY) => break,
                Err(_) => core::hint::spin_loop(),
            }
        }
        // SAFETY: state is READY, so `value` was written above (by this CPU
        // or another) and is never mutated again.
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T, F: FnOnce() -> T> Deref for LazyLock<T, F> {
    type Target = T;

    fn deref(&self) -> &T {
        self.force()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static CALLS: AtomicU32 = AtomicU32::new(0);

    fn make_value() -> u32 {
        CALLS.fetch_add(1, Ordering::Relaxed);
        42
    }

    #[test]
    fn initializes_once_and_caches() {
        let lazy: LazyLock<u32> = LazyLock::new(make_value);
        assert_eq!(*lazy, 42);
        assert_eq!(*lazy, 42);
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    }
}
