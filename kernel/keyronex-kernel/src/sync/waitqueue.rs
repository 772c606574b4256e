//! Lock-free single-waiter-slot registration used by [`Mutex`](super::Mutex)
//! and [`RwLock`](super::RwLock) to park the current task without busy-waiting.
//!
//! This is deliberately not a full intrusive wait list: it holds a small
//! inline array of wakers, degrading callers to a self-wake (spin-poll) if
//! every slot is occupied. Dispatcher-level blocking (threads, not tasks)
//! goes through the dispatcher wait blocks instead; see `sched::dispatch`.

use core::task::Waker;

use keyronex_base::sync::SpinLock;

/// Number of inline waker slots before registration degrades to self-wake.
const SLOTS: usize = 4;

/// A small queue of task wakers, woken in FIFO order.
pub struct WaitQueue {
    slots: SpinLock<[Option<Waker>; SLOTS]>,
}

impl WaitQueue {
    /// Creates an empty wait queue.
    pub const fn new() -> Self {
        Self {
            slots: SpinLock::new([None, None, None, None]),
        }
    }

    /// Registers `waker` in the first free slot.
    ///
    /// Returns `false` if every slot was occupied; the caller should
    /// self-wake to avoid a missed wakeup.
    pub fn register_waker(&self, waker: &Waker) -> bool {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            match slot {
                Some(existing) if existing.will_wake(waker) => return true,
                None => {
                    *slot = Some(waker.clone());
                    return true;
                }
                _ => {}
            }
        }
        false
    }

    /// Wakes and removes a single registered waker, if any.
    pub fn wake_one(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if let Some(waker) = slot.take() {
                waker.wake();
                return;
            }
        }
    }

    /// Wakes and removes every registered waker.
    pub fn wake_all(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if let Some(waker) = slot.take() {
                waker.wake();
            }
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::test_waker::{counting_waker, noop_waker};
    use std::sync::atomic::Ordering as StdOrdering;

    #[test]
    fn register_and_wake_one() {
        let q = WaitQueue::new();
        let (waker, count) = counting_waker();
        assert!(q.register_waker(&waker));
        q.wake_one();
        assert_eq!(count.load(StdOrdering::SeqCst), 1);
    }

    #[test]
    fn wake_one_empty_is_noop() {
        let q = WaitQueue::new();
        q.wake_one();
    }

    #[test]
    fn fills_then_degrades() {
        let q = WaitQueue::new();
        let w = noop_waker();
        for _ in 0..SLOTS {
            assert!(q.register_waker(&w));
        }
        assert!(!q.register_waker(&w));
    }

    #[test]
    fn wake_all_drains_every_slot() {
        let q = WaitQueue::new();
        let (w1, c1) = counting_waker();
        let (w2, c2) = counting_waker();
        q.register_waker(&w1);
        q.register_waker(&w2);
        q.wake_all();
        assert_eq!(c1.load(StdOrdering::SeqCst), 1);
        assert_eq!(c2.load(StdOrdering::SeqCst), 1);
    }
}
