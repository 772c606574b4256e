//! Async scheduling primitives — kernel glue.
//!
//! Small `Future`s used by tasks to cooperate with the executor: yielding a
//! turn, and sleeping against the timer wheel.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

/// Yields control back to the executor once, then resumes on the next poll.
///
/// Used by tasks that want to give other ready tasks a turn without
/// registering a timer wakeup.
pub async fn yield_now() {
    YieldNow { yielded: false }.await;
}

struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Sleeps for at least `ticks` timer ticks (1 tick = 1ms at 1kHz).
pub async fn sleep_ticks(ticks: u64) {
    let deadline = crate::time::Time::timer_ticks() + ticks;
    SleepFuture { deadline }.await;
}

/// Sleeps for at least `ms` milliseconds.
pub async fn sleep_ms(ms: u64) {
    sleep_ticks(ms).await;
}

struct SleepFuture {
    deadline: u64,
}

impl Future for SleepFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if crate::time::Time::timer_ticks() >= self.deadline {
            Poll::Ready(())
        } else {
            crate::sched::timer::register_sleep_waker(self.deadline, cx.waker().clone());
            Poll::Pending
        }
    }
}
