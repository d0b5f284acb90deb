//! `park_until`: the single suspension primitive.
//!
//! Blocking syscall handlers build a future with a predicate, a blocker the
//! relevant event source will fire, and an optional deadline. Each poll
//! re-evaluates the predicate; a pending poll registers the current thread
//! on the blocker (and deadline) so the scheduler wakes it exactly when the
//! predicate can have turned true, the wait is interrupted, or the deadline
//! passes.

use alloc::sync::Arc;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use crate::sched::{self, Blocker};
use crate::time;

pub enum WaitOutcome<T> {
    Complete(T),
    Interrupted,
    TimedOut,
}

pub struct ParkUntil<F> {
    blocker: Arc<Blocker>,
    deadline_us: Option<u64>,
    deadline_armed: bool,
    predicate: F,
}

pub fn park_until<T, F>(blocker: Arc<Blocker>, deadline_us: Option<u64>, predicate: F) -> ParkUntil<F>
where
    F: FnMut() -> Option<T> + Send + Unpin,
{
    ParkUntil {
        blocker,
        deadline_us,
        deadline_armed: false,
        predicate,
    }
}

impl<T, F> Future for ParkUntil<F>
where
    F: FnMut() -> Option<T> + Send + Unpin,
{
    type Output = WaitOutcome<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<WaitOutcome<T>> {
        let this = self.get_mut();

        if let Some(value) = (this.predicate)() {
            sched::detach_current(&this.blocker);
            return Poll::Ready(WaitOutcome::Complete(value));
        }
        if this.blocker.was_interrupted() {
            sched::detach_current(&this.blocker);
            return Poll::Ready(WaitOutcome::Interrupted);
        }
        if let Some(deadline) = this.deadline_us {
            if time::uptime_us() >= deadline {
                sched::detach_current(&this.blocker);
                return Poll::Ready(WaitOutcome::TimedOut);
            }
        }

        let deadline = if this.deadline_armed {
            None
        } else {
            this.deadline_armed = true;
            this.deadline_us
        };
        sched::block_current_on(&this.blocker, deadline);

        // Re-check after registration so a wake that raced the first check
        // cannot be lost.
        if let Some(value) = (this.predicate)() {
            sched::detach_current(&this.blocker);
            return Poll::Ready(WaitOutcome::Complete(value));
        }
        if this.blocker.was_interrupted() {
            sched::detach_current(&this.blocker);
            return Poll::Ready(WaitOutcome::Interrupted);
        }

        Poll::Pending
    }
}
