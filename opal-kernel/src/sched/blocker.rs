//! The one-shot blocking condition installed on a thread while it waits.
//!
//! Event sources hold (weak) references to blockers and fire them when the
//! condition a thread is waiting for becomes true. Waking is idempotent: a
//! blocked thread leaves the Blocked state exactly once however many wakers
//! race. Any other thread may interrupt a blocked thread, which surfaces as
//! `EINTR` from the blocked syscall.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spinning_top::Spinlock;

use crate::sched;

pub struct Blocker {
    fired: AtomicBool,
    interrupted: AtomicBool,
    /// Threads parked on this blocker, usually one.
    waiting: Spinlock<Vec<(u64, u32)>>,
}

impl Blocker {
    pub fn new() -> Arc<Blocker> {
        Arc::new(Blocker {
            fired: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            waiting: Spinlock::new(Vec::new()),
        })
    }

    /// Fire the condition and make every parked thread runnable.
    pub fn wake(&self) {
        self.fired.store(true, Ordering::Release);
        let waiters = core::mem::take(&mut *self.waiting.lock());
        for (pid, tid) in waiters {
            sched::wake_thread(pid, tid);
        }
    }

    /// Interrupt the wait: the blocked syscall returns `EINTR`.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        let waiters = core::mem::take(&mut *self.waiting.lock());
        for (pid, tid) in waiters {
            sched::wake_thread(pid, tid);
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Clear the fired flag after the consumer observed it.
    pub fn clear(&self) {
        self.fired.store(false, Ordering::Release);
    }

    pub(crate) fn add_waiter(&self, pid: u64, tid: u32) {
        let mut waiting = self.waiting.lock();
        if !waiting.contains(&(pid, tid)) {
            waiting.push((pid, tid));
        }
    }

    pub(crate) fn remove_waiter(&self, pid: u64, tid: u32) {
        self.waiting.lock().retain(|&entry| entry != (pid, tid));
    }
}
