//! Kernel thread records.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spinning_top::Spinlock;

use crate::sched::Blocker;
use crate::syscall::SyscallFuture;

use super::context::{FxState, RegisterContext};
use super::Process;

pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Ready,
    Blocked,
    Zombie,
}

/// An execution context, exclusively owned by its parent process. The tid
/// is unique within the process.
pub struct Thread {
    tid: u32,
    process: Weak<Process>,
    state: Spinlock<ThreadState>,
    context: Spinlock<RegisterContext>,
    fx_state: Spinlock<FxState>,
    /// Stack used while this thread runs in the kernel. The trap glue
    /// switches to it on entry.
    #[allow(dead_code)]
    kernel_stack: Box<[u8]>,
    /// The blocking condition currently parked on, if any.
    blocker: Spinlock<Option<Arc<Blocker>>>,
    /// A suspended syscall, re-polled when the thread is woken.
    pending_syscall: Spinlock<Option<SyscallFuture>>,
    fs_base: AtomicU64,
}

impl Thread {
    pub(crate) fn new(process: &Arc<Process>, tid: u32, context: RegisterContext) -> Arc<Thread> {
        Arc::new(Thread {
            tid,
            process: Arc::downgrade(process),
            state: Spinlock::new(ThreadState::Ready),
            context: Spinlock::new(context),
            fx_state: Spinlock::new(FxState::default()),
            kernel_stack: vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice(),
            blocker: Spinlock::new(None),
            pending_syscall: Spinlock::new(None),
            fs_base: AtomicU64::new(0),
        })
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        *self.state.lock() = state;
    }

    pub fn context(&self) -> RegisterContext {
        *self.context.lock()
    }

    pub fn set_context(&self, context: RegisterContext) {
        *self.context.lock() = context;
    }

    pub fn with_context<R>(&self, f: impl FnOnce(&mut RegisterContext) -> R) -> R {
        f(&mut self.context.lock())
    }

    pub fn reset_fx_state(&self) {
        self.fx_state.lock().reset();
    }

    pub fn copy_fx_state_from(&self, other: &Thread) {
        *self.fx_state.lock() = other.fx_state.lock().clone();
    }

    pub(crate) fn set_blocker(&self, blocker: Arc<Blocker>) {
        *self.blocker.lock() = Some(blocker);
    }

    pub(crate) fn clear_blocker(&self) {
        *self.blocker.lock() = None;
    }

    pub fn blocker(&self) -> Option<Arc<Blocker>> {
        self.blocker.lock().clone()
    }

    /// Interrupt an in-progress wait, if any. The blocker is notified and
    /// the parked syscall completes with `EINTR`.
    pub fn interrupt(&self) {
        let blocker = self.blocker.lock().clone();
        if let Some(blocker) = blocker {
            blocker.interrupt();
        }
    }

    pub(crate) fn set_pending_syscall(&self, future: SyscallFuture) {
        *self.pending_syscall.lock() = Some(future);
    }

    pub(crate) fn take_pending_syscall(&self) -> Option<SyscallFuture> {
        self.pending_syscall.lock().take()
    }

    pub fn fs_base(&self) -> u64 {
        self.fs_base.load(Ordering::Acquire)
    }

    pub fn set_fs_base(&self, value: u64) {
        self.fs_base.store(value, Ordering::Release);
    }
}
