//! Thread scheduling and CPU dispatch.
//!
//! Multi-CPU aware: each CPU has a local current-thread pointer fed from a
//! single global run queue. Blocked threads leave the queue entirely; an
//! event firing their [`Blocker`] puts them back. A thread suspended inside
//! a syscall keeps the suspended future on its record, and
//! [`service_thread`] re-polls it once the thread is runnable again.

pub mod blocker;
pub mod deadline;
pub mod park;

pub use blocker::Blocker;
pub use park::{park_until, WaitOutcome};

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::future::Future;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use log::warn;
use spinning_top::RwSpinlock;

use crate::platform;
use crate::process::{Process, RegisterContext, Thread, ThreadState};
use crate::time;

use deadline::DeadlineTracker;

/// Signal mask bit for a process transitioning to Zombie.
pub const PROCESS_EVENT_EXIT: u32 = 1;

pub struct Scheduler {
    processes: BTreeMap<u64, Arc<Process>>,
    /// Global run queue of (pid, tid), fed to every CPU.
    ready: VecDeque<(u64, u32)>,
    /// Per-CPU current thread.
    current: Vec<Option<(u64, u32)>>,
    deadlines: DeadlineTracker,
    next_pid: u64,
    /// The process orphans are reparented to.
    init_pid: Option<u64>,
}

static SCHEDULER: RwSpinlock<Option<Scheduler>> = RwSpinlock::new(None);

pub fn init() {
    let mut current = Vec::new();
    current.resize(platform::cpu_count().max(1), None);
    *SCHEDULER.write() = Some(Scheduler {
        processes: BTreeMap::new(),
        ready: VecDeque::new(),
        current,
        deadlines: DeadlineTracker::new(),
        next_pid: 1,
        init_pid: None,
    });
}

/// Invariant: the scheduler is initialised during boot before any syscall
/// or process operation can run.
fn with<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let mut guard = SCHEDULER.write();
    let scheduler = guard.as_mut().expect("scheduler not initialised");
    f(scheduler)
}

/// Create a process record. The new process has no threads until
/// [`spawn_thread`] or the loader adds one, and is not linked into the
/// parent's child list; callers decide that.
pub fn create_process(name: &str, parent: Option<&Arc<Process>>) -> Arc<Process> {
    let parent_weak = parent.map(Arc::downgrade).unwrap_or_else(Weak::new);
    with(|s| {
        let pid = s.next_pid;
        s.next_pid += 1;
        let process = Process::new(pid, name, parent_weak);
        s.processes.insert(pid, process.clone());
        if s.init_pid.is_none() {
            s.init_pid = Some(pid);
        }
        process
    })
}

pub fn find_process(pid: u64) -> Option<Arc<Process>> {
    let guard = SCHEDULER.read();
    let scheduler = guard.as_ref()?;
    scheduler.processes.get(&pid).cloned()
}

/// The lowest live pid strictly greater than `pid`.
pub fn next_pid_after(pid: u64) -> Option<u64> {
    let guard = SCHEDULER.read();
    let scheduler = guard.as_ref()?;
    scheduler
        .processes
        .range(pid + 1..)
        .next()
        .map(|(&next, _)| next)
}

pub fn init_process() -> Option<Arc<Process>> {
    let init_pid = {
        let guard = SCHEDULER.read();
        guard.as_ref()?.init_pid?
    };
    find_process(init_pid)
}

/// Make a thread runnable and queue it.
pub fn start_thread(thread: &Arc<Thread>) {
    let Some(process) = thread.process() else {
        return;
    };
    thread.set_state(ThreadState::Ready);
    with(|s| s.ready.push_back((process.pid(), thread.tid())));
}

/// Queue a process's main thread for its first dispatch.
pub fn start_process(process: &Arc<Process>) {
    if let Some(main) = process.main_thread() {
        start_thread(&main);
    }
}

/// Create and start a thread in `process` with the given user entry point
/// and stack pointer. Returns the new tid.
pub fn spawn_thread(process: &Arc<Process>, entry: u64, stack: u64) -> u32 {
    let thread = process.add_thread(RegisterContext::new_user(entry, stack));
    start_thread(&thread);
    thread.tid()
}

pub fn current_ids() -> Option<(u64, u32)> {
    let cpu = platform::cpu_id();
    let guard = SCHEDULER.read();
    let scheduler = guard.as_ref()?;
    *scheduler.current.get(cpu)?
}

pub fn current_thread() -> Option<Arc<Thread>> {
    let (pid, tid) = current_ids()?;
    find_process(pid)?.thread(tid)
}

pub fn current_process() -> Option<Arc<Process>> {
    let (pid, _) = current_ids()?;
    find_process(pid)
}

/// Install (pid, tid) as this CPU's current thread. Called by the context
/// switch glue when it resumes a thread directly.
pub fn set_current(pid: u64, tid: u32) {
    let cpu = platform::cpu_id();
    with(|s| {
        if let Some(slot) = s.current.get_mut(cpu) {
            *slot = Some((pid, tid));
        }
    });
    if let Some(thread) = find_process(pid).and_then(|p| p.thread(tid)) {
        thread.set_state(ThreadState::Running);
    }
}

/// Place the current thread at the tail of the run queue and release the
/// CPU. The glue picks the next thread with [`schedule`].
pub fn yield_current() {
    let Some((pid, tid)) = current_ids() else {
        return;
    };
    if let Some(thread) = find_process(pid).and_then(|p| p.thread(tid)) {
        if thread.state() == ThreadState::Running {
            thread.set_state(ThreadState::Ready);
        }
    }
    let cpu = platform::cpu_id();
    with(|s| {
        if let Some(slot) = s.current.get_mut(cpu) {
            *slot = None;
        }
        s.ready.push_back((pid, tid));
    });
}

/// Pick the next runnable thread for this CPU. Stale queue entries whose
/// thread vanished or changed state are skipped.
pub fn schedule() -> Option<(u64, u32)> {
    loop {
        let next = with(|s| s.ready.pop_front());
        let (pid, tid) = next?;
        let Some(thread) = find_process(pid).and_then(|p| p.thread(tid)) else {
            warn!("schedule: thread {pid}:{tid} no longer exists, skipping");
            continue;
        };
        if thread.state() != ThreadState::Ready {
            continue;
        }
        set_current(pid, tid);
        return Some((pid, tid));
    }
}

/// Register the current thread on `blocker` (and optionally a deadline) so
/// a wake can find it. The thread is actually marked Blocked by the syscall
/// dispatcher when the suspended future is stored.
pub fn block_current_on(blocker: &Arc<Blocker>, deadline_us: Option<u64>) {
    let Some((pid, tid)) = current_ids() else {
        return;
    };
    if let Some(thread) = find_process(pid).and_then(|p| p.thread(tid)) {
        thread.set_blocker(blocker.clone());
    }
    blocker.add_waiter(pid, tid);
    if let Some(deadline) = deadline_us {
        with(|s| s.deadlines.register(pid, tid, deadline));
    }
}

/// Undo [`block_current_on`] when a wait completes.
pub fn detach_current(blocker: &Arc<Blocker>) {
    let Some((pid, tid)) = current_ids() else {
        return;
    };
    blocker.remove_waiter(pid, tid);
    if let Some(thread) = find_process(pid).and_then(|p| p.thread(tid)) {
        thread.clear_blocker();
    }
    with(|s| s.deadlines.remove_thread(pid, tid));
}

/// Transition the current thread to Blocked and release the CPU.
pub fn mark_current_blocked() {
    let Some((pid, tid)) = current_ids() else {
        return;
    };
    if let Some(thread) = find_process(pid).and_then(|p| p.thread(tid)) {
        thread.set_state(ThreadState::Blocked);
    }
    let cpu = platform::cpu_id();
    with(|s| {
        if let Some(slot) = s.current.get_mut(cpu) {
            *slot = None;
        }
    });
}

/// Unblock a thread. Idempotent: only a Blocked thread is moved to Ready
/// and queued, however many wakers race.
pub fn wake_thread(pid: u64, tid: u32) {
    let Some(thread) = find_process(pid).and_then(|p| p.thread(tid)) else {
        return;
    };
    if thread.state() == ThreadState::Blocked {
        thread.set_state(ThreadState::Ready);
        with(|s| s.ready.push_back((pid, tid)));
    }
}

/// Timer interrupt: account a tick to the running process and wake
/// expired sleepers and timed waits.
pub fn timer_tick() {
    if let Some(process) = current_process() {
        process.bump_active_ticks();
    }
    let now = time::uptime_us();
    let expired = with(|s| s.deadlines.collect_expired(now));
    for (pid, tid) in expired {
        wake_thread(pid, tid);
    }
}

/// Earliest pending deadline, for the timer reload calculation.
pub fn next_deadline_us() -> Option<u64> {
    let guard = SCHEDULER.read();
    guard.as_ref()?.deadlines.next_deadline()
}

pub(crate) fn noop_waker() -> Waker {
    unsafe { Waker::from_raw(noop_raw_waker()) }
}

fn noop_raw_waker() -> RawWaker {
    fn clone(_: *const ()) -> RawWaker {
        noop_raw_waker()
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    RawWaker::new(core::ptr::null(), &VTABLE)
}

/// Re-poll a thread's suspended syscall. Returns the completed result, or
/// `None` if the thread stays blocked (or has no suspended syscall).
///
/// Wakes delivered through blockers make the thread Ready; the dispatch
/// glue then calls this before resuming it in usermode. On completion the
/// result is placed in the thread's saved `rax`.
pub fn service_thread(pid: u64, tid: u32) -> Option<isize> {
    let thread = find_process(pid).and_then(|p| p.thread(tid))?;
    let mut future = thread.take_pending_syscall()?;

    set_current(pid, tid);

    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    match future.as_mut().poll(&mut cx) {
        Poll::Ready(result) => {
            thread.with_context(|ctx| ctx.rax = result as u64);
            Some(result)
        }
        Poll::Pending => {
            thread.set_pending_syscall(future);
            mark_current_blocked();
            None
        }
    }
}

/// End a process: threads become Zombie, the handle table unwinds, file
/// descriptors close, the address space drops, children are reparented to
/// init, and waiters are signalled.
pub fn end_process(pid: u64) {
    let Some(process) = find_process(pid) else {
        return;
    };

    with(|s| {
        s.ready.retain(|&(p, _)| p != pid);
        for slot in s.current.iter_mut() {
            if slot.map_or(false, |(p, _)| p == pid) {
                *slot = None;
            }
        }
    });

    for thread in process.threads_snapshot() {
        thread.set_state(ThreadState::Zombie);
        thread.clear_blocker();
        let _ = thread.take_pending_syscall();
        with(|s| s.deadlines.remove_thread(pid, thread.tid()));
    }

    process.set_zombie();

    // Resource unwinding happens outside the scheduler lock: dropping
    // handles or descriptors can signal peers, which wakes other threads.
    let objects = process.handles().drain();
    drop(objects);
    process.fds().close_all();
    process.drop_space();

    let children = process.take_children();
    if !children.is_empty() {
        if let Some(init) = init_process() {
            for child in children {
                child.set_parent(Arc::downgrade(&init));
                init.add_child(child);
            }
        }
    }

    process.watchers().signal(PROCESS_EVENT_EXIT);
}

/// Exit the calling thread. When the last thread of a process exits, the
/// process ends.
pub fn exit_current_thread() {
    let Some((pid, tid)) = current_ids() else {
        return;
    };
    let Some(process) = find_process(pid) else {
        return;
    };
    if let Some(thread) = process.thread(tid) {
        thread.set_state(ThreadState::Zombie);
        thread.clear_blocker();
    }
    process.remove_thread(tid);
    let cpu = platform::cpu_id();
    with(|s| {
        if let Some(slot) = s.current.get_mut(cpu) {
            *slot = None;
        }
        s.deadlines.remove_thread(pid, tid);
    });

    if process.thread_count() == 0 {
        end_process(pid);
    }
}

/// Drop a process record that never started. Used when loading an
/// executable into a fresh process fails.
pub(crate) fn discard_process(pid: u64) {
    with(|s| {
        s.processes.remove(&pid);
    });
}

/// Remove a zombie process from the table and its parent's child list.
/// Returns true for exactly one caller per pid.
pub fn reap(pid: u64) -> bool {
    let removed = with(|s| {
        let zombie = s
            .processes
            .get(&pid)
            .map(|p| p.is_zombie())
            .unwrap_or(false);
        if zombie {
            s.processes.remove(&pid)
        } else {
            None
        }
    });
    match removed {
        Some(process) => {
            if let Some(parent) = process.parent() {
                parent.take_child(pid);
            }
            true
        }
        None => false,
    }
}

#[cfg(any(test, feature = "testing"))]
pub(crate) fn reset() {
    init();
}
