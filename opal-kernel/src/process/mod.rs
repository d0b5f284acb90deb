//! Process records and lifecycle.

pub mod context;
mod elf;
mod exec;
pub mod fd;
pub mod thread;

pub use context::{FxState, RegisterContext};
pub use exec::{exec_replace, read_executable, spawn_from_path, ExecError, USER_STACK_SIZE};
pub use fd::{FdTable, FileDescriptor};
pub use thread::{Thread, ThreadState};

use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spinning_top::guard::SpinlockGuard;
use spinning_top::Spinlock;

use crate::handle::HandleTable;
use crate::memory::AddressSpace;
use crate::object::WatchList;
use crate::sched::Blocker;
use crate::time;

#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials {
            uid: 0,
            euid: 0,
            gid: 0,
            egid: 0,
        }
    }
}

pub struct Process {
    pid: u64,
    name: Spinlock<String>,
    parent: Spinlock<Weak<Process>>,
    working_dir: Spinlock<String>,
    creds: Spinlock<Credentials>,
    /// Dropped when the process ends; a zombie holds no memory.
    address_space: Spinlock<Option<Arc<AddressSpace>>>,
    threads: Spinlock<Vec<Option<Arc<Thread>>>>,
    handles: Spinlock<HandleTable>,
    fds: Spinlock<FdTable>,
    children: Spinlock<Vec<Arc<Process>>>,
    /// Futex wait queues keyed by user virtual address.
    futexes: Spinlock<BTreeMap<u64, VecDeque<Arc<Blocker>>>>,
    /// Signalled when the process transitions to Zombie.
    watchers: WatchList,
    zombie: AtomicBool,
    creation_time_s: u64,
    active_ticks: AtomicU64,
}

impl Process {
    pub(crate) fn new(pid: u64, name: &str, parent: Weak<Process>) -> Arc<Process> {
        Arc::new(Process {
            pid,
            name: Spinlock::new(String::from(name)),
            parent: Spinlock::new(parent),
            working_dir: Spinlock::new(String::from("/")),
            creds: Spinlock::new(Credentials::default()),
            address_space: Spinlock::new(Some(AddressSpace::new())),
            threads: Spinlock::new(Vec::new()),
            handles: Spinlock::new(HandleTable::new()),
            fds: Spinlock::new(FdTable::new()),
            children: Spinlock::new(Vec::new()),
            futexes: Spinlock::new(BTreeMap::new()),
            watchers: WatchList::new(),
            zombie: AtomicBool::new(false),
            creation_time_s: time::uptime_s(),
            active_ticks: AtomicU64::new(0),
        })
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = String::from(name);
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.lock().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: Weak<Process>) {
        *self.parent.lock() = parent;
    }

    pub fn working_dir(&self) -> String {
        self.working_dir.lock().clone()
    }

    pub fn set_working_dir(&self, dir: &str) {
        *self.working_dir.lock() = String::from(dir);
    }

    pub fn creds(&self) -> SpinlockGuard<'_, Credentials> {
        self.creds.lock()
    }

    /// The live address space, absent once the process has ended.
    pub fn space(&self) -> Option<Arc<AddressSpace>> {
        self.address_space.lock().clone()
    }

    pub(crate) fn set_space(&self, space: Arc<AddressSpace>) {
        *self.address_space.lock() = Some(space);
    }

    pub(crate) fn drop_space(&self) {
        *self.address_space.lock() = None;
    }

    pub fn handles(&self) -> SpinlockGuard<'_, HandleTable> {
        self.handles.lock()
    }

    pub fn fds(&self) -> SpinlockGuard<'_, FdTable> {
        self.fds.lock()
    }

    pub(crate) fn set_fds(&self, table: FdTable) {
        *self.fds.lock() = table;
    }

    pub fn futexes(&self) -> SpinlockGuard<'_, BTreeMap<u64, VecDeque<Arc<Blocker>>>> {
        self.futexes.lock()
    }

    pub fn watchers(&self) -> &WatchList {
        &self.watchers
    }

    /// Add a thread with the given initial context. The tid is the slot
    /// index, dense within the process.
    pub(crate) fn add_thread(self: &Arc<Process>, context: RegisterContext) -> Arc<Thread> {
        let mut threads = self.threads.lock();
        let tid = threads.len() as u32;
        let thread = Thread::new(self, tid, context);
        threads.push(Some(thread.clone()));
        thread
    }

    pub fn thread(&self, tid: u32) -> Option<Arc<Thread>> {
        self.threads.lock().get(tid as usize)?.clone()
    }

    pub fn main_thread(&self) -> Option<Arc<Thread>> {
        self.thread(0)
    }

    pub fn threads_snapshot(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().iter().flatten().cloned().collect()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().iter().flatten().count()
    }

    /// Number of threads existing, including reaped slots. Bounds tid
    /// lookups from userspace.
    pub fn thread_slots(&self) -> usize {
        self.threads.lock().len()
    }

    pub(crate) fn remove_thread(&self, tid: u32) {
        if let Some(slot) = self.threads.lock().get_mut(tid as usize) {
            *slot = None;
        }
    }

    pub fn add_child(&self, child: Arc<Process>) {
        self.children.lock().push(child);
    }

    pub fn children_snapshot(&self) -> Vec<Arc<Process>> {
        self.children.lock().clone()
    }

    pub fn has_children(&self) -> bool {
        !self.children.lock().is_empty()
    }

    /// Remove and return the child with `pid`, if present.
    pub(crate) fn take_child(&self, pid: u64) -> Option<Arc<Process>> {
        let mut children = self.children.lock();
        let index = children.iter().position(|c| c.pid() == pid)?;
        Some(children.remove(index))
    }

    pub(crate) fn take_children(&self) -> Vec<Arc<Process>> {
        core::mem::take(&mut *self.children.lock())
    }

    pub fn is_zombie(&self) -> bool {
        self.zombie.load(Ordering::Acquire)
    }

    pub(crate) fn set_zombie(&self) {
        self.zombie.store(true, Ordering::Release);
    }

    pub fn creation_time_s(&self) -> u64 {
        self.creation_time_s
    }

    pub fn active_ticks(&self) -> u64 {
        self.active_ticks.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_active_ticks(&self) {
        self.active_ticks.fetch_add(1, Ordering::Relaxed);
    }
}
