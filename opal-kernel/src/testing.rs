//! Host-side facilities for exercising the kernel core.
//!
//! Tests run the real subsystems against in-memory stand-ins for the
//! external collaborators: a frame store for the paging facility, a manual
//! clock, a RAM filesystem with pipes, and a loopback packet transport.
//! Global kernel state is reset by [`fixture`], which also serialises tests
//! touching it.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU64, Ordering};

use spinning_top::guard::SpinlockGuard;
use spinning_top::{RwSpinlock, Spinlock};
use x86_64::PhysAddr;

use opal_abi::poll::{POLLIN, POLLOUT};

use crate::fs::{self, DirEntry, FsError, FsNode, NodeType, Vfs};
use crate::memory::{PhysicalMemory, RegionFlags, PAGE_SIZE};
use crate::net::{self, Ipv4Address, MacAddress, PacketTransport, SocketError};
use crate::object::{WatchList, Watcher};
use crate::process::{Process, RegisterContext, Thread};
use crate::sched;
use crate::syscall::{self, Disposition};
use crate::time::{self, ClockSource};

// ---------------------------------------------------------------------------
// Physical memory

pub struct TestMemory {
    frames: Spinlock<BTreeMap<u64, Box<[u8; PAGE_SIZE]>>>,
    next: AtomicU64,
}

impl TestMemory {
    fn new() -> TestMemory {
        TestMemory {
            frames: Spinlock::new(BTreeMap::new()),
            next: AtomicU64::new(PAGE_SIZE as u64),
        }
    }
}

impl PhysicalMemory for TestMemory {
    fn allocate_frame(&self) -> Option<PhysAddr> {
        let addr = self.next.fetch_add(PAGE_SIZE as u64, Ordering::Relaxed);
        self.frames.lock().insert(addr, Box::new([0; PAGE_SIZE]));
        Some(PhysAddr::new(addr))
    }

    fn release_frame(&self, frame: PhysAddr) {
        self.frames.lock().remove(&frame.as_u64());
    }

    fn frame_ptr(&self, frame: PhysAddr) -> *mut u8 {
        self.frames
            .lock()
            .get(&frame.as_u64())
            .map(|frame| frame.as_ptr() as *mut u8)
            .expect("frame_ptr for an unallocated frame")
    }

    fn total_bytes(&self) -> usize {
        64 * 1024 * 1024
    }

    fn used_bytes(&self) -> usize {
        self.frames.lock().len() * PAGE_SIZE
    }
}

// ---------------------------------------------------------------------------
// Clock

pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    /// Advance time and deliver the timer tick, waking expired sleepers.
    pub fn advance(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::SeqCst);
        sched::timer_tick();
    }

    fn reset(&self) {
        self.micros.store(0, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn uptime_us(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }

    fn wall_clock_s(&self) -> u64 {
        self.uptime_us() / 1_000_000
    }
}

// ---------------------------------------------------------------------------
// RAM filesystem

static NEXT_INODE: AtomicU64 = AtomicU64::new(1);

fn next_inode() -> u64 {
    NEXT_INODE.fetch_add(1, Ordering::Relaxed)
}

pub struct RamFile {
    inode: u64,
    data: Spinlock<Vec<u8>>,
}

impl RamFile {
    fn new(data: &[u8]) -> Arc<RamFile> {
        Arc::new(RamFile {
            inode: next_inode(),
            data: Spinlock::new(Vec::from(data)),
        })
    }
}

impl FsNode for RamFile {
    fn node_type(&self) -> NodeType {
        NodeType::Regular
    }

    fn inode(&self) -> u64 {
        self.inode
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = (data.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn truncate(&self, size: u64) -> Result<(), FsError> {
        self.data.lock().resize(size as usize, 0);
        Ok(())
    }
}

pub struct RamSymlink {
    inode: u64,
    target: String,
}

impl FsNode for RamSymlink {
    fn node_type(&self) -> NodeType {
        NodeType::Symlink
    }

    fn inode(&self) -> u64 {
        self.inode
    }

    fn read_link(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        let bytes = self.target.as_bytes();
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }
}

/// A directory keeps its children both as trait objects (for the node
/// contract) and as typed subdirectories (for path walking).
pub struct RamDir {
    inode: u64,
    entries: Spinlock<BTreeMap<String, Arc<dyn FsNode>>>,
    subdirs: Spinlock<BTreeMap<String, Arc<RamDir>>>,
}

impl RamDir {
    fn new() -> Arc<RamDir> {
        Arc::new(RamDir {
            inode: next_inode(),
            entries: Spinlock::new(BTreeMap::new()),
            subdirs: Spinlock::new(BTreeMap::new()),
        })
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn FsNode>> {
        self.entries.lock().get(name).cloned()
    }

    fn subdir(&self, name: &str) -> Option<Arc<RamDir>> {
        self.subdirs.lock().get(name).cloned()
    }

    fn make_subdir(&self, name: &str) -> Arc<RamDir> {
        if let Some(existing) = self.subdir(name) {
            return existing;
        }
        let dir = RamDir::new();
        self.subdirs
            .lock()
            .insert(String::from(name), dir.clone());
        self.entries
            .lock()
            .insert(String::from(name), dir.clone() as Arc<dyn FsNode>);
        dir
    }
}

impl FsNode for RamDir {
    fn node_type(&self) -> NodeType {
        NodeType::Directory
    }

    fn inode(&self) -> u64 {
        self.inode
    }

    fn read_dir(&self, index: usize) -> Result<Option<DirEntry>, FsError> {
        let entries = self.entries.lock();
        Ok(entries.iter().nth(index).map(|(name, node)| DirEntry {
            name: name.clone(),
            node_type: node.node_type(),
            inode: node.inode(),
        }))
    }

    fn create(&self, name: &str, directory: bool) -> Result<Arc<dyn FsNode>, FsError> {
        if self.entries.lock().contains_key(name) {
            return Err(FsError::Exists);
        }
        if directory {
            Ok(self.make_subdir(name) as Arc<dyn FsNode>)
        } else {
            let node = RamFile::new(&[]) as Arc<dyn FsNode>;
            self.entries
                .lock()
                .insert(String::from(name), node.clone());
            Ok(node)
        }
    }

    fn link(&self, name: &str, target: &Arc<dyn FsNode>) -> Result<(), FsError> {
        if target.node_type() == NodeType::Directory {
            return Err(FsError::IsDirectory);
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(name) {
            return Err(FsError::Exists);
        }
        entries.insert(String::from(name), target.clone());
        Ok(())
    }

    fn unlink(&self, name: &str, remove_dir: bool) -> Result<(), FsError> {
        let mut entries = self.entries.lock();
        let Some(node) = entries.get(name) else {
            return Err(FsError::NotFound);
        };
        let is_dir = node.node_type() == NodeType::Directory;
        if is_dir != remove_dir {
            return Err(if is_dir {
                FsError::IsDirectory
            } else {
                FsError::NotDirectory
            });
        }
        entries.remove(name);
        self.subdirs.lock().remove(name);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipes

const PIPE_CAPACITY: usize = 65536;

struct PipeShared {
    buf: VecDeque<u8>,
    readers: usize,
    writers: usize,
    read_watchers: Arc<WatchList>,
    write_watchers: Arc<WatchList>,
}

pub struct PipeReadNode {
    inode: u64,
    shared: Arc<Spinlock<PipeShared>>,
    watchers: Arc<WatchList>,
}

pub struct PipeWriteNode {
    inode: u64,
    shared: Arc<Spinlock<PipeShared>>,
    watchers: Arc<WatchList>,
}

fn pipe_pair() -> (Arc<dyn FsNode>, Arc<dyn FsNode>) {
    let read_watchers = Arc::new(WatchList::new());
    let write_watchers = Arc::new(WatchList::new());
    let shared = Arc::new(Spinlock::new(PipeShared {
        buf: VecDeque::new(),
        readers: 0,
        writers: 0,
        read_watchers: read_watchers.clone(),
        write_watchers: write_watchers.clone(),
    }));
    (
        Arc::new(PipeReadNode {
            inode: next_inode(),
            shared: shared.clone(),
            watchers: read_watchers,
        }),
        Arc::new(PipeWriteNode {
            inode: next_inode(),
            shared,
            watchers: write_watchers,
        }),
    )
}

impl FsNode for PipeReadNode {
    fn node_type(&self) -> NodeType {
        NodeType::Pipe
    }

    fn inode(&self) -> u64 {
        self.inode
    }

    fn can_read(&self) -> bool {
        let shared = self.shared.lock();
        !shared.buf.is_empty() || shared.writers == 0
    }

    fn can_write(&self) -> bool {
        false
    }

    fn read(&self, _offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let (watchers, n) = {
            let mut shared = self.shared.lock();
            if shared.buf.is_empty() {
                if shared.writers == 0 {
                    return Ok(0);
                }
                return Err(FsError::WouldBlock);
            }
            let n = shared.buf.len().min(buf.len());
            for byte in buf.iter_mut().take(n) {
                *byte = shared.buf.pop_front().expect("length checked");
            }
            (shared.write_watchers.clone(), n)
        };
        watchers.signal(POLLOUT as u32);
        Ok(n)
    }

    fn watch(&self, watcher: &Watcher, events: u32) {
        self.watchers.add(watcher.blocker(), events);
    }

    fn unwatch(&self, watcher: &Watcher) {
        self.watchers.remove(watcher.blocker());
    }

    fn on_open(&self) {
        self.shared.lock().readers += 1;
    }

    fn on_close(&self) {
        let watchers = {
            let mut shared = self.shared.lock();
            shared.readers -= 1;
            (shared.readers == 0).then(|| shared.write_watchers.clone())
        };
        if let Some(watchers) = watchers {
            watchers.signal(POLLOUT as u32);
        }
    }
}

impl FsNode for PipeWriteNode {
    fn node_type(&self) -> NodeType {
        NodeType::Pipe
    }

    fn inode(&self) -> u64 {
        self.inode
    }

    fn can_read(&self) -> bool {
        false
    }

    fn can_write(&self) -> bool {
        let shared = self.shared.lock();
        shared.readers == 0 || shared.buf.len() < PIPE_CAPACITY
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        let (watchers, n) = {
            let mut shared = self.shared.lock();
            if shared.readers == 0 {
                return Err(FsError::BrokenPipe);
            }
            let space = PIPE_CAPACITY - shared.buf.len();
            if space == 0 {
                return Err(FsError::WouldBlock);
            }
            let n = space.min(buf.len());
            shared.buf.extend(&buf[..n]);
            (shared.read_watchers.clone(), n)
        };
        watchers.signal(POLLIN as u32);
        Ok(n)
    }

    fn watch(&self, watcher: &Watcher, events: u32) {
        self.watchers.add(watcher.blocker(), events);
    }

    fn unwatch(&self, watcher: &Watcher) {
        self.watchers.remove(watcher.blocker());
    }

    fn on_open(&self) {
        self.shared.lock().writers += 1;
    }

    fn on_close(&self) {
        let watchers = {
            let mut shared = self.shared.lock();
            shared.writers -= 1;
            (shared.writers == 0).then(|| shared.read_watchers.clone())
        };
        if let Some(watchers) = watchers {
            watchers.signal(POLLIN as u32);
        }
    }
}

// ---------------------------------------------------------------------------
// VFS

pub struct RamFs {
    root: RwSpinlock<Arc<RamDir>>,
}

impl RamFs {
    fn root(&self) -> Arc<RamDir> {
        self.root.read().clone()
    }

    fn walk_dirs<'a>(
        &self,
        components: impl Iterator<Item = &'a str>,
    ) -> Option<Arc<RamDir>> {
        let mut dir = self.root();
        for component in components {
            dir = dir.subdir(component)?;
        }
        Some(dir)
    }

    /// Create intermediate directories and install a file.
    pub fn add_file(&self, path: &str, data: &[u8]) {
        let canonical = fs::canonicalize(path, "/");
        let components: Vec<&str> = canonical.split('/').filter(|c| !c.is_empty()).collect();
        let mut dir = self.root();
        for component in &components[..components.len() - 1] {
            dir = dir.make_subdir(component);
        }
        let name = components.last().expect("non-empty path");
        dir.entries
            .lock()
            .insert(String::from(*name), RamFile::new(data) as Arc<dyn FsNode>);
    }

    pub fn add_dir(&self, path: &str) {
        let canonical = fs::canonicalize(path, "/");
        let mut dir = self.root();
        for component in canonical.split('/').filter(|c| !c.is_empty()) {
            dir = dir.make_subdir(component);
        }
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        let canonical = fs::canonicalize(path, "/");
        let components: Vec<&str> = canonical.split('/').filter(|c| !c.is_empty()).collect();
        let mut dir = self.root();
        for component in &components[..components.len() - 1] {
            dir = dir.make_subdir(component);
        }
        let name = components.last().expect("non-empty path");
        let link = Arc::new(RamSymlink {
            inode: next_inode(),
            target: String::from(target),
        });
        dir.entries
            .lock()
            .insert(String::from(*name), link as Arc<dyn FsNode>);
    }

    fn reset(&self) {
        *self.root.write() = RamDir::new();
    }

    fn dir_by_inode(dir: &Arc<RamDir>, inode: u64) -> Option<Arc<RamDir>> {
        if dir.inode == inode {
            return Some(dir.clone());
        }
        let subdirs: Vec<Arc<RamDir>> = dir.subdirs.lock().values().cloned().collect();
        subdirs
            .into_iter()
            .find_map(|sub| Self::dir_by_inode(&sub, inode))
    }
}

impl Vfs for RamFs {
    fn resolve(&self, path: &str, cwd: &str, follow_symlinks: bool) -> Option<Arc<dyn FsNode>> {
        let canonical = fs::canonicalize(path, cwd);
        if canonical == "/" {
            return Some(self.root() as Arc<dyn FsNode>);
        }
        let components: Vec<&str> = canonical.split('/').filter(|c| !c.is_empty()).collect();
        let dir = self.walk_dirs(components[..components.len() - 1].iter().copied())?;
        let node = dir.lookup(components.last()?)?;
        if follow_symlinks && node.node_type() == NodeType::Symlink {
            let mut target = [0u8; 256];
            let n = node.read_link(&mut target).ok()?;
            let target = core::str::from_utf8(&target[..n]).ok()?;
            return self.resolve(target, "/", true);
        }
        Some(node)
    }

    fn resolve_parent(&self, path: &str, cwd: &str) -> Option<Arc<dyn FsNode>> {
        let canonical = fs::canonicalize(path, cwd);
        let parent = match canonical.rfind('/') {
            Some(0) => String::from("/"),
            Some(index) => String::from(&canonical[..index]),
            None => return None,
        };
        self.resolve(&parent, "/", true)
    }

    fn create_pipe(&self) -> Result<(Arc<dyn FsNode>, Arc<dyn FsNode>), FsError> {
        Ok(pipe_pair())
    }

    fn rename(
        &self,
        old_parent: &Arc<dyn FsNode>,
        old_name: &str,
        new_parent: &Arc<dyn FsNode>,
        new_name: &str,
    ) -> Result<(), FsError> {
        let root = self.root();
        let old_dir =
            Self::dir_by_inode(&root, old_parent.inode()).ok_or(FsError::NotDirectory)?;
        let new_dir =
            Self::dir_by_inode(&root, new_parent.inode()).ok_or(FsError::NotDirectory)?;
        let node = old_dir
            .entries
            .lock()
            .remove(old_name)
            .ok_or(FsError::NotFound)?;
        new_dir.entries.lock().insert(String::from(new_name), node);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loopback transport

pub struct LoopbackTransport;

impl PacketTransport for LoopbackTransport {
    fn route(&self, _source: Ipv4Address, dest: Ipv4Address) -> Result<MacAddress, SocketError> {
        if dest.0[0] == 127 || dest == Ipv4Address::ANY {
            Ok(MacAddress([0; 6]))
        } else {
            Err(SocketError::NoRoute)
        }
    }

    fn transmit(
        &self,
        _dest_mac: MacAddress,
        _dest_ip: Ipv4Address,
        packet: &[u8],
    ) -> Result<(), SocketError> {
        net::udp::on_receive(Ipv4Address::LOOPBACK, packet);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixture

static TEST_LOCK: Spinlock<()> = Spinlock::new(());

#[derive(Clone, Copy)]
struct Facilities {
    clock: &'static ManualClock,
    ramfs: &'static RamFs,
}

static FACILITIES: RwSpinlock<Option<Facilities>> = RwSpinlock::new(None);

fn facilities() -> Facilities {
    if let Some(f) = *FACILITIES.read() {
        return f;
    }
    let mut write = FACILITIES.write();
    if let Some(f) = *write {
        return f;
    }
    let memory: &'static TestMemory = Box::leak(Box::new(TestMemory::new()));
    let clock: &'static ManualClock = Box::leak(Box::new(ManualClock {
        micros: AtomicU64::new(0),
    }));
    let ramfs: &'static RamFs = Box::leak(Box::new(RamFs {
        root: RwSpinlock::new(RamDir::new()),
    }));
    let transport: &'static LoopbackTransport = Box::leak(Box::new(LoopbackTransport));

    crate::memory::phys::init(memory);
    time::init(clock);
    fs::init(ramfs);
    net::init(transport);

    let f = Facilities { clock, ramfs };
    *write = Some(f);
    f
}

pub struct Fixture {
    _guard: SpinlockGuard<'static, ()>,
    clock: &'static ManualClock,
    ramfs: &'static RamFs,
}

/// Serialise the test, install the host facilities, and reset every global
/// kernel structure.
pub fn fixture() -> Fixture {
    let guard = TEST_LOCK.lock();
    let facilities = facilities();

    facilities.clock.reset();
    facilities.ramfs.reset();
    sched::reset();
    crate::ipc::reset_endpoints();
    crate::ipc::reset_services();
    crate::memory::shared::reset();
    crate::net::socket::reset();
    crate::net::udp::reset();

    Fixture {
        _guard: guard,
        clock: facilities.clock,
        ramfs: facilities.ramfs,
    }
}

impl Fixture {
    pub fn clock(&self) -> &'static ManualClock {
        self.clock
    }

    pub fn ramfs(&self) -> &'static RamFs {
        self.ramfs
    }
}

// ---------------------------------------------------------------------------
// Syscall driving

/// Create and start a bare process with one thread, and make it current.
pub fn spawn_process(name: &str) -> (Arc<Process>, Arc<Thread>) {
    let process = sched::create_process(name, None);
    let thread = add_main_thread(&process);
    (process, thread)
}

/// Attach a main thread to a process record and make it current.
pub fn add_main_thread(process: &Arc<Process>) -> Arc<Thread> {
    let thread = process.add_thread(RegisterContext::default());
    sched::start_thread(&thread);
    sched::set_current(process.pid(), thread.tid());
    thread
}

/// Issue a syscall as (process, thread).
pub fn sys(
    process: &Arc<Process>,
    thread: &Arc<Thread>,
    number: usize,
    args: [u64; 6],
) -> Disposition {
    sched::set_current(process.pid(), thread.tid());
    let mut regs = thread.context();
    regs.rax = number as u64;
    regs.rdi = args[0];
    regs.rsi = args[1];
    regs.rdx = args[2];
    regs.r10 = args[3];
    regs.r8 = args[4];
    regs.r9 = args[5];
    syscall::dispatch(&mut regs)
}

/// Convenience wrapper asserting the syscall completed synchronously.
pub fn sys_ok(
    process: &Arc<Process>,
    thread: &Arc<Thread>,
    number: usize,
    args: [u64; 6],
) -> isize {
    match sys(process, thread, number, args) {
        Disposition::Completed(result) => result,
        Disposition::Parked => panic!("syscall {number} unexpectedly blocked"),
    }
}

/// Re-poll a parked thread's suspended syscall.
pub fn resume(process: &Arc<Process>, thread: &Arc<Thread>) -> Option<isize> {
    sched::service_thread(process.pid(), thread.tid())
}

/// Map anonymous user memory in the process.
pub fn ualloc(process: &Arc<Process>, size: usize) -> u64 {
    process
        .space()
        .expect("live process")
        .map_anonymous(size, 0, false, RegionFlags::READ | RegionFlags::WRITE)
        .expect("user allocation")
        .as_u64()
}

pub fn uwrite(process: &Arc<Process>, addr: u64, data: &[u8]) {
    process
        .space()
        .expect("live process")
        .copy_to_user(addr, data)
        .expect("user write");
}

pub fn uread(process: &Arc<Process>, addr: u64, len: usize) -> Vec<u8> {
    let mut buf = alloc::vec![0u8; len];
    process
        .space()
        .expect("live process")
        .copy_from_user(addr, &mut buf)
        .expect("user read");
    buf
}

/// Copy a NUL-terminated string into fresh user memory, returning its
/// address.
pub fn ustr(process: &Arc<Process>, s: &str) -> u64 {
    let addr = ualloc(process, s.len() + 1);
    let mut bytes = Vec::from(s.as_bytes());
    bytes.push(0);
    uwrite(process, addr, &bytes);
    addr
}
