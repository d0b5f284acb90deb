//! Process, thread, identity, futex, and wait syscalls.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{info, warn};

use opal_abi::errno::{
    ECHILD, EFAULT, EINTR, EINVAL, ENOENT, ENOSYS, ENOTDIR, EPERM, ESRCH,
};
use opal_abi::process::{
    ProcessInfo, EXEC_CHILD, PROCESS_NAME_LEN, PROCESS_STATE_ACTIVE, PROCESS_STATE_ZOMBIE,
    WNOHANG,
};

use crate::fs::{self, FsNode};
use crate::process::{exec_replace, read_executable, spawn_from_path, FileDescriptor, Process};
use crate::sched::{self, park_until, Blocker, WaitOutcome};
use crate::time;

use super::user_ptr::{read_string, read_struct, write_bytes, write_struct};
use super::{current, current_space, done, try_sys, RegisterContext, SyscallFuture};

pub(super) fn sys_exit(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    info!(
        "process {} (pid {}) exiting with code {}",
        proc.name(),
        proc.pid(),
        regs.arg0() as i64
    );
    sched::end_process(proc.pid());
    done(0)
}

/// Snapshot an argv/envp array out of user memory. A null pointer entry
/// terminates the array.
fn snapshot_strings(
    space: &crate::memory::AddressSpace,
    array: u64,
    limit: Option<usize>,
) -> Result<Vec<String>, isize> {
    let mut strings = Vec::new();
    let mut index = 0;
    loop {
        if let Some(limit) = limit {
            if index >= limit {
                break;
            }
        }
        let ptr: u64 = read_struct(space, array + (index * 8) as u64)?;
        if ptr == 0 {
            break;
        }
        strings.push(read_string(space, ptr)?);
        index += 1;
        if index > 4096 {
            return Err(-EINVAL);
        }
    }
    Ok(strings)
}

/// Syscall 2: load an executable into a *new* process.
pub(super) fn sys_exec(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let path = try_sys!(read_string(&space, regs.arg0()));
    let argc = regs.arg1() as usize;
    let flags = regs.arg3();

    let argv = if regs.arg2() != 0 {
        try_sys!(snapshot_strings(&space, regs.arg2(), Some(argc)))
    } else {
        Vec::new()
    };
    let envp = if regs.arg4() != 0 {
        try_sys!(snapshot_strings(&space, regs.arg4(), None))
    } else {
        Vec::new()
    };

    info!("loading: {path}");
    let cwd = proc.working_dir();
    let child = match spawn_from_path(&path, &cwd, &argv, &envp) {
        Ok(child) => child,
        Err(e) => return done(-e.errno()),
    };

    if flags & EXEC_CHILD != 0 {
        child.set_parent(Arc::downgrade(&proc));
        proc.add_child(child.clone());
        // Share the caller's standard descriptors.
        let fds = proc.fds();
        for fd in 0..3 {
            if let Some(descriptor) = fds.get(fd) {
                child.fds().replace(fd, FileDescriptor::duplicate(descriptor));
            }
        }
    }

    sched::start_process(&child);
    done(child.pid() as isize)
}

/// Syscall 11: replace the calling process's image.
///
/// argv and envp are snapshot-copied into kernel buffers before any other
/// work; nothing read later can observe a concurrent unmap.
pub(super) fn sys_execve(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let path = try_sys!(read_string(&space, regs.arg0()));
    let argv = try_sys!(snapshot_strings(&space, regs.arg1(), None));
    let envp = try_sys!(snapshot_strings(&space, regs.arg2(), None));

    let data = match read_executable(&path, &proc.working_dir()) {
        Ok(data) => data,
        Err(e) => return done(-e.errno()),
    };

    let thread = sched::current_thread().expect("execve from a running thread");
    match exec_replace(&proc, &thread, &data, &argv, &envp) {
        Ok(()) => {
            if let Some(name) = argv.first() {
                proc.set_name(fs::base_name(name));
            } else {
                proc.set_name(fs::base_name(&path));
            }
            done(0)
        }
        Err(e) => {
            // The old image is gone; there is nothing to return to.
            warn!("execve: load failed for {path}, ending process");
            sched::end_process(proc.pid());
            done(-e.errno())
        }
    }
}

pub(super) fn sys_sleep(_regs: &RegisterContext) -> SyscallFuture {
    done(0)
}

pub(super) fn sys_chdir(regs: &RegisterContext) -> SyscallFuture {
    if regs.arg0() == 0 {
        warn!("chdir: null path");
        return done(0);
    }
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let path = try_sys!(read_string(&space, regs.arg0()));
    let canonical = fs::canonicalize(&path, &proc.working_dir());

    let Some(node) = fs::resolve_path(&canonical, "/", true) else {
        warn!("chdir: could not find {canonical}");
        return done(-ENOENT);
    };
    if node.node_type() != fs::NodeType::Directory {
        return done(-ENOTDIR);
    }
    proc.set_working_dir(&canonical);
    done(0)
}

/// The pid is written through the pointer argument.
pub(super) fn sys_getpid(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    try_sys!(write_struct(&space, regs.arg0(), &proc.pid()));
    done(0)
}

pub(super) fn sys_yield(_regs: &RegisterContext) -> SyscallFuture {
    sched::yield_current();
    done(0)
}

pub(super) fn sys_set_fs_base(regs: &RegisterContext) -> SyscallFuture {
    let thread = sched::current_thread().expect("syscall from a running thread");
    thread.set_fs_base(regs.arg0());
    done(0)
}

pub(super) fn sys_get_cwd(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let cwd = proc.working_dir();
    let size = regs.arg1() as usize;
    if cwd.len() > size {
        return done(1);
    }
    let mut bytes = Vec::from(cwd.as_bytes());
    bytes.push(0);
    try_sys!(write_bytes(&space, regs.arg0(), &bytes));
    done(0)
}

/// Find a zombie child of `proc` and reap it, returning its pid.
fn reap_any_zombie(proc: &Arc<Process>) -> Option<u64> {
    proc.children_snapshot()
        .into_iter()
        .find(|child| child.is_zombie() && sched::reap(child.pid()))
        .map(|child| child.pid())
}

pub(super) fn sys_waitpid(regs: &RegisterContext) -> SyscallFuture {
    let pid = regs.arg0() as i64;
    let flags = regs.arg2() as i64;
    Box::pin(async move {
        let proc = current();

        if pid == -1 {
            if !proc.has_children() {
                return -ECHILD;
            }
            if flags & WNOHANG != 0 {
                return reap_any_zombie(&proc).map(|pid| pid as isize).unwrap_or(0);
            }

            let blocker = Blocker::new();
            let watch_proc = proc.clone();
            let watch_blocker = blocker.clone();
            let outcome = park_until(blocker.clone(), None, move || {
                let children = watch_proc.children_snapshot();
                if children.is_empty() {
                    return Some(-ECHILD);
                }
                for child in &children {
                    if child.is_zombie() && sched::reap(child.pid()) {
                        return Some(child.pid() as isize);
                    }
                    child.watchers().add(&watch_blocker, 0);
                }
                None
            })
            .await;
            match outcome {
                WaitOutcome::Complete(result) => result,
                WaitOutcome::Interrupted => -EINTR,
                WaitOutcome::TimedOut => 0,
            }
        } else {
            let Some(target) = sched::find_process(pid as u64) else {
                return -ECHILD;
            };
            if flags & WNOHANG != 0 {
                if target.is_zombie() && sched::reap(target.pid()) {
                    return pid as isize;
                }
                return 0;
            }

            let blocker = Blocker::new();
            let watch_blocker = blocker.clone();
            let watched = target.clone();
            let outcome = park_until(blocker.clone(), None, move || {
                if watched.is_zombie() {
                    // Exactly one waiter reaps; a loser reports no child.
                    return if sched::reap(watched.pid()) {
                        Some(watched.pid() as isize)
                    } else {
                        Some(-ECHILD)
                    };
                }
                watched.watchers().add(&watch_blocker, 0);
                None
            })
            .await;
            match outcome {
                WaitOutcome::Complete(result) => result,
                WaitOutcome::Interrupted => -EINTR,
                WaitOutcome::TimedOut => 0,
            }
        }
    })
}

/// Sleep for the given number of nanoseconds.
pub(super) fn sys_nanosleep(regs: &RegisterContext) -> SyscallFuture {
    let micros = regs.arg0() / 1_000;
    Box::pin(async move {
        if micros == 0 {
            return 0;
        }
        let deadline = time::uptime_us() + micros;
        let blocker = Blocker::new();
        match park_until(blocker, Some(deadline), || None::<()>).await {
            WaitOutcome::TimedOut => 0,
            WaitOutcome::Interrupted => -EINTR,
            WaitOutcome::Complete(()) => 0,
        }
    })
}

pub(super) fn sys_getuid(_regs: &RegisterContext) -> SyscallFuture {
    done(current().creds().uid as isize)
}

pub(super) fn sys_geteuid(_regs: &RegisterContext) -> SyscallFuture {
    done(current().creds().euid as isize)
}

pub(super) fn sys_getgid(_regs: &RegisterContext) -> SyscallFuture {
    done(current().creds().gid as isize)
}

pub(super) fn sys_getegid(_regs: &RegisterContext) -> SyscallFuture {
    done(current().creds().egid as isize)
}

pub(super) fn sys_getppid(_regs: &RegisterContext) -> SyscallFuture {
    match current().parent() {
        Some(parent) => done(parent.pid() as isize),
        None => done(-1),
    }
}

pub(super) fn sys_setuid(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let requested = regs.arg0() as u32;
    let mut creds = proc.creds();
    if creds.uid == requested {
        return done(0);
    }
    if creds.euid == 0 {
        creds.uid = requested;
        creds.euid = requested;
        done(0)
    } else {
        done(-EPERM)
    }
}

/// An unprivileged process may only set the effective uid to its real or
/// current effective uid.
pub(super) fn sys_seteuid(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let requested = regs.arg0() as u32;
    let mut creds = proc.creds();
    if creds.euid == requested {
        return done(0);
    }
    if creds.uid == 0 || creds.uid == requested {
        creds.euid = requested;
        done(0)
    } else {
        done(-EPERM)
    }
}

fn fill_process_info(process: &Arc<Process>) -> ProcessInfo {
    let mut pinfo = ProcessInfo {
        pid: process.pid(),
        thread_count: process.thread_count() as u32,
        state: if process.is_zombie() {
            PROCESS_STATE_ZOMBIE
        } else {
            PROCESS_STATE_ACTIVE
        },
        running_time: time::uptime_s().saturating_sub(process.creation_time_s()),
        // One tick per timer interrupt, nominally a millisecond.
        active_us: process.active_ticks() * 1_000,
        used_mem_kib: process
            .space()
            .map(|space| (space.used_physical() / 1024) as u64)
            .unwrap_or(0),
        ..ProcessInfo::default()
    };
    {
        let creds = process.creds();
        pinfo.uid = creds.uid;
        pinfo.gid = creds.gid;
    }
    let name = process.name();
    let bytes = name.as_bytes();
    let n = bytes.len().min(PROCESS_NAME_LEN - 1);
    pinfo.name[..n].copy_from_slice(&bytes[..n]);
    pinfo
}

pub(super) fn sys_get_process_info(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let Some(target) = sched::find_process(regs.arg0()) else {
        return done(-EINVAL);
    };
    try_sys!(write_struct(&space, regs.arg1(), &fill_process_info(&target)));
    done(0)
}

/// Advance `*pid` to the next live process and fill its info. Returns 1
/// past the last process.
pub(super) fn sys_get_next_process_info(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let pid: u64 = try_sys!(read_struct(&space, regs.arg0()));

    let Some(next) = sched::next_pid_after(pid) else {
        return done(1);
    };
    let Some(target) = sched::find_process(next) else {
        return done(-EINVAL);
    };
    try_sys!(write_struct(&space, regs.arg0(), &next));
    try_sys!(write_struct(&space, regs.arg1(), &fill_process_info(&target)));
    done(0)
}

pub(super) fn sys_spawn_thread(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let tid = sched::spawn_thread(&proc, regs.arg0(), regs.arg1());
    done(tid as isize)
}

pub(super) fn sys_exit_thread(_regs: &RegisterContext) -> SyscallFuture {
    sched::exit_current_thread();
    done(0)
}

pub(super) fn sys_futex_wake(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let addr = regs.arg0();
    // The address must at least be mapped for reading.
    let _: i32 = try_sys!(read_struct(&space, addr));

    let woken = {
        let mut futexes = proc.futexes();
        futexes.get_mut(&addr).and_then(|queue| queue.pop_front())
    };
    if let Some(blocker) = woken {
        blocker.wake();
    }
    done(0)
}

/// Wait on a futex word while it still holds `expected`.
pub(super) fn sys_futex_wait(regs: &RegisterContext) -> SyscallFuture {
    let addr = regs.arg0();
    let expected = regs.arg1() as i32;
    Box::pin(async move {
        let proc = current();
        let space = match current_space(&proc) {
            Ok(space) => space,
            Err(e) => return e,
        };
        let value: i32 = match read_struct(&space, addr) {
            Ok(value) => value,
            Err(e) => return e,
        };
        if value != expected {
            return 0;
        }

        let blocker = Blocker::new();
        proc.futexes()
            .entry(addr)
            .or_default()
            .push_back(blocker.clone());

        let wait_blocker = blocker.clone();
        let outcome = park_until(blocker.clone(), None, move || {
            wait_blocker.has_fired().then_some(())
        })
        .await;
        match outcome {
            WaitOutcome::Complete(()) => 0,
            WaitOutcome::Interrupted => {
                let mut futexes = proc.futexes();
                if let Some(queue) = futexes.get_mut(&addr) {
                    queue.retain(|b| !Arc::ptr_eq(b, &blocker));
                }
                -EINTR
            }
            WaitOutcome::TimedOut => 0,
        }
    })
}

/// Interrupt a blocked sibling thread; its wait returns `EINTR`.
pub(super) fn sys_interrupt_thread(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let tid = regs.arg0() as i64;
    if tid < 0 || tid as usize >= proc.thread_slots() {
        return done(-EINVAL);
    }
    let Some(thread) = proc.thread(tid as u32) else {
        return done(-ESRCH);
    };
    thread.interrupt();
    done(0)
}

pub(super) fn sys_load_kernel_module(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    if proc.creds().euid != 0 {
        return done(-EPERM);
    }
    let space = try_sys!(current_space(&proc));
    let _path = try_sys!(read_string(&space, regs.arg0()));
    // Module loading belongs to the external module manager.
    done(-ENOSYS)
}

pub(super) fn sys_unload_kernel_module(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    if proc.creds().euid != 0 {
        return done(-EPERM);
    }
    let space = try_sys!(current_space(&proc));
    let _name = try_sys!(read_string(&space, regs.arg0()));
    done(-ENOSYS)
}

/// Clone the calling process: copy-on-write address space, duplicated
/// descriptor table, and a copy of the caller's register state returning 0
/// in the child.
pub(super) fn sys_fork(_regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let thread = sched::current_thread().expect("fork from a running thread");
    let Some(space) = proc.space() else {
        return done(-EFAULT);
    };

    let child = sched::create_process(&proc.name(), Some(&proc));
    child.set_space(space.clone_cow());
    child.set_fds(proc.fds().duplicate_table());
    child.set_working_dir(&proc.working_dir());
    {
        let creds = *proc.creds();
        *child.creds() = creds;
    }
    proc.add_child(child.clone());

    let mut ctx = thread.context();
    ctx.rax = 0;
    let child_thread = child.add_thread(ctx);
    child_thread.copy_fx_state_from(&thread);
    sched::start_thread(&child_thread);

    done(child.pid() as isize)
}
