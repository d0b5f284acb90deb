//! File, descriptor, and readiness-multiplex syscalls.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use log::warn;

use opal_abi::errno::{
    EAGAIN, EBADF, EFAULT, EINTR, EINVAL, ENOENT, ENOSYS, ENOTDIR, ENOTEMPTY, ENOTTY,
};
use opal_abi::fcntl::{
    OpenFlags, FIOCLEX, O_ACCMODE, O_RDONLY, SEEK_CUR, SEEK_END, SEEK_SET,
};
use opal_abi::poll::{FdSet, PollFd, TimeSpec, POLLIN, POLLNVAL, POLLOUT, FD_SETSIZE};
use opal_abi::stat::{DirEnt, Stat};

use crate::fs::{self, FsError, FsNode, NodeType};
use crate::object::Watcher;
use crate::process::FileDescriptor;
use crate::sched::{park_until, Blocker, WaitOutcome};
use crate::time;

use super::user_ptr::{read_bytes, read_string, read_struct, write_bytes, write_struct};
use super::{current, current_space, done, try_sys, RegisterContext, SyscallFuture};

/// Cap on a single read/write transfer through the kernel bounce buffer.
/// Short transfers are success, so capping is invisible to correct callers.
const MAX_IO_SIZE: usize = 0x40_0000;

/// Upper bound on a poll set; well beyond any descriptor table we build.
const MAX_POLL_FDS: usize = 4096;

fn descriptor(proc: &Arc<crate::process::Process>, fd: usize) -> Result<FileDescriptor, isize> {
    proc.fds().get(fd).cloned().ok_or(-EBADF)
}

/// Wait for `node` to become readable, park-and-retry on `WouldBlock`.
async fn read_blocking(
    node: Arc<dyn FsNode>,
    offset: u64,
    len: usize,
    nonblock: bool,
) -> Result<Vec<u8>, isize> {
    loop {
        if node.can_read() {
            let mut buf = vec![0u8; len];
            match node.read(offset, &mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(FsError::WouldBlock) => {}
                Err(e) => return Err(-e.errno()),
            }
        }
        if nonblock {
            return Err(-EAGAIN);
        }

        let watcher = Watcher::new();
        watcher.watch_node(&node, POLLIN as u32);
        let probe = node.clone();
        match park_until(watcher.blocker().clone(), None, move || {
            probe.can_read().then_some(())
        })
        .await
        {
            WaitOutcome::Complete(()) => continue,
            WaitOutcome::Interrupted | WaitOutcome::TimedOut => return Err(-EINTR),
        }
    }
}

/// Wait for `node` to accept a write; a partial write is success.
async fn write_blocking(
    node: Arc<dyn FsNode>,
    offset: u64,
    data: Vec<u8>,
    nonblock: bool,
) -> Result<usize, isize> {
    loop {
        if node.can_write() {
            match node.write(offset, &data) {
                Ok(n) => return Ok(n),
                Err(FsError::WouldBlock) => {}
                Err(e) => return Err(-e.errno()),
            }
        }
        if nonblock {
            return Err(-EAGAIN);
        }

        let watcher = Watcher::new();
        watcher.watch_node(&node, POLLOUT as u32);
        let probe = node.clone();
        match park_until(watcher.blocker().clone(), None, move || {
            probe.can_write().then_some(())
        })
        .await
        {
            WaitOutcome::Complete(()) => continue,
            WaitOutcome::Interrupted | WaitOutcome::TimedOut => return Err(-EINTR),
        }
    }
}

pub(super) fn sys_read(regs: &RegisterContext) -> SyscallFuture {
    let fd = regs.arg0() as usize;
    let buf_addr = regs.arg1();
    let count = regs.arg2() as usize;
    Box::pin(async move {
        let proc = current();
        let space = match current_space(&proc) {
            Ok(space) => space,
            Err(e) => return e,
        };
        let descriptor = match descriptor(&proc, fd) {
            Ok(d) => d,
            Err(e) => {
                warn!("read: invalid file descriptor {fd}");
                return e;
            }
        };

        let count = count.min(MAX_IO_SIZE);
        let data = match read_blocking(
            descriptor.node.clone(),
            descriptor.pos,
            count,
            descriptor.is_nonblocking(),
        )
        .await
        {
            Ok(data) => data,
            Err(e) => return e,
        };

        if let Err(e) = write_bytes(&space, buf_addr, &data) {
            return e;
        }
        if let Some(d) = proc.fds().get_mut(fd) {
            d.pos += data.len() as u64;
        }
        data.len() as isize
    })
}

pub(super) fn sys_write(regs: &RegisterContext) -> SyscallFuture {
    let fd = regs.arg0() as usize;
    let buf_addr = regs.arg1();
    let count = regs.arg2() as usize;
    Box::pin(async move {
        let proc = current();
        let space = match current_space(&proc) {
            Ok(space) => space,
            Err(e) => return e,
        };
        let descriptor = match descriptor(&proc, fd) {
            Ok(d) => d,
            Err(e) => {
                warn!("write: invalid file descriptor {fd}");
                return e;
            }
        };

        let count = count.min(MAX_IO_SIZE);
        let data = match read_bytes(&space, buf_addr, count) {
            Ok(data) => data,
            Err(e) => return e,
        };

        let offset = if descriptor.flags().contains(OpenFlags::APPEND) {
            descriptor.node.size()
        } else {
            descriptor.pos
        };
        let written = match write_blocking(
            descriptor.node.clone(),
            offset,
            data,
            descriptor.is_nonblocking(),
        )
        .await
        {
            Ok(n) => n,
            Err(e) => return e,
        };

        if let Some(d) = proc.fds().get_mut(fd) {
            d.pos = offset + written as u64;
        }
        written as isize
    })
}

pub(super) fn sys_open(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let path = try_sys!(read_string(&space, regs.arg0()));
    let flags = regs.arg1() as u32;
    let mode = OpenFlags::from_bits_truncate(flags);
    let cwd = proc.working_dir();

    let mut node = fs::resolve_path(&path, &cwd, !mode.contains(OpenFlags::NOFOLLOW));
    if node.is_none() && mode.contains(OpenFlags::CREAT) {
        let Some(parent) = fs::resolve_parent(&path, &cwd) else {
            warn!("open: cannot resolve parent directory of {path}");
            return done(-ENOENT);
        };
        if let Err(e) = parent.create(fs::base_name(&path), false) {
            return done(-e.errno());
        }
        node = fs::resolve_path(&path, &cwd, !mode.contains(OpenFlags::NOFOLLOW));
    }
    let Some(node) = node else {
        return done(-ENOENT);
    };

    if mode.contains(OpenFlags::DIRECTORY) && node.node_type() != NodeType::Directory {
        return done(-ENOTDIR);
    }
    if mode.contains(OpenFlags::TRUNC) && flags & O_ACCMODE != O_RDONLY {
        if let Err(e) = node.truncate(0) {
            return done(-e.errno());
        }
    }

    let mut descriptor = FileDescriptor::open(node, flags);
    if mode.contains(OpenFlags::APPEND) {
        descriptor.pos = descriptor.node.size();
    }
    let fd = proc.fds().allocate(descriptor);
    done(fd as isize)
}

pub(super) fn sys_close(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let result = proc.fds().close(regs.arg0() as usize);
    match result {
        Ok(()) => done(0),
        Err(()) => done(-EBADF),
    }
}

pub(super) fn sys_link(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let old_path = try_sys!(read_string(&space, regs.arg0()));
    let new_path = try_sys!(read_string(&space, regs.arg1()));
    let cwd = proc.working_dir();

    let Some(target) = fs::resolve_path(&old_path, &cwd, true) else {
        warn!("link: could not resolve {old_path}");
        return done(-ENOENT);
    };
    let Some(parent) = fs::resolve_parent(&new_path, &cwd) else {
        warn!("link: could not resolve {new_path}");
        return done(-ENOENT);
    };
    if parent.node_type() != NodeType::Directory {
        return done(-ENOTDIR);
    }
    match parent.link(fs::base_name(&new_path), &target) {
        Ok(()) => done(0),
        Err(e) => done(-e.errno()),
    }
}

pub(super) fn sys_unlink(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let path = try_sys!(read_string(&space, regs.arg0()));
    let cwd = proc.working_dir();

    let Some(parent) = fs::resolve_parent(&path, &cwd) else {
        warn!("unlink: could not resolve {path}");
        return done(-EINVAL);
    };
    if parent.node_type() != NodeType::Directory {
        return done(-ENOTDIR);
    }
    match parent.unlink(fs::base_name(&path), false) {
        Ok(()) => done(0),
        Err(e) => done(-e.errno()),
    }
}

pub(super) fn sys_chmod(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let path = try_sys!(read_string(&space, regs.arg0()));
    if fs::resolve_path(&path, &proc.working_dir(), true).is_none() {
        return done(-ENOENT);
    }
    // Permission bits are not enforced yet; the resolve is the contract.
    done(0)
}

fn fill_stat(node: &Arc<dyn FsNode>) -> Stat {
    Stat {
        st_ino: node.inode(),
        st_mode: node.node_type().mode_bits(),
        st_uid: node.uid(),
        st_size: node.size() as i64,
        ..Default::default()
    }
}

/// Arguments are (stat, fd), in that order.
pub(super) fn sys_fstat(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let descriptor = match descriptor(&proc, regs.arg1() as usize) {
        Ok(d) => d,
        Err(e) => {
            warn!("fstat: invalid file descriptor {}", regs.arg1());
            return done(e);
        }
    };
    try_sys!(write_struct(&space, regs.arg0(), &fill_stat(&descriptor.node)));
    done(0)
}

/// Arguments are (stat, path, flags), in that order.
pub(super) fn sys_stat(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let path = try_sys!(read_string(&space, regs.arg1()));
    let follow = regs.arg2() & opal_abi::fcntl::AT_SYMLINK_NOFOLLOW == 0;
    let Some(node) = fs::resolve_path(&path, &proc.working_dir(), follow) else {
        return done(-ENOENT);
    };
    try_sys!(write_struct(&space, regs.arg0(), &fill_stat(&node)));
    done(0)
}

pub(super) fn sys_lseek(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let fd = regs.arg0() as usize;
    let mut fds = proc.fds();
    let Some(descriptor) = fds.get_mut(fd) else {
        warn!("lseek: invalid file descriptor {fd}");
        return done(-EBADF);
    };
    match regs.arg2() as usize {
        SEEK_SET => {
            descriptor.pos = regs.arg1();
            done(descriptor.pos as isize)
        }
        SEEK_CUR => done(descriptor.pos as isize),
        SEEK_END => {
            descriptor.pos = descriptor.node.size();
            done(descriptor.pos as isize)
        }
        whence => {
            warn!("lseek: invalid mode {whence}");
            done(-EINVAL)
        }
    }
}

pub(super) fn sys_mount(_regs: &RegisterContext) -> SyscallFuture {
    done(0)
}

pub(super) fn sys_mkdir(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let path = try_sys!(read_string(&space, regs.arg0()));
    let cwd = proc.working_dir();

    let Some(parent) = fs::resolve_parent(&path, &cwd) else {
        warn!("mkdir: could not resolve {path}");
        return done(-EINVAL);
    };
    if parent.node_type() != NodeType::Directory {
        return done(-ENOTDIR);
    }
    match parent.create(fs::base_name(&path), true) {
        Ok(_) => done(0),
        Err(e) => done(-e.errno()),
    }
}

pub(super) fn sys_rmdir(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let path = try_sys!(read_string(&space, regs.arg0()));
    let cwd = proc.working_dir();

    let Some(node) = fs::resolve_path(&path, &cwd, true) else {
        return done(-ENOENT);
    };
    if node.node_type() != NodeType::Directory {
        return done(-ENOTDIR);
    }
    match node.read_dir(0) {
        Ok(Some(_)) => return done(-ENOTEMPTY),
        Ok(None) => {}
        Err(e) => return done(-e.errno()),
    }
    let Some(parent) = fs::resolve_parent(&path, &cwd) else {
        return done(-ENOENT);
    };
    match parent.unlink(fs::base_name(&path), true) {
        Ok(()) => done(0),
        Err(e) => done(-e.errno()),
    }
}

pub(super) fn sys_rename(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let old_path = try_sys!(read_string(&space, regs.arg0()));
    let new_path = try_sys!(read_string(&space, regs.arg1()));
    let cwd = proc.working_dir();

    let (Some(old_parent), Some(new_parent)) = (
        fs::resolve_parent(&old_path, &cwd),
        fs::resolve_parent(&new_path, &cwd),
    ) else {
        return done(-ENOENT);
    };
    let Some(vfs) = fs::vfs() else {
        return done(-ENOSYS);
    };
    match vfs.rename(
        &old_parent,
        fs::base_name(&old_path),
        &new_parent,
        fs::base_name(&new_path),
    ) {
        Ok(()) => done(0),
        Err(e) => done(-e.errno()),
    }
}

fn read_dir_entry(
    proc: &Arc<crate::process::Process>,
    space: &crate::memory::AddressSpace,
    fd: usize,
    dirent_addr: u64,
    index: usize,
) -> Result<isize, isize> {
    let descriptor = descriptor(proc, fd)?;
    if descriptor.node.node_type() != NodeType::Directory {
        return Err(-ENOTDIR);
    }
    match descriptor.node.read_dir(index).map_err(|e| -e.errno())? {
        Some(entry) => {
            let mut out = DirEnt {
                d_ino: entry.inode,
                d_type: entry.node_type.mode_bits(),
                ..Default::default()
            };
            let name = entry.name.as_bytes();
            let n = name.len().min(out.name.len() - 1);
            out.name[..n].copy_from_slice(&name[..n]);
            write_struct(space, dirent_addr, &out)?;
            Ok(1)
        }
        None => Ok(0),
    }
}

/// Read the directory entry at the descriptor's position, advancing it.
pub(super) fn sys_readdir_next(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let fd = regs.arg0() as usize;
    let index = {
        let mut fds = proc.fds();
        let Some(descriptor) = fds.get_mut(fd) else {
            return done(-EBADF);
        };
        let index = descriptor.pos;
        descriptor.pos += 1;
        index as usize
    };
    match read_dir_entry(&proc, &space, fd, regs.arg1(), index) {
        Ok(r) => done(r),
        Err(e) => done(e),
    }
}

/// Read the directory entry at an explicit index.
pub(super) fn sys_readdir(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    match read_dir_entry(
        &proc,
        &space,
        regs.arg0() as usize,
        regs.arg1(),
        regs.arg2() as usize,
    ) {
        Ok(r) => done(r),
        Err(e) => done(e),
    }
}

pub(super) fn sys_pread(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let descriptor = match descriptor(&proc, regs.arg0() as usize) {
        Ok(d) => d,
        Err(e) => {
            warn!("pread: invalid file descriptor {}", regs.arg0());
            return done(e);
        }
    };
    let count = (regs.arg2() as usize).min(MAX_IO_SIZE);
    let mut buf = vec![0u8; count];
    match descriptor.node.read(regs.arg4(), &mut buf) {
        Ok(n) => {
            buf.truncate(n);
            try_sys!(write_bytes(&space, regs.arg1(), &buf));
            done(n as isize)
        }
        Err(e) => done(-e.errno()),
    }
}

pub(super) fn sys_pwrite(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let descriptor = match descriptor(&proc, regs.arg0() as usize) {
        Ok(d) => d,
        Err(e) => {
            warn!("pwrite: invalid file descriptor {}", regs.arg0());
            return done(e);
        }
    };
    let count = (regs.arg2() as usize).min(MAX_IO_SIZE);
    let data = try_sys!(read_bytes(&space, regs.arg1(), count));
    match descriptor.node.write(regs.arg4(), &data) {
        Ok(n) => done(n as isize),
        Err(e) => done(-e.errno()),
    }
}

pub(super) fn sys_ioctl(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let fd = regs.arg0() as usize;
    let request = regs.arg1();
    let arg = regs.arg2();
    let result_ptr = regs.arg3();

    if request == FIOCLEX {
        let mut fds = proc.fds();
        let Some(descriptor) = fds.get_mut(fd) else {
            return done(-EBADF);
        };
        descriptor.mode |= OpenFlags::CLOEXEC.bits();
        return done(0);
    }

    let descriptor = match descriptor(&proc, fd) {
        Ok(d) => d,
        Err(e) => {
            warn!("ioctl: invalid file descriptor {fd}");
            return done(e);
        }
    };
    match descriptor.node.ioctl(request, arg) {
        Ok(ret) => {
            if result_ptr != 0 && ret > 0 {
                try_sys!(write_struct(&space, result_ptr, &(ret as i32)));
            }
            done(ret)
        }
        Err(FsError::NotSupported) => done(-ENOTTY),
        Err(e) => done(-e.errno()),
    }
}

pub(super) fn sys_readlink(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let path = try_sys!(read_string(&space, regs.arg0()));
    let buf_len = (regs.arg2() as usize).min(opal_abi::PATH_MAX);

    let Some(node) = fs::resolve_path(&path, &proc.working_dir(), false) else {
        return done(-ENOENT);
    };
    let mut buf = vec![0u8; buf_len];
    match node.read_link(&mut buf) {
        Ok(n) => {
            try_sys!(write_bytes(&space, regs.arg1(), &buf[..n]));
            done(n as isize)
        }
        Err(e) => done(-e.errno()),
    }
}

/// Duplicate a descriptor; `arg2` is an explicit target fd or negative to
/// allocate the lowest unused one.
pub(super) fn sys_dup(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let fd = regs.arg0() as usize;
    let requested = regs.arg2() as i64;
    if requested >= 0 && requested as usize == fd {
        return done(-EINVAL);
    }

    let descriptor = match descriptor(&proc, fd) {
        Ok(d) => d,
        Err(e) => return done(e),
    };
    let mut duplicate = descriptor.duplicate();
    if regs.arg1() as u32 & OpenFlags::CLOEXEC.bits() != 0 {
        duplicate.mode |= OpenFlags::CLOEXEC.bits();
    }

    let mut fds = proc.fds();
    if requested >= 0 {
        fds.replace(requested as usize, duplicate);
        done(requested as isize)
    } else {
        done(fds.allocate(duplicate) as isize)
    }
}

pub(super) fn sys_get_file_status_flags(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    match descriptor(&proc, regs.arg0() as usize) {
        Ok(d) => done(d.mode as isize),
        Err(e) => done(e),
    }
}

/// Only `O_APPEND` and `O_NONBLOCK` may change.
pub(super) fn sys_set_file_status_flags(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let mut fds = proc.fds();
    let Some(descriptor) = fds.get_mut(regs.arg0() as usize) else {
        return done(-EBADF);
    };
    let mask = (OpenFlags::APPEND | OpenFlags::NONBLOCK).bits();
    descriptor.mode = (descriptor.mode & !mask) | (regs.arg1() as u32 & mask);
    done(0)
}

pub(super) fn sys_pipe(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let flags = regs.arg1() as u32;
    if flags & !(OpenFlags::CLOEXEC | OpenFlags::NONBLOCK).bits() != 0 {
        return done(-EINVAL);
    }
    let Some(vfs) = fs::vfs() else {
        return done(-ENOSYS);
    };
    let (read_node, write_node) = match vfs.create_pipe() {
        Ok(pair) => pair,
        Err(e) => return done(-e.errno()),
    };

    let read_fd = proc.fds().allocate(FileDescriptor::open(read_node, flags));
    let write_fd = proc.fds().allocate(FileDescriptor::open(write_node, flags));
    try_sys!(write_struct(&space, regs.arg0(), &[read_fd as i32, write_fd as i32]));
    done(0)
}

fn poll_scan(entries: &mut [PollFd], nodes: &[Option<Arc<dyn FsNode>>]) -> usize {
    let mut count = 0;
    for (entry, node) in entries.iter_mut().zip(nodes) {
        entry.revents = 0;
        if entry.fd < 0 {
            continue;
        }
        match node {
            None => {
                entry.revents = POLLNVAL;
                count += 1;
            }
            Some(node) => {
                let revents = node.poll_events(entry.events);
                if revents != 0 {
                    entry.revents = revents;
                    count += 1;
                }
            }
        }
    }
    count
}

/// `poll(fds, nfds, timeout_us)`: timeout zero polls once, negative waits
/// forever.
pub(super) fn sys_poll(regs: &RegisterContext) -> SyscallFuture {
    let fds_addr = regs.arg0();
    let nfds = regs.arg1() as usize;
    let timeout = regs.arg2() as i64;
    Box::pin(async move {
        let proc = current();
        let space = match current_space(&proc) {
            Ok(space) => space,
            Err(e) => return e,
        };
        if nfds > MAX_POLL_FDS {
            return -EINVAL;
        }

        let mut entries: Vec<PollFd> = Vec::with_capacity(nfds);
        for index in 0..nfds {
            match read_struct::<PollFd>(&space, fds_addr + (index * 8) as u64) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!("poll: invalid pollfd array");
                    return e;
                }
            }
        }

        let nodes: Vec<Option<Arc<dyn FsNode>>> = entries
            .iter()
            .map(|entry| {
                if entry.fd < 0 {
                    None
                } else {
                    proc.fds().get(entry.fd as usize).map(|d| d.node.clone())
                }
            })
            .collect();

        let deadline = if timeout > 0 {
            Some(time::uptime_us() + timeout as u64)
        } else {
            None
        };

        let result = loop {
            let count = poll_scan(&mut entries, &nodes);
            if count > 0 || timeout == 0 {
                break count as isize;
            }

            let watcher = Watcher::new();
            for (entry, node) in entries.iter().zip(&nodes) {
                if let Some(node) = node {
                    watcher.watch_node(node, entry.events as u32);
                }
            }
            let probe_nodes = nodes.clone();
            let probe_events: Vec<i16> = entries.iter().map(|e| e.events).collect();
            let outcome = park_until(watcher.blocker().clone(), deadline, move || {
                probe_nodes
                    .iter()
                    .zip(&probe_events)
                    .any(|(node, &events)| {
                        node.as_ref()
                            .map(|n| n.poll_events(events) != 0)
                            .unwrap_or(false)
                    })
                    .then_some(())
            })
            .await;
            match outcome {
                WaitOutcome::Complete(()) => continue,
                WaitOutcome::Interrupted => return -EINTR,
                WaitOutcome::TimedOut => break 0,
            }
        };

        for (index, entry) in entries.iter().enumerate() {
            if write_struct(&space, fds_addr + (index * 8) as u64, entry).is_err() {
                return -EFAULT;
            }
        }
        result
    })
}

/// `select(nfds, readfds, writefds, exceptfds, timeout)`.
pub(super) fn sys_select(regs: &RegisterContext) -> SyscallFuture {
    let nfds = (regs.arg0() as usize).min(FD_SETSIZE);
    let read_addr = regs.arg1();
    let write_addr = regs.arg2();
    let except_addr = regs.arg3();
    let timeout_addr = regs.arg4();
    Box::pin(async move {
        let proc = current();
        let space = match current_space(&proc) {
            Ok(space) => space,
            Err(e) => return e,
        };

        let read_set = if read_addr != 0 {
            match read_struct::<FdSet>(&space, read_addr) {
                Ok(set) => Some(set),
                Err(e) => return e,
            }
        } else {
            None
        };
        let write_set = if write_addr != 0 {
            match read_struct::<FdSet>(&space, write_addr) {
                Ok(set) => Some(set),
                Err(e) => return e,
            }
        } else {
            None
        };
        // Exception sets are accepted but not implemented by any node.
        let _except_set = if except_addr != 0 {
            read_struct::<FdSet>(&space, except_addr).ok()
        } else {
            None
        };

        let timeout_us = if timeout_addr != 0 {
            match read_struct::<TimeSpec>(&space, timeout_addr) {
                Ok(ts) => ts.as_micros(),
                Err(e) => return e,
            }
        } else {
            0
        };

        let mut read_fds: Vec<(usize, Arc<dyn FsNode>)> = Vec::new();
        let mut write_fds: Vec<(usize, Arc<dyn FsNode>)> = Vec::new();
        for fd in 0..nfds {
            let wants_read = read_set.as_ref().map(|s| s.is_set(fd)).unwrap_or(false);
            let wants_write = write_set.as_ref().map(|s| s.is_set(fd)).unwrap_or(false);
            if !wants_read && !wants_write {
                continue;
            }
            let Some(node) = proc.fds().get(fd).map(|d| d.node.clone()) else {
                return -EBADF;
            };
            if wants_read {
                read_fds.push((fd, node.clone()));
            }
            if wants_write {
                write_fds.push((fd, node));
            }
        }

        let deadline = if timeout_us != 0 {
            Some(time::uptime_us() + timeout_us)
        } else {
            None
        };

        let mut out_read = FdSet::default();
        let mut out_write = FdSet::default();
        let count = loop {
            out_read.clear_all();
            out_write.clear_all();
            let mut count = 0;
            for (fd, node) in &read_fds {
                if node.can_read() {
                    out_read.set(*fd);
                    count += 1;
                }
            }
            for (fd, node) in &write_fds {
                if node.can_write() {
                    out_write.set(*fd);
                    count += 1;
                }
            }
            if count > 0 {
                break count;
            }

            let watcher = Watcher::new();
            for (_, node) in &read_fds {
                watcher.watch_node(node, POLLIN as u32);
            }
            for (_, node) in &write_fds {
                watcher.watch_node(node, POLLOUT as u32);
            }
            let probe_read = read_fds.clone();
            let probe_write = write_fds.clone();
            let outcome = park_until(watcher.blocker().clone(), deadline, move || {
                (probe_read.iter().any(|(_, n)| n.can_read())
                    || probe_write.iter().any(|(_, n)| n.can_write()))
                .then_some(())
            })
            .await;
            match outcome {
                WaitOutcome::Complete(()) => continue,
                WaitOutcome::Interrupted => return -EINTR,
                WaitOutcome::TimedOut => break 0,
            }
        };

        if read_addr != 0 {
            if let Err(e) = write_struct(&space, read_addr, &out_read) {
                return e;
            }
        }
        if write_addr != 0 {
            if let Err(e) = write_struct(&space, write_addr, &out_write) {
                return e;
            }
        }
        if except_addr != 0 {
            if let Err(e) = write_struct(&space, except_addr, &FdSet::default()) {
                return e;
            }
        }
        count as isize
    })
}

/// Wait until a socket-style condition holds or the wait is interrupted.
/// Used by socket syscalls that park on the socket's watch list.
pub(super) async fn wait_socket_event(
    socket: &Arc<crate::net::Socket>,
    events: i16,
    mut ready: impl FnMut() -> bool + Send + Unpin,
) -> Result<(), isize> {
    let blocker = Blocker::new();
    socket.watch_list().add(&blocker, events as u32);
    let outcome = park_until(blocker.clone(), None, move || ready().then_some(())).await;
    socket.watch_list().remove(&blocker);
    match outcome {
        WaitOutcome::Complete(()) => Ok(()),
        WaitOutcome::Interrupted | WaitOutcome::TimedOut => Err(-EINTR),
    }
}
