//! Process lifecycle scenarios: fork, exec, waitpid, descriptors.

mod common;

use opal_abi::errno::{EBADF, ECHILD, EINTR};
use opal_abi::fcntl::OpenFlags;
use opal_abi::syscalls::*;

use opal_kernel::sched;
use opal_kernel::syscall::Disposition;
use opal_kernel::testing::{
    self, fixture, resume, spawn_process, sys, sys_ok, ualloc, uread, ustr, uwrite,
};

#[test]
fn fork_preserves_the_child_snapshot_copy_on_write() {
    let _fx = fixture();
    let (parent, thread) = spawn_process("parent");

    let addr = ualloc(&parent, 4096);
    uwrite(&parent, addr, b"A");

    let child_pid = sys_ok(&parent, &thread, SYS_FORK, [0; 6]);
    assert!(child_pid > 0);
    let child = sched::find_process(child_pid as u64).expect("child exists");

    // The child sees the pre-fork byte.
    let child_space = child.space().expect("child space");
    let mut byte = [0u8; 1];
    child_space.copy_from_user(addr, &mut byte).unwrap();
    assert_eq!(&byte, b"A");

    // Parent writes after the fork; the child still reads the snapshot.
    uwrite(&parent, addr, b"B");
    child_space.copy_from_user(addr, &mut byte).unwrap();
    assert_eq!(&byte, b"A");
    assert_eq!(uread(&parent, addr, 1), b"B");

    // The child returns 0 from fork.
    let child_thread = child.main_thread().expect("child main thread");
    assert_eq!(child_thread.context().rax, 0);
}

#[test]
fn fork_duplicates_descriptors_with_independent_positions() {
    let fx = fixture();
    fx.ramfs().add_file("/data", b"abcdef");
    let (parent, thread) = spawn_process("parent");

    let path = ustr(&parent, "/data");
    let fd = sys_ok(&parent, &thread, SYS_OPEN, [path, 0, 0, 0, 0, 0]);
    assert!(fd >= 0);

    let buf = ualloc(&parent, 16);
    assert_eq!(sys_ok(&parent, &thread, SYS_READ, [fd as u64, buf, 2, 0, 0, 0]), 2);

    let child_pid = sys_ok(&parent, &thread, SYS_FORK, [0; 6]);
    let child = sched::find_process(child_pid as u64).expect("child exists");
    let child_thread = child.main_thread().expect("child thread");

    // The child's descriptor starts at the parent's position but advances
    // independently.
    let child_buf = ualloc(&child, 16);
    assert_eq!(
        sys_ok(&child, &child_thread, SYS_READ, [fd as u64, child_buf, 2, 0, 0, 0]),
        2
    );
    assert_eq!(uread(&child, child_buf, 2), b"cd");

    assert_eq!(sys_ok(&parent, &thread, SYS_READ, [fd as u64, buf, 2, 0, 0, 0]), 2);
    assert_eq!(uread(&parent, buf, 2), b"cd");
}

#[test]
fn waitpid_returns_each_child_exactly_once() {
    let _fx = fixture();
    let (parent, thread) = spawn_process("parent");

    let child_pid = sys_ok(&parent, &thread, SYS_FORK, [0; 6]) as u64;
    let child = sched::find_process(child_pid).expect("child exists");
    let child_thread = child.main_thread().expect("child thread");

    // Parent blocks in waitpid(-1).
    let disposition = sys(&parent, &thread, SYS_WAITPID, [u64::MAX, 0, 0, 0, 0, 0]);
    assert_eq!(disposition, Disposition::Parked);

    // Child exits; the watcher fires and the wait completes with its pid.
    assert_eq!(sys_ok(&child, &child_thread, SYS_EXIT, [0; 6]), 0);
    assert_eq!(resume(&parent, &thread), Some(child_pid as isize));

    // The pid is reaped: a second wait has no children left.
    assert_eq!(
        sys_ok(&parent, &thread, SYS_WAITPID, [u64::MAX, 0, 0, 0, 0, 0]),
        -ECHILD
    );
    assert!(sched::find_process(child_pid).is_none());
}

#[test]
fn waitpid_with_wnohang_returns_zero_when_nothing_is_ready() {
    let _fx = fixture();
    let (parent, thread) = spawn_process("parent");
    let child_pid = sys_ok(&parent, &thread, SYS_FORK, [0; 6]) as u64;

    assert_eq!(
        sys_ok(&parent, &thread, SYS_WAITPID, [u64::MAX, 0, 1, 0, 0, 0]),
        0
    );

    let child = sched::find_process(child_pid).expect("child exists");
    let child_thread = child.main_thread().expect("child thread");
    sys_ok(&child, &child_thread, SYS_EXIT, [0; 6]);

    assert_eq!(
        sys_ok(&parent, &thread, SYS_WAITPID, [u64::MAX, 0, 1, 0, 0, 0]),
        child_pid as isize
    );
}

#[test]
fn execve_replaces_the_image_and_reproduces_argv() {
    let fx = fixture();
    fx.ramfs()
        .add_file("/bin/app", &common::tiny_elf(&[0x90, 0xc3]));
    let (proc, thread) = spawn_process("shell");

    let path = ustr(&proc, "/bin/app");
    let argv0 = ustr(&proc, "app");
    let argv1 = ustr(&proc, "hello");
    let argv2 = ustr(&proc, "world");
    let env0 = ustr(&proc, "TERM=opal");
    let argv_array = ualloc(&proc, 4 * 8);
    uwrite(&proc, argv_array, &argv0.to_le_bytes());
    uwrite(&proc, argv_array + 8, &argv1.to_le_bytes());
    uwrite(&proc, argv_array + 16, &argv2.to_le_bytes());
    uwrite(&proc, argv_array + 24, &0u64.to_le_bytes());
    let envp_array = ualloc(&proc, 2 * 8);
    uwrite(&proc, envp_array, &env0.to_le_bytes());
    uwrite(&proc, envp_array + 8, &0u64.to_le_bytes());

    assert_eq!(
        sys_ok(&proc, &thread, SYS_EXECVE, [path, argv_array, envp_array, 0, 0, 0]),
        0
    );

    let ctx = thread.context();
    assert_eq!(ctx.rip, 0x40_0000 + 64 + 56);
    assert_eq!(ctx.rsp % 16, 0);
    assert_eq!(ctx.rdi, 3);

    // argc is at the stack pointer, the argv vector right above it.
    let argc = u64::from_le_bytes(uread(&proc, ctx.rsp, 8).try_into().unwrap());
    assert_eq!(argc, 3);
    let mut strings = Vec::new();
    for index in 0..3 {
        let ptr = u64::from_le_bytes(
            uread(&proc, ctx.rsp + 8 + index * 8, 8).try_into().unwrap(),
        );
        let bytes = uread(&proc, ptr, 16);
        let nul = bytes.iter().position(|&b| b == 0).unwrap();
        strings.push(String::from_utf8(bytes[..nul].to_vec()).unwrap());
    }
    assert_eq!(strings, ["app", "hello", "world"]);
    assert_eq!(proc.name(), "app");
}

#[test]
fn exec_closes_cloexec_descriptors() {
    let fx = fixture();
    fx.ramfs().add_file("/tmp/a", b"secret");
    fx.ramfs()
        .add_file("/bin/app", &common::tiny_elf(&[0xc3]));
    let (proc, thread) = spawn_process("shell");

    let path = ustr(&proc, "/tmp/a");
    let fd = sys_ok(
        &proc,
        &thread,
        SYS_OPEN,
        [path, OpenFlags::CLOEXEC.bits() as u64, 0, 0, 0, 0],
    );
    assert!(fd >= 0);

    let app = ustr(&proc, "/bin/app");
    let argv_array = ualloc(&proc, 8);
    uwrite(&proc, argv_array, &0u64.to_le_bytes());
    assert_eq!(
        sys_ok(&proc, &thread, SYS_EXECVE, [app, argv_array, argv_array, 0, 0, 0]),
        0
    );

    // A read on the closed descriptor fails with EBADF.
    let buf = ualloc(&proc, 8);
    assert_eq!(
        sys_ok(&proc, &thread, SYS_READ, [fd as u64, buf, 4, 0, 0, 0]),
        -EBADF
    );
}

#[test]
fn close_is_idempotent_in_the_errno_sense() {
    let fx = fixture();
    fx.ramfs().add_file("/f", b"x");
    let (proc, thread) = spawn_process("proc");

    let path = ustr(&proc, "/f");
    let fd = sys_ok(&proc, &thread, SYS_OPEN, [path, 0, 0, 0, 0, 0]);
    assert_eq!(sys_ok(&proc, &thread, SYS_CLOSE, [fd as u64, 0, 0, 0, 0, 0]), 0);
    assert_eq!(
        sys_ok(&proc, &thread, SYS_CLOSE, [fd as u64, 0, 0, 0, 0, 0]),
        -EBADF
    );
}

#[test]
fn dup_replaces_an_explicit_target() {
    let fx = fixture();
    fx.ramfs().add_file("/f", b"contents");
    let (proc, thread) = spawn_process("proc");

    let path = ustr(&proc, "/f");
    let fd = sys_ok(&proc, &thread, SYS_OPEN, [path, 0, 0, 0, 0, 0]) as u64;
    let target = 7u64;
    assert_eq!(
        sys_ok(&proc, &thread, SYS_DUP, [fd, 0, target, 0, 0, 0]),
        target as isize
    );

    let buf = ualloc(&proc, 8);
    assert_eq!(sys_ok(&proc, &thread, SYS_READ, [target, buf, 8, 0, 0, 0]), 8);
    assert_eq!(uread(&proc, buf, 8), b"contents");

    // Duplicating onto itself is rejected.
    assert_eq!(
        sys_ok(&proc, &thread, SYS_DUP, [fd, 0, fd, 0, 0, 0]),
        -opal_abi::errno::EINVAL
    );
}

#[test]
fn nanosleep_wakes_on_the_deadline_and_on_interrupt() {
    let fx = fixture();
    let (proc, thread) = spawn_process("sleeper");

    // 5 ms sleep parks the thread until the clock passes the deadline.
    let disposition = sys(&proc, &thread, SYS_NANOSLEEP, [5_000_000, 0, 0, 0, 0, 0]);
    assert_eq!(disposition, Disposition::Parked);
    assert_eq!(resume(&proc, &thread), None);
    fx.clock().advance(6_000);
    assert_eq!(resume(&proc, &thread), Some(0));

    // A second sleeper is interrupted by a sibling thread.
    let disposition = sys(&proc, &thread, SYS_NANOSLEEP, [1_000_000_000, 0, 0, 0, 0, 0]);
    assert_eq!(disposition, Disposition::Parked);
    let sibling = testing::add_main_thread(&proc);
    assert_eq!(
        sys_ok(&proc, &sibling, SYS_INTERRUPT_THREAD, [0, 0, 0, 0, 0, 0]),
        0
    );
    assert_eq!(resume(&proc, &thread), Some(-EINTR));
}

#[test]
fn futex_wait_and_wake_pair_up() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("futexer");

    let futex = ualloc(&proc, 4);
    uwrite(&proc, futex, &7i32.to_le_bytes());

    // Value mismatch returns immediately.
    assert_eq!(sys_ok(&proc, &thread, SYS_FUTEX_WAIT, [futex, 8, 0, 0, 0, 0]), 0);

    // Matching value parks until a wake.
    let disposition = sys(&proc, &thread, SYS_FUTEX_WAIT, [futex, 7, 0, 0, 0, 0]);
    assert_eq!(disposition, Disposition::Parked);

    let waker = testing::add_main_thread(&proc);
    assert_eq!(sys_ok(&proc, &waker, SYS_FUTEX_WAKE, [futex, 0, 0, 0, 0, 0]), 0);
    assert_eq!(resume(&proc, &thread), Some(0));
}

#[test]
fn identity_syscalls_reflect_credentials() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("idproc");

    assert_eq!(sys_ok(&proc, &thread, SYS_GETUID, [0; 6]), 0);
    // Root may switch to an unprivileged uid, after which the switch back
    // is denied.
    assert_eq!(sys_ok(&proc, &thread, SYS_SETUID, [1000, 0, 0, 0, 0, 0]), 0);
    assert_eq!(sys_ok(&proc, &thread, SYS_GETUID, [0; 6]), 1000);
    assert_eq!(sys_ok(&proc, &thread, SYS_GETEUID, [0; 6]), 1000);
    assert_eq!(
        sys_ok(&proc, &thread, SYS_SETUID, [0, 0, 0, 0, 0, 0]),
        -opal_abi::errno::EPERM
    );

    // getpid reports through its pointer argument.
    let out = ualloc(&proc, 8);
    assert_eq!(sys_ok(&proc, &thread, SYS_GETPID, [out, 0, 0, 0, 0, 0]), 0);
    let pid = u64::from_le_bytes(uread(&proc, out, 8).try_into().unwrap());
    assert_eq!(pid, proc.pid());
}

#[test]
fn exec_spawns_a_child_process_with_shared_standard_descriptors() {
    let fx = fixture();
    fx.ramfs().add_file("/bin/tool", &common::tiny_elf(&[0xc3]));
    fx.ramfs().add_file("/dev/log", b"");
    let (shell, thread) = spawn_process("shell");

    // Give the shell a stdin/stdout/stderr triple.
    let log_path = ustr(&shell, "/dev/log");
    for expected in 0..3isize {
        assert_eq!(
            sys_ok(&shell, &thread, SYS_OPEN, [log_path, 0, 0, 0, 0, 0]),
            expected
        );
    }

    let path = ustr(&shell, "/bin/tool");
    let argv0 = ustr(&shell, "tool");
    let argv_array = ualloc(&shell, 8);
    uwrite(&shell, argv_array, &argv0.to_le_bytes());

    // EXEC_CHILD registers the new process as a child sharing fds 0..2.
    let child_pid = sys_ok(&shell, &thread, SYS_EXEC, [path, 1, argv_array, 1, 0, 0]);
    assert!(child_pid > 0);
    let child = sched::find_process(child_pid as u64).expect("child exists");
    assert_eq!(child.parent().map(|p| p.pid()), Some(shell.pid()));
    assert_eq!(child.name(), "tool");
    assert!(child.fds().get(0).is_some());
    assert!(child.fds().get(2).is_some());
    assert!(child.fds().get(3).is_none());

    // The spawned image starts at the executable's entry point.
    let child_thread = child.main_thread().expect("child thread");
    assert_eq!(child_thread.context().rip, 0x40_0000 + 64 + 56);

    // waitpid on the explicit pid reaps it after exit.
    let disposition = sys(&shell, &thread, SYS_WAITPID, [child_pid as u64, 0, 0, 0, 0, 0]);
    assert_eq!(disposition, Disposition::Parked);
    sys_ok(&child, &child_thread, SYS_EXIT, [0; 6]);
    assert_eq!(resume(&shell, &thread), Some(child_pid));
    assert!(sched::find_process(child_pid as u64).is_none());
}

#[test]
fn spawn_thread_creates_a_runnable_sibling() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("threads");

    let tid = sys_ok(
        &proc,
        &thread,
        SYS_SPAWN_THREAD,
        [0x40_1000, 0x7000_0000, 0, 0, 0, 0],
    );
    assert_eq!(tid, 1);
    let sibling = proc.thread(1).expect("spawned thread");
    let ctx = sibling.context();
    assert_eq!(ctx.rip, 0x40_1000);
    assert_eq!(ctx.rsp, 0x7000_0000);
    assert_eq!(proc.thread_count(), 2);
}

#[test]
fn retired_and_reserved_slots_fail_with_enosys() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("proc");

    for number in [SYS_CREATE, 15, SYS_MAP_FB, SYS_GRANT_PTY, SYS_DEVICE_MANAGEMENT] {
        assert_eq!(
            sys_ok(&proc, &thread, number, [0; 6]),
            -opal_abi::errno::ENOSYS
        );
    }
    // Unknown numbers are rejected the same way.
    assert_eq!(sys_ok(&proc, &thread, 12345, [0; 6]), -opal_abi::errno::ENOSYS);
}

#[test]
fn chdir_and_getcwd_round_trip() {
    let fx = fixture();
    fx.ramfs().add_dir("/home/user");
    let (proc, thread) = spawn_process("proc");

    let path = ustr(&proc, "/home/user");
    assert_eq!(sys_ok(&proc, &thread, SYS_CHDIR, [path, 0, 0, 0, 0, 0]), 0);

    let buf = ualloc(&proc, 64);
    assert_eq!(sys_ok(&proc, &thread, SYS_GET_CWD, [buf, 64, 0, 0, 0, 0]), 0);
    let cwd = uread(&proc, buf, 10);
    assert_eq!(&cwd, b"/home/user");

    // A too-small buffer reports 1, per the contract.
    assert_eq!(sys_ok(&proc, &thread, SYS_GET_CWD, [buf, 4, 0, 0, 0, 0]), 1);

    let missing = ustr(&proc, "/no/such/dir");
    assert_eq!(
        sys_ok(&proc, &thread, SYS_CHDIR, [missing, 0, 0, 0, 0, 0]),
        -opal_abi::errno::ENOENT
    );
}
