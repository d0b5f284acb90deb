//! Readiness multiplexing scenarios: poll, select, and blocking pipe I/O.

mod common;

use opal_abi::errno::EINTR;
use opal_abi::poll::POLLIN;
use opal_abi::syscalls::*;

use opal_kernel::syscall::Disposition;
use opal_kernel::testing::{
    self, fixture, resume, spawn_process, sys, sys_ok, ualloc, uread, ustr, uwrite,
};

/// Create a pipe, returning (read fd, write fd).
fn make_pipe(
    proc: &std::sync::Arc<opal_kernel::process::Process>,
    thread: &std::sync::Arc<opal_kernel::process::Thread>,
) -> (u64, u64) {
    let fds = ualloc(proc, 8);
    assert_eq!(sys_ok(proc, thread, SYS_PIPE, [fds, 0, 0, 0, 0, 0]), 0);
    let bytes = uread(proc, fds, 8);
    let read_fd = i32::from_le_bytes(bytes[0..4].try_into().unwrap()) as u64;
    let write_fd = i32::from_le_bytes(bytes[4..8].try_into().unwrap()) as u64;
    (read_fd, write_fd)
}

fn poll_entry(fd: u64, events: i16) -> [u8; 8] {
    let mut entry = [0u8; 8];
    entry[0..4].copy_from_slice(&(fd as i32).to_le_bytes());
    entry[4..6].copy_from_slice(&events.to_le_bytes());
    entry
}

#[test]
fn poll_reports_only_the_ready_pipe() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("proc");

    let (p1_read, p1_write) = make_pipe(&proc, &thread);
    let (p2_read, _p2_write) = make_pipe(&proc, &thread);

    // Write "x" on P1 only.
    let x = ustr(&proc, "x");
    assert_eq!(sys_ok(&proc, &thread, SYS_WRITE, [p1_write, x, 1, 0, 0, 0]), 1);

    let fds = ualloc(&proc, 16);
    uwrite(&proc, fds, &poll_entry(p1_read, POLLIN));
    uwrite(&proc, fds + 8, &poll_entry(p2_read, POLLIN));

    assert_eq!(sys_ok(&proc, &thread, SYS_POLL, [fds, 2, 0, 0, 0, 0]), 1);
    let entries = uread(&proc, fds, 16);
    let revents1 = i16::from_le_bytes(entries[6..8].try_into().unwrap());
    let revents2 = i16::from_le_bytes(entries[14..16].try_into().unwrap());
    assert_eq!(revents1, POLLIN);
    assert_eq!(revents2, 0);
}

#[test]
fn poll_blocks_until_an_event_and_honours_the_timeout() {
    let fx = fixture();
    let (proc, thread) = spawn_process("proc");
    let (p_read, p_write) = make_pipe(&proc, &thread);

    let fds = ualloc(&proc, 8);
    uwrite(&proc, fds, &poll_entry(p_read, POLLIN));

    // Infinite poll parks; a sibling thread's write wakes it.
    let disposition = sys(&proc, &thread, SYS_POLL, [fds, 1, u64::MAX, 0, 0, 0]);
    assert_eq!(disposition, Disposition::Parked);
    let sibling = testing::add_main_thread(&proc);
    let data = ustr(&proc, "y");
    assert_eq!(sys_ok(&proc, &sibling, SYS_WRITE, [p_write, data, 1, 0, 0, 0]), 1);
    assert_eq!(resume(&proc, &thread), Some(1));

    // Drain, then poll with a timeout and let it expire.
    let buf = ualloc(&proc, 4);
    assert_eq!(sys_ok(&proc, &thread, SYS_READ, [p_read, buf, 4, 0, 0, 0]), 1);
    uwrite(&proc, fds, &poll_entry(p_read, POLLIN));
    let disposition = sys(&proc, &thread, SYS_POLL, [fds, 1, 10_000, 0, 0, 0]);
    assert_eq!(disposition, Disposition::Parked);
    fx.clock().advance(20_000);
    assert_eq!(resume(&proc, &thread), Some(0));
}

#[test]
fn poll_is_interruptible() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("proc");
    let (p_read, _p_write) = make_pipe(&proc, &thread);

    let fds = ualloc(&proc, 8);
    uwrite(&proc, fds, &poll_entry(p_read, POLLIN));
    let disposition = sys(&proc, &thread, SYS_POLL, [fds, 1, u64::MAX, 0, 0, 0]);
    assert_eq!(disposition, Disposition::Parked);

    let sibling = testing::add_main_thread(&proc);
    assert_eq!(
        sys_ok(&proc, &sibling, SYS_INTERRUPT_THREAD, [0, 0, 0, 0, 0, 0]),
        0
    );
    assert_eq!(resume(&proc, &thread), Some(-EINTR));
}

#[test]
fn select_sets_only_ready_bits() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("proc");
    let (p1_read, p1_write) = make_pipe(&proc, &thread);
    let (p2_read, _p2_write) = make_pipe(&proc, &thread);

    let x = ustr(&proc, "x");
    assert_eq!(sys_ok(&proc, &thread, SYS_WRITE, [p1_write, x, 1, 0, 0, 0]), 1);

    // readfds contains both pipe read ends; writefds the write end.
    let readfds = ualloc(&proc, 128);
    let mut set = [0u8; 128];
    set[(p1_read / 8) as usize] |= 1 << (p1_read % 8);
    set[(p2_read / 8) as usize] |= 1 << (p2_read % 8);
    uwrite(&proc, readfds, &set);

    let writefds = ualloc(&proc, 128);
    let mut wset = [0u8; 128];
    wset[(p1_write / 8) as usize] |= 1 << (p1_write % 8);
    uwrite(&proc, writefds, &wset);

    let nfds = [p1_read, p2_read, p1_write].iter().max().unwrap() + 1;
    let count = sys_ok(
        &proc,
        &thread,
        SYS_SELECT,
        [nfds, readfds, writefds, 0, 0, 0],
    );
    assert_eq!(count, 2);

    let out_read = uread(&proc, readfds, 128);
    assert_ne!(out_read[(p1_read / 8) as usize] & (1 << (p1_read % 8)), 0);
    assert_eq!(out_read[(p2_read / 8) as usize] & (1 << (p2_read % 8)), 0);
    let out_write = uread(&proc, writefds, 128);
    assert_ne!(out_write[(p1_write / 8) as usize] & (1 << (p1_write % 8)), 0);
}

#[test]
fn blocking_pipe_reads_wake_on_write_and_report_eof() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("proc");
    let (p_read, p_write) = make_pipe(&proc, &thread);

    let buf = ualloc(&proc, 8);
    let disposition = sys(&proc, &thread, SYS_READ, [p_read, buf, 8, 0, 0, 0]);
    assert_eq!(disposition, Disposition::Parked);

    let sibling = testing::add_main_thread(&proc);
    let data = ustr(&proc, "ab");
    assert_eq!(sys_ok(&proc, &sibling, SYS_WRITE, [p_write, data, 2, 0, 0, 0]), 2);
    assert_eq!(resume(&proc, &thread), Some(2));
    assert_eq!(uread(&proc, buf, 2), b"ab");

    // Closing the write end makes further reads return end-of-file.
    assert_eq!(sys_ok(&proc, &thread, SYS_CLOSE, [p_write, 0, 0, 0, 0, 0]), 0);
    assert_eq!(sys_ok(&proc, &thread, SYS_READ, [p_read, buf, 8, 0, 0, 0]), 0);
}

#[test]
fn write_to_a_pipe_with_no_readers_breaks() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("proc");
    let (p_read, p_write) = make_pipe(&proc, &thread);

    assert_eq!(sys_ok(&proc, &thread, SYS_CLOSE, [p_read, 0, 0, 0, 0, 0]), 0);
    let data = ustr(&proc, "z");
    assert_eq!(
        sys_ok(&proc, &thread, SYS_WRITE, [p_write, data, 1, 0, 0, 0]),
        -opal_abi::errno::EPIPE
    );
}
