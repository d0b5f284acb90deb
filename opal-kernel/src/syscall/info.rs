//! Debug log, identity, time, and entropy syscalls.

use core::sync::atomic::{AtomicU64, Ordering};

use log::info;

use opal_abi::errno::EIO;
use opal_abi::process::SysInfo;

use crate::memory::phys;
use crate::platform;
use crate::process::RegisterContext;
use crate::time;

use super::user_ptr::{read_string, write_bytes, write_struct};
use super::{current, done, try_sys, SyscallFuture};

/// Syscall 0: write a message to the kernel log.
pub(super) fn sys_debug(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let Some(space) = proc.space() else {
        return done(-opal_abi::errno::EFAULT);
    };
    let message = try_sys!(read_string(&space, regs.arg0()));
    info!("({}): {}, {}", proc.name(), message, regs.arg1());
    done(0)
}

pub(super) fn sys_time(_regs: &RegisterContext) -> SyscallFuture {
    done(time::wall_clock_s() as isize)
}

pub(super) fn sys_uptime(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let Some(space) = proc.space() else {
        return done(-opal_abi::errno::EFAULT);
    };
    let uptime_us = time::uptime_us();
    if regs.arg0() != 0 {
        try_sys!(write_struct(&space, regs.arg0(), &(uptime_us / 1_000_000)));
    }
    if regs.arg1() != 0 {
        try_sys!(write_struct(&space, regs.arg1(), &(uptime_us / 1_000)));
    }
    done(0)
}

pub(super) fn sys_uname(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let Some(space) = proc.space() else {
        return done(-opal_abi::errno::EFAULT);
    };
    let mut bytes = alloc::vec::Vec::from(crate::VERSION_STRING.as_bytes());
    bytes.push(0);
    try_sys!(write_bytes(&space, regs.arg0(), &bytes));
    done(0)
}

pub(super) fn sys_info(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let Some(space) = proc.space() else {
        return done(-opal_abi::errno::EFAULT);
    };
    let info = SysInfo {
        used_mem_kib: (phys::used_bytes() / 1024) as u64,
        total_mem_kib: (phys::total_bytes() / 1024) as u64,
        cpu_count: platform::cpu_count() as u64,
    };
    try_sys!(write_struct(&space, regs.arg0(), &info));
    done(0)
}

static ENTROPY_STATE: AtomicU64 = AtomicU64::new(0);

/// splitmix64 step over a clock-seeded state.
fn next_random() -> u64 {
    let mut state = ENTROPY_STATE.load(Ordering::Relaxed);
    if state == 0 {
        state = platform::get().entropy_seed() ^ time::uptime_us() ^ 0x9e37_79b9_7f4a_7c15;
    }
    state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    ENTROPY_STATE.store(state, Ordering::Relaxed);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Syscall 98: fill a buffer of at most 256 bytes with entropy.
pub(super) fn sys_get_entropy(regs: &RegisterContext) -> SyscallFuture {
    let length = regs.arg1() as usize;
    if length > 256 {
        return done(-EIO);
    }
    let proc = current();
    let Some(space) = proc.space() else {
        return done(-opal_abi::errno::EFAULT);
    };
    let mut bytes = alloc::vec::Vec::with_capacity(length);
    while bytes.len() < length {
        let chunk = next_random().to_ne_bytes();
        let take = (length - bytes.len()).min(8);
        bytes.extend_from_slice(&chunk[..take]);
    }
    try_sys!(write_bytes(&space, regs.arg0(), &bytes));
    done(0)
}
