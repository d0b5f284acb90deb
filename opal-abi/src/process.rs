//! Process-related constants and records.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// `waitpid`: return immediately when no child is ready.
pub const WNOHANG: i64 = 1;

/// `exec`: register the new process as a child of the caller and share its
/// standard descriptors.
pub const EXEC_CHILD: u64 = 1;

pub const PROCESS_STATE_ACTIVE: u32 = 0;
pub const PROCESS_STATE_ZOMBIE: u32 = 1;

/// Length of the process name field in [`ProcessInfo`].
pub const PROCESS_NAME_LEN: usize = 96;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ProcessInfo {
    pub pid: u64,
    pub thread_count: u32,
    pub uid: u32,
    pub gid: u32,
    pub state: u32,
    pub name: [u8; PROCESS_NAME_LEN],
    pub running_time: u64,
    pub active_us: u64,
    pub used_mem_kib: u64,
}

impl Default for ProcessInfo {
    fn default() -> Self {
        ProcessInfo {
            pid: 0,
            thread_count: 0,
            uid: 0,
            gid: 0,
            state: 0,
            name: [0; PROCESS_NAME_LEN],
            running_time: 0,
            active_us: 0,
            used_mem_kib: 0,
        }
    }
}

/// System-wide information written back by the `info` syscall.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SysInfo {
    pub used_mem_kib: u64,
    pub total_mem_kib: u64,
    pub cpu_count: u64,
}
