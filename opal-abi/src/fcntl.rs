//! File descriptor modes and seek constants.

use bitflags::bitflags;

/// Access-mode mask within [`OpenFlags`]. The access mode is an enumeration,
/// not a bitset: `O_RDONLY` is zero.
pub const O_ACCMODE: u32 = 0o3;
pub const O_RDONLY: u32 = 0o0;
pub const O_WRONLY: u32 = 0o1;
pub const O_RDWR: u32 = 0o2;

bitflags! {
    /// File descriptor mode bits (beyond the access mode).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const CREAT = 0o100;
        const EXCL = 0o200;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
        const NONBLOCK = 0o4000;
        const DIRECTORY = 0o200000;
        const NOFOLLOW = 0o400000;
        const CLOEXEC = 0o2000000;
    }
}

pub const SEEK_SET: usize = 0;
pub const SEEK_CUR: usize = 1;
pub const SEEK_END: usize = 2;

/// `ioctl` request that sets `O_CLOEXEC` on the descriptor.
pub const FIOCLEX: u64 = 0x5451;

/// `stat` flag: do not follow a trailing symlink.
pub const AT_SYMLINK_NOFOLLOW: u64 = 0x100;
