//! `poll`/`select` records and event bits, plus time records.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const POLLIN: i16 = 0x001;
pub const POLLPRI: i16 = 0x002;
pub const POLLOUT: i16 = 0x004;
pub const POLLERR: i16 = 0x008;
pub const POLLHUP: i16 = 0x010;
pub const POLLNVAL: i16 = 0x020;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PollFd {
    pub fd: i32,
    pub events: i16,
    pub revents: i16,
}

/// Number of descriptors representable in an [`FdSet`].
pub const FD_SETSIZE: usize = 1024;

/// Bitmap of file descriptors for `select`.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FdSet {
    pub fds_bits: [u8; FD_SETSIZE / 8],
}

impl Default for FdSet {
    fn default() -> Self {
        FdSet {
            fds_bits: [0; FD_SETSIZE / 8],
        }
    }
}

impl FdSet {
    pub fn is_set(&self, fd: usize) -> bool {
        fd < FD_SETSIZE && self.fds_bits[fd / 8] & (1 << (fd % 8)) != 0
    }

    pub fn set(&mut self, fd: usize) {
        if fd < FD_SETSIZE {
            self.fds_bits[fd / 8] |= 1 << (fd % 8);
        }
    }

    pub fn clear_all(&mut self) {
        self.fds_bits = [0; FD_SETSIZE / 8];
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TimeSpec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl TimeSpec {
    /// Total microseconds, saturating at zero for negative values.
    pub fn as_micros(&self) -> u64 {
        let us = self.tv_sec.saturating_mul(1_000_000) + self.tv_nsec / 1_000;
        us.max(0) as u64
    }
}
