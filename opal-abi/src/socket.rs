//! Socket address families, types, flags, and address records.
//!
//! Port and address fields are carried in network byte order.

use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const AF_UNSPEC: i32 = 0;
pub const AF_UNIX: i32 = 1;
pub const AF_INET: i32 = 2;
pub const AF_INET6: i32 = 10;

pub const SOCK_STREAM: i32 = 1;
pub const SOCK_DGRAM: i32 = 2;
pub const SOCK_RAW: i32 = 3;
pub const SOCK_SEQPACKET: i32 = 5;

/// Extra bits accepted in the `socket()` type argument.
pub const SOCK_NONBLOCK: i32 = 0o4000;
pub const SOCK_TYPE_MASK: i32 = 0xf;

pub const MSG_PEEK: i32 = 0x02;
pub const MSG_DONTWAIT: i32 = 0x40;

pub const SOL_SOCKET: i32 = 1;
pub const SO_TYPE: i32 = 3;
pub const SO_ERROR: i32 = 4;

pub const IPPROTO_IP: i32 = 0;
pub const IP_PKTINFO: i32 = 8;

pub const INADDR_ANY: u32 = 0;
pub const INADDR_BROADCAST: u32 = 0xffff_ffff;

/// Length of the `sun_path` field of an AF_UNIX address.
pub const UNIX_PATH_MAX: usize = 108;

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SockAddrUn {
    pub sun_family: u16,
    pub sun_path: [u8; UNIX_PATH_MAX],
}

impl SockAddrUn {
    /// The bound path as bytes up to the first NUL.
    pub fn path_bytes(&self) -> &[u8] {
        let end = self
            .sun_path
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(UNIX_PATH_MAX);
        &self.sun_path[..end]
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SockAddrIn {
    pub sin_family: u16,
    pub sin_port: U16,
    pub sin_addr: U32,
    pub sin_zero: [u8; 8],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct IoVec {
    pub iov_base: u64,
    pub iov_len: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MsgHdr {
    pub msg_name: u64,
    pub msg_namelen: u32,
    pub __pad0: u32,
    pub msg_iov: u64,
    pub msg_iovlen: u64,
    pub msg_control: u64,
    pub msg_controllen: u64,
    pub msg_flags: i32,
    pub __pad1: u32,
}
