//! IPC endpoint records.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Endpoint information written back by `endpoint_info`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct EndpointInfo {
    pub msg_size: u16,
}

/// Largest message size an interface may be created with.
pub const MESSAGE_SIZE_MAX: u16 = 0xffe8;
