//! Memory mapping and shared memory constants.

use bitflags::bitflags;

bitflags! {
    /// `mmap` flags. Only anonymous private mappings are accepted; other
    /// bits fail with `EINVAL`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const FIXED = 0x10;
        const ANON = 0x20;
    }
}

/// Shared memory flag: only the creator and the named recipient pid may map
/// the object.
pub const SMEM_PRIVATE: u64 = 1;
