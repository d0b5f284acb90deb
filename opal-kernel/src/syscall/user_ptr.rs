//! Usermode pointer access for syscall handlers.
//!
//! The caller's address space is the single authority: every helper copies
//! through it, and any unmapped or misused range becomes a negative errno
//! (`EFAULT`) instead of a kernel-mode fault.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use opal_abi::PATH_MAX;

use crate::memory::AddressSpace;

/// Errors carry the *negative* errno so handlers can return them directly.
pub(crate) type UserResult<T> = Result<T, isize>;

pub(crate) fn read_bytes(space: &AddressSpace, addr: u64, len: usize) -> UserResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    space
        .copy_from_user(addr, &mut buf)
        .map_err(|e| -e.errno())?;
    Ok(buf)
}

pub(crate) fn write_bytes(space: &AddressSpace, addr: u64, data: &[u8]) -> UserResult<()> {
    space.copy_to_user(addr, data).map_err(|e| -e.errno())
}

pub(crate) fn read_struct<T: FromBytes>(space: &AddressSpace, addr: u64) -> UserResult<T> {
    space.read_user(addr).map_err(|e| -e.errno())
}

pub(crate) fn write_struct<T: IntoBytes + Immutable>(
    space: &AddressSpace,
    addr: u64,
    value: &T,
) -> UserResult<()> {
    space.write_user(addr, value).map_err(|e| -e.errno())
}

/// Read a NUL-terminated string, bounded by `PATH_MAX`.
pub(crate) fn read_string(space: &AddressSpace, addr: u64) -> UserResult<String> {
    space
        .read_user_string(addr, PATH_MAX)
        .map_err(|e| -e.errno())
}
