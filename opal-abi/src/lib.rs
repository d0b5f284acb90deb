//! Shared ABI definitions between the Opal kernel and userspace.
//!
//! This crate contains syscall numbers, error numbers, flag bitsets, and the
//! record layouts that cross the user/kernel boundary. Both sides must agree
//! on every byte here, so everything is `#[repr(C)]` and laid out without
//! implicit padding.

#![no_std]

pub mod errno;
pub mod fcntl;
pub mod ipc;
pub mod mem;
pub mod poll;
pub mod process;
pub mod socket;
pub mod stat;
pub mod syscalls;

/// A process-local kernel object handle id as it appears in syscall
/// arguments. Valid ids are small positive integers; zero and negative
/// values are never valid handles.
pub type HandleId = i64;

/// Maximum length of a filesystem path, including the terminator.
pub const PATH_MAX: usize = 4096;

/// Maximum length of a process or directory-entry name.
pub const NAME_MAX: usize = 255;
