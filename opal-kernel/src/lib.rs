//! The Opal kernel core.
//!
//! This crate implements the machine-independent heart of the kernel: the
//! syscall surface, the process/thread model, per-process virtual address
//! spaces, the typed kernel-object handle table with its cross-object wait
//! primitive, the local IPC substrate, and local/UDP sockets.
//!
//! Architecture-specific pieces plug in through registered facilities:
//! paging hardware and frame allocation ([`memory::PhysicalMemory`]), the
//! clock ([`time::ClockSource`]), the filesystem drivers ([`fs::Vfs`]), the
//! packet transport below UDP ([`net::PacketTransport`]), and the trap/entry
//! glue, which calls [`syscall::dispatch`] and drives [`sched`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod fs;
pub mod handle;
pub mod ipc;
pub mod memory;
pub mod net;
pub mod object;
pub mod platform;
pub mod process;
pub mod sched;
pub mod syscall;
pub mod time;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Kernel identity reported by `uname`.
pub const VERSION_STRING: &str = "Opal 0.1.0 x86_64";
