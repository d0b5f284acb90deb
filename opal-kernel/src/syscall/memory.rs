//! Memory mapping and shared memory syscalls.

use alloc::sync::Arc;

use log::{error, warn};

use opal_abi::errno::{EINVAL, ENOMEM, EPERM};
use opal_abi::mem::MapFlags;

use crate::memory::{is_page_aligned, shared, RegionFlags};

use super::user_ptr::write_struct;
use super::{current, current_space, done, try_sys, RegisterContext, SyscallFuture};

/// `mmap(address_out, size, hint, flags)`. Only anonymous private mappings
/// are supported; the chosen base is written through `address_out`.
pub(super) fn sys_mmap(regs: &RegisterContext) -> SyscallFuture {
    let size = regs.arg1() as usize;
    if size == 0 {
        return done(-EINVAL);
    }
    let flags = MapFlags::from_bits(regs.arg3())
        .filter(|f| f.contains(MapFlags::ANON));
    let Some(flags) = flags else {
        warn!("mmap: unsupported flags {:#x}", regs.arg3());
        return done(-EINVAL);
    };

    let proc = current();
    let space = try_sys!(current_space(&proc));
    let base = match space.map_anonymous(
        size,
        regs.arg2(),
        flags.contains(MapFlags::FIXED),
        RegionFlags::READ | RegionFlags::WRITE,
    ) {
        Ok(base) => base,
        Err(e) => {
            error!("mmap: failed to map region (hint {:#x})", regs.arg2());
            return done(-e.errno());
        }
    };
    try_sys!(write_struct(&space, regs.arg0(), &base.as_u64()));
    done(0)
}

pub(super) fn sys_munmap(regs: &RegisterContext) -> SyscallFuture {
    let address = regs.arg0();
    let size = regs.arg1() as usize;
    if !is_page_aligned(address) || !is_page_aligned(size as u64) {
        return done(-EINVAL);
    }
    let proc = current();
    let space = try_sys!(current_space(&proc));
    match space.unmap(address, size) {
        Ok(()) => done(0),
        Err(e) => done(-e.errno()),
    }
}

/// `create_shared_memory(key_out, size, flags, recipient)`.
pub(super) fn sys_create_shared_memory(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let key = match shared::create(regs.arg1(), regs.arg2(), proc.pid(), regs.arg3()) {
        Ok(key) => key,
        Err(e) => return done(-e.errno()),
    };
    try_sys!(write_struct(&space, regs.arg0(), &key));
    done(0)
}

/// `map_shared_memory(address_out, key, hint)`. The result is reported
/// through the pointer: the mapped base, or zero when the key cannot be
/// mapped by this process.
pub(super) fn sys_map_shared_memory(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let key = regs.arg1() as i64;

    let base = match shared::get(key) {
        Some(object) if shared::can_access(key, proc.pid()) => space
            .map_object(
                object,
                regs.arg2(),
                false,
                RegionFlags::READ | RegionFlags::WRITE | RegionFlags::SHARED,
            )
            .map(|base| base.as_u64())
            .unwrap_or(0),
        _ => 0,
    };
    try_sys!(write_struct(&space, regs.arg0(), &base));
    done(0)
}

/// `unmap_shared_memory(address, key)`. The region must map exactly the
/// named object.
pub(super) fn sys_unmap_shared_memory(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let space = try_sys!(current_space(&proc));
    let address = regs.arg0();
    let key = regs.arg1() as i64;

    let Some(object) = shared::get(key) else {
        return done(-EINVAL);
    };
    let Some((base, mapped)) = space.region_object(address) else {
        return done(-EINVAL);
    };
    if !Arc::ptr_eq(&object, &mapped) {
        return done(-EINVAL);
    }
    if space.unmap(base.as_u64(), object.size()).is_err() {
        return done(-ENOMEM);
    }
    // Deferred: the object survives while other mappings remain.
    shared::destroy(key);
    done(0)
}

pub(super) fn sys_destroy_shared_memory(regs: &RegisterContext) -> SyscallFuture {
    let proc = current();
    let key = regs.arg0() as i64;
    if !shared::can_modify(key, proc.pid()) {
        return done(-EPERM);
    }
    shared::destroy(key);
    done(0)
}
