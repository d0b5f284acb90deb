//! Memory mapping and shared memory scenarios.

mod common;

use opal_abi::errno::{EINVAL, ENOMEM, EPERM};
use opal_abi::mem::MapFlags;
use opal_abi::syscalls::*;

use opal_kernel::memory::PAGE_SIZE;
use opal_kernel::testing::{fixture, spawn_process, sys_ok, ualloc, uread, uwrite};

const ANON_PRIVATE: u64 = MapFlags::ANON.bits() | MapFlags::PRIVATE.bits();

#[test]
fn mmap_returns_a_usable_region_through_the_out_pointer() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("proc");

    let out = ualloc(&proc, 8);
    assert_eq!(
        sys_ok(&proc, &thread, SYS_MMAP, [out, 8192, 0, ANON_PRIVATE, 0, 0]),
        0
    );
    let base = u64::from_le_bytes(uread(&proc, out, 8).try_into().unwrap());
    assert_ne!(base, 0);

    // The region is readable and writable, and registered.
    uwrite(&proc, base, b"mapped");
    assert_eq!(uread(&proc, base, 6), b"mapped");
    let space = proc.space().unwrap();
    let info = space.address_to_region(base + 100).expect("region exists");
    assert!(base >= info.base.as_u64());

    // Zero length and unknown flags are rejected.
    assert_eq!(
        sys_ok(&proc, &thread, SYS_MMAP, [out, 0, 0, ANON_PRIVATE, 0, 0]),
        -EINVAL
    );
    assert_eq!(sys_ok(&proc, &thread, SYS_MMAP, [out, 4096, 0, 0, 0, 0]), -EINVAL);
}

#[test]
fn mmap_fixed_requires_a_free_range() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("proc");

    let out = ualloc(&proc, 8);
    let hint = 0x5000_0000u64;
    let flags = ANON_PRIVATE | MapFlags::FIXED.bits();
    assert_eq!(
        sys_ok(&proc, &thread, SYS_MMAP, [out, 4096, hint, flags, 0, 0]),
        0
    );
    assert_eq!(
        sys_ok(&proc, &thread, SYS_MMAP, [out, 4096, hint, flags, 0, 0]),
        -ENOMEM
    );
}

#[test]
fn munmap_requires_page_alignment_and_splits_regions() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("proc");

    let out = ualloc(&proc, 8);
    assert_eq!(
        sys_ok(
            &proc,
            &thread,
            SYS_MMAP,
            [out, (4 * PAGE_SIZE) as u64, 0, ANON_PRIVATE, 0, 0],
        ),
        0
    );
    let base = u64::from_le_bytes(uread(&proc, out, 8).try_into().unwrap());

    assert_eq!(
        sys_ok(&proc, &thread, SYS_MUNMAP, [base + 1, 4096, 0, 0, 0, 0]),
        -EINVAL
    );
    assert_eq!(
        sys_ok(&proc, &thread, SYS_MUNMAP, [base, 123, 0, 0, 0, 0]),
        -EINVAL
    );

    // Punch a hole in the middle; the ends survive.
    assert_eq!(
        sys_ok(
            &proc,
            &thread,
            SYS_MUNMAP,
            [base + PAGE_SIZE as u64, (2 * PAGE_SIZE) as u64, 0, 0, 0, 0],
        ),
        0
    );
    let space = proc.space().unwrap();
    assert!(space.address_to_region(base).is_some());
    assert!(space.address_to_region(base + PAGE_SIZE as u64).is_none());
    assert!(space
        .address_to_region(base + 3 * PAGE_SIZE as u64)
        .is_some());
}

#[test]
fn shared_memory_is_visible_across_processes_and_destroyed_deferred() {
    let _fx = fixture();
    let (a, at) = spawn_process("a");
    let (b, bt) = spawn_process("b");

    // A creates a key and maps it.
    let key_out = ualloc(&a, 8);
    assert_eq!(
        sys_ok(&a, &at, SYS_CREATE_SHARED_MEMORY, [key_out, 8192, 0, 0, 0, 0]),
        0
    );
    let key = u64::from_le_bytes(uread(&a, key_out, 8).try_into().unwrap());
    assert!(key >= 1);

    let a_out = ualloc(&a, 8);
    assert_eq!(
        sys_ok(&a, &at, SYS_MAP_SHARED_MEMORY, [a_out, key, 0, 0, 0, 0]),
        0
    );
    let a_base = u64::from_le_bytes(uread(&a, a_out, 8).try_into().unwrap());
    assert_ne!(a_base, 0);
    uwrite(&a, a_base, b"shared!");

    // B maps the same key and sees A's bytes.
    let b_out = ualloc(&b, 8);
    assert_eq!(
        sys_ok(&b, &bt, SYS_MAP_SHARED_MEMORY, [b_out, key, 0, 0, 0, 0]),
        0
    );
    let b_base = u64::from_le_bytes(uread(&b, b_out, 8).try_into().unwrap());
    assert_ne!(b_base, 0);
    assert_eq!(uread(&b, b_base, 7), b"shared!");

    // Writes flow the other way too.
    uwrite(&b, b_base + 7, b"!");
    assert_eq!(uread(&a, a_base, 8), b"shared!!");

    // Unmap on both sides returns 0; the key dies with the last unmap.
    assert_eq!(
        sys_ok(&a, &at, SYS_UNMAP_SHARED_MEMORY, [a_base, key, 0, 0, 0, 0]),
        0
    );
    assert_eq!(uread(&b, b_base, 7), b"shared!");
    assert_eq!(
        sys_ok(&b, &bt, SYS_UNMAP_SHARED_MEMORY, [b_base, key, 0, 0, 0, 0]),
        0
    );
    let out = ualloc(&a, 8);
    assert_eq!(
        sys_ok(&a, &at, SYS_MAP_SHARED_MEMORY, [out, key, 0, 0, 0, 0]),
        0
    );
    assert_eq!(u64::from_le_bytes(uread(&a, out, 8).try_into().unwrap()), 0);
}

#[test]
fn private_shared_memory_is_restricted_to_the_recipient() {
    let _fx = fixture();
    let (a, at) = spawn_process("a");
    let (b, bt) = spawn_process("b");
    let (c, ct) = spawn_process("c");

    let key_out = ualloc(&a, 8);
    assert_eq!(
        sys_ok(
            &a,
            &at,
            SYS_CREATE_SHARED_MEMORY,
            [key_out, 4096, opal_abi::mem::SMEM_PRIVATE, b.pid(), 0, 0],
        ),
        0
    );
    let key = u64::from_le_bytes(uread(&a, key_out, 8).try_into().unwrap());

    // The recipient can map it; a third process cannot.
    let b_out = ualloc(&b, 8);
    assert_eq!(sys_ok(&b, &bt, SYS_MAP_SHARED_MEMORY, [b_out, key, 0, 0, 0, 0]), 0);
    assert_ne!(
        u64::from_le_bytes(uread(&b, b_out, 8).try_into().unwrap()),
        0
    );

    let c_out = ualloc(&c, 8);
    assert_eq!(sys_ok(&c, &ct, SYS_MAP_SHARED_MEMORY, [c_out, key, 0, 0, 0, 0]), 0);
    assert_eq!(u64::from_le_bytes(uread(&c, c_out, 8).try_into().unwrap()), 0);

    // Only the owner or recipient may destroy.
    assert_eq!(
        sys_ok(&c, &ct, SYS_DESTROY_SHARED_MEMORY, [key, 0, 0, 0, 0, 0]),
        -EPERM
    );
    assert_eq!(
        sys_ok(&a, &at, SYS_DESTROY_SHARED_MEMORY, [key, 0, 0, 0, 0, 0]),
        0
    );
}

#[test]
fn sysinfo_reports_memory_and_cpu_counts() {
    let _fx = fixture();
    let (proc, thread) = spawn_process("proc");

    let out = ualloc(&proc, 24);
    // Touch the page so at least one frame is resident before the query.
    uwrite(&proc, out, &[0u8; 24]);
    assert_eq!(sys_ok(&proc, &thread, SYS_INFO, [out, 0, 0, 0, 0, 0]), 0);
    let bytes = uread(&proc, out, 24);
    let used = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let total = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let cpus = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
    assert!(used > 0);
    assert_eq!(total, 64 * 1024);
    assert_eq!(cpus, 1);
}
