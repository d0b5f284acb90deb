//! Per-process virtual address spaces.
//!
//! An address space is a sorted set of non-overlapping, page-aligned mapped
//! regions, each backed by exactly one VM object. It is also the single
//! authority for usermode pointers: every syscall argument that names user
//! memory is copied in or out through here, and any violation surfaces as
//! `EFAULT` rather than a fault in kernel mode.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spinning_top::Spinlock;
use x86_64::VirtAddr;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::vm_object::VmObject;
use super::{is_page_aligned, page_align_down, page_align_up, AccessKind, MapError, PAGE_SIZE};

/// Lowest mappable user address.
pub const USER_BASE: u64 = 0x1000;

/// One past the highest mappable user address (lower canonical half).
pub const USER_END: u64 = 0x0000_7fff_ffff_f000;

/// Search floor for placements without a usable hint.
const MMAP_BASE: u64 = 0x1000_0000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Writes go to the shared object rather than a private copy.
        const SHARED = 1 << 3;
    }
}

struct MappedRegion {
    base: u64,
    size: usize,
    flags: RegionFlags,
    object: Arc<VmObject>,
    /// Byte offset into the object of the region's first page.
    offset: usize,
}

impl MappedRegion {
    fn new(
        base: u64,
        size: usize,
        flags: RegionFlags,
        object: Arc<VmObject>,
        offset: usize,
    ) -> MappedRegion {
        object.retain_mapping();
        MappedRegion {
            base,
            size,
            flags,
            object,
            offset,
        }
    }

    fn end(&self) -> u64 {
        self.base + self.size as u64
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        self.object.release_mapping();
    }
}

/// Snapshot of a region's geometry.
#[derive(Debug, Clone, Copy)]
pub struct RegionInfo {
    pub base: VirtAddr,
    pub size: usize,
    pub flags: RegionFlags,
}

pub struct AddressSpace {
    /// Regions sorted by base address, ranges disjoint.
    regions: Spinlock<Vec<MappedRegion>>,
}

impl AddressSpace {
    pub fn new() -> Arc<AddressSpace> {
        Arc::new(AddressSpace {
            regions: Spinlock::new(Vec::new()),
        })
    }

    /// Map a fresh anonymous object. Returns the chosen base address.
    pub fn map_anonymous(
        &self,
        size: usize,
        hint: u64,
        fixed: bool,
        flags: RegionFlags,
    ) -> Result<VirtAddr, MapError> {
        if size == 0 {
            return Err(MapError::InvalidArgument);
        }
        let size = page_align_up(size as u64) as usize;
        let object = VmObject::anonymous(size);
        self.insert(object, 0, size, hint, fixed, flags)
    }

    /// Map an existing VM object in its entirety.
    pub fn map_object(
        &self,
        object: Arc<VmObject>,
        hint: u64,
        fixed: bool,
        flags: RegionFlags,
    ) -> Result<VirtAddr, MapError> {
        let size = object.size();
        if size == 0 {
            return Err(MapError::InvalidArgument);
        }
        self.insert(object, 0, size, hint, fixed, flags)
    }

    fn insert(
        &self,
        object: Arc<VmObject>,
        offset: usize,
        size: usize,
        hint: u64,
        fixed: bool,
        flags: RegionFlags,
    ) -> Result<VirtAddr, MapError> {
        let mut regions = self.regions.lock();

        let base = if fixed {
            let base = page_align_down(hint);
            if base < USER_BASE || base + size as u64 > USER_END {
                return Err(MapError::InvalidArgument);
            }
            if !Self::range_free(&regions, base, size) {
                return Err(MapError::NoMemory);
            }
            base
        } else {
            let start = if hint != 0 {
                page_align_down(hint).max(USER_BASE)
            } else {
                MMAP_BASE
            };
            Self::find_free(&regions, start, size).ok_or(MapError::NoMemory)?
        };

        let region = MappedRegion::new(base, size, flags, object, offset);
        let index = regions.partition_point(|r| r.base < base);
        regions.insert(index, region);
        Ok(VirtAddr::new(base))
    }

    fn range_free(regions: &[MappedRegion], base: u64, size: usize) -> bool {
        let end = base + size as u64;
        !regions.iter().any(|r| r.base < end && base < r.end())
    }

    /// First-fit ascending search from `start`.
    fn find_free(regions: &[MappedRegion], start: u64, size: usize) -> Option<u64> {
        let mut candidate = start;
        for region in regions.iter() {
            if region.end() <= candidate {
                continue;
            }
            if region.base >= candidate + size as u64 {
                break;
            }
            candidate = region.end();
        }
        if candidate + (size as u64) <= USER_END {
            Some(candidate)
        } else {
            None
        }
    }

    /// Unmap `[base, base + len)`. Regions partially covered are split at
    /// the boundaries.
    pub fn unmap(&self, base: u64, len: usize) -> Result<(), MapError> {
        if !is_page_aligned(base) || !is_page_aligned(len as u64) || len == 0 {
            return Err(MapError::InvalidArgument);
        }
        let end = base + len as u64;

        let mut regions = self.regions.lock();
        let mut index = 0;
        while index < regions.len() {
            let (rbase, rend) = {
                let r = &regions[index];
                (r.base, r.end())
            };
            if rend <= base || rbase >= end {
                index += 1;
                continue;
            }

            let region = regions.remove(index);
            if rbase < base {
                let keep = (base - rbase) as usize;
                regions.insert(
                    index,
                    MappedRegion::new(rbase, keep, region.flags, region.object.clone(), region.offset),
                );
                index += 1;
            }
            if rend > end {
                let skip = (end - rbase) as usize;
                regions.insert(
                    index,
                    MappedRegion::new(
                        end,
                        (rend - end) as usize,
                        region.flags,
                        region.object.clone(),
                        region.offset + skip,
                    ),
                );
                index += 1;
            }
            drop(region);
        }
        Ok(())
    }

    /// Drop every mapping. Used on exec.
    pub fn unmap_all(&self) {
        self.regions.lock().clear();
    }

    pub fn address_to_region(&self, addr: u64) -> Option<RegionInfo> {
        let regions = self.regions.lock();
        regions.iter().find(|r| r.contains(addr)).map(|r| RegionInfo {
            base: VirtAddr::new(r.base),
            size: r.size,
            flags: r.flags,
        })
    }

    /// The base address and object of the region containing `addr`.
    pub fn region_object(&self, addr: u64) -> Option<(VirtAddr, Arc<VmObject>)> {
        let regions = self.regions.lock();
        regions
            .iter()
            .find(|r| r.contains(addr))
            .map(|r| (VirtAddr::new(r.base), r.object.clone()))
    }

    /// Clone for fork. Private regions share their physical pages
    /// copy-on-write; shared regions alias the same object.
    pub fn clone_cow(&self) -> Arc<AddressSpace> {
        let regions = self.regions.lock();
        let cloned = regions
            .iter()
            .map(|r| {
                let object = if r.flags.contains(RegionFlags::SHARED) {
                    r.object.clone()
                } else {
                    r.object.clone_cow()
                };
                MappedRegion::new(r.base, r.size, r.flags, object, r.offset)
            })
            .collect();
        Arc::new(AddressSpace {
            regions: Spinlock::new(cloned),
        })
    }

    /// Physical memory resident in private mappings of this space.
    pub fn used_physical(&self) -> usize {
        let regions = self.regions.lock();
        regions
            .iter()
            .filter(|r| !r.flags.contains(RegionFlags::SHARED))
            .map(|r| r.object.resident_bytes(r.offset, r.size))
            .sum()
    }

    /// Service a fault at `addr`. An address outside every region, or an
    /// access the region does not permit, is a segmentation fault.
    pub fn fault(&self, addr: u64, kind: AccessKind) -> Result<(), MapError> {
        let (object, index, cow) = {
            let regions = self.regions.lock();
            let region = regions
                .iter()
                .find(|r| r.contains(addr))
                .ok_or(MapError::BadAddress)?;
            let needed = match kind {
                AccessKind::Read => RegionFlags::READ,
                AccessKind::Write => RegionFlags::WRITE,
            };
            if !region.flags.contains(needed) {
                return Err(MapError::BadAddress);
            }
            let page = page_align_down(addr);
            let index = (region.offset + (page - region.base) as usize) / PAGE_SIZE;
            (
                region.object.clone(),
                index,
                !region.flags.contains(RegionFlags::SHARED),
            )
        };
        object
            .page(index, kind == AccessKind::Write, cow)
            .map(|_| ())
    }

    /// Walk `[addr, addr + len)` page by page, resolving each page's frame
    /// with the required access and applying `f(frame, page_offset, chunk)`.
    fn walk(
        &self,
        addr: u64,
        len: usize,
        kind: AccessKind,
        f: impl FnMut(&Arc<super::phys::Frame>, usize, usize),
    ) -> Result<(), MapError> {
        self.walk_with(addr, len, kind, true, f)
    }

    fn walk_with(
        &self,
        addr: u64,
        len: usize,
        kind: AccessKind,
        enforce: bool,
        mut f: impl FnMut(&Arc<super::phys::Frame>, usize, usize),
    ) -> Result<(), MapError> {
        if len == 0 {
            return Ok(());
        }
        if addr < USER_BASE || addr.checked_add(len as u64).is_none() || addr + (len as u64) > USER_END {
            return Err(MapError::BadAddress);
        }

        let mut pos = addr;
        let end = addr + len as u64;
        while pos < end {
            let page = page_align_down(pos);
            let page_off = (pos - page) as usize;
            let chunk = (PAGE_SIZE - page_off).min((end - pos) as usize);

            let (object, index, cow) = {
                let regions = self.regions.lock();
                let region = regions
                    .iter()
                    .find(|r| r.contains(pos))
                    .ok_or(MapError::BadAddress)?;
                let needed = match kind {
                    AccessKind::Read => RegionFlags::READ,
                    AccessKind::Write => RegionFlags::WRITE,
                };
                if enforce && !region.flags.contains(needed) {
                    return Err(MapError::BadAddress);
                }
                let index = (region.offset + (page - region.base) as usize) / PAGE_SIZE;
                (
                    region.object.clone(),
                    index,
                    !region.flags.contains(RegionFlags::SHARED),
                )
            };

            let frame = object.page(index, kind == AccessKind::Write, cow)?;
            f(&frame, page_off, chunk);
            pos += chunk as u64;
        }
        Ok(())
    }

    pub fn copy_from_user(&self, addr: u64, out: &mut [u8]) -> Result<(), MapError> {
        let mut done = 0;
        let len = out.len();
        self.walk(addr, len, AccessKind::Read, |frame, page_off, chunk| {
            frame.copy_to(page_off, &mut out[done..done + chunk]);
            done += chunk;
        })
    }

    pub fn copy_to_user(&self, addr: u64, data: &[u8]) -> Result<(), MapError> {
        let mut done = 0;
        self.walk(addr, data.len(), AccessKind::Write, |frame, page_off, chunk| {
            frame.copy_from(page_off, &data[done..done + chunk]);
            done += chunk;
        })
    }

    /// Write into mapped memory regardless of region protections. Used by
    /// the executable loader to populate read-only segments.
    pub(crate) fn poke_bytes(&self, addr: u64, data: &[u8]) -> Result<(), MapError> {
        let mut done = 0;
        self.walk_with(
            addr,
            data.len(),
            AccessKind::Write,
            false,
            |frame, page_off, chunk| {
                frame.copy_from(page_off, &data[done..done + chunk]);
                done += chunk;
            },
        )
    }

    pub fn read_user<T: FromBytes>(&self, addr: u64) -> Result<T, MapError> {
        let mut buf = alloc::vec![0u8; core::mem::size_of::<T>()];
        self.copy_from_user(addr, &mut buf)?;
        T::read_from_bytes(&buf).map_err(|_| MapError::InvalidArgument)
    }

    pub fn write_user<T: IntoBytes + Immutable>(&self, addr: u64, value: &T) -> Result<(), MapError> {
        self.copy_to_user(addr, value.as_bytes())
    }

    /// Read a NUL-terminated string out of user memory.
    pub fn read_user_string(&self, addr: u64, max: usize) -> Result<String, MapError> {
        let mut bytes = Vec::new();
        let mut pos = addr;
        loop {
            let page_end = page_align_down(pos) + PAGE_SIZE as u64;
            let chunk = (page_end - pos).min((max + 1 - bytes.len()) as u64) as usize;
            let mut buf = alloc::vec![0u8; chunk];
            self.copy_from_user(pos, &mut buf)?;
            if let Some(nul) = buf.iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&buf[..nul]);
                return String::from_utf8(bytes).map_err(|_| MapError::InvalidArgument);
            }
            bytes.extend_from_slice(&buf);
            if bytes.len() > max {
                return Err(MapError::NameTooLong);
            }
            pos += chunk as u64;
        }
    }
}
