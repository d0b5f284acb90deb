//! ELF image loading.

use goblin::elf::{program_header, Elf};

use crate::memory::{page_align_down, page_align_up, AddressSpace, PAGE_SIZE, RegionFlags};

use super::exec::ExecError;

/// Map the PT_LOAD segments of `data` into `space` and return the entry
/// point. Segments are backed by anonymous objects; bytes beyond the file
/// extent stay zero-filled.
pub(crate) fn load(space: &AddressSpace, data: &[u8]) -> Result<u64, ExecError> {
    let elf = Elf::parse(data).map_err(|_| ExecError::NotExecutable)?;
    if !elf.is_64 {
        return Err(ExecError::NotExecutable);
    }

    for ph in elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == program_header::PT_LOAD && ph.p_memsz > 0)
    {
        let base = page_align_down(ph.p_vaddr);
        let end = page_align_up(
            ph.p_vaddr
                .checked_add(ph.p_memsz)
                .ok_or(ExecError::NotExecutable)?,
        );

        let mut flags = RegionFlags::READ;
        if ph.p_flags & program_header::PF_W != 0 {
            flags |= RegionFlags::WRITE;
        }
        if ph.p_flags & program_header::PF_X != 0 {
            flags |= RegionFlags::EXEC;
        }

        // Adjacent segments may share a page; map only the pages not
        // already covered.
        let mut page = base;
        while page < end {
            let mut run = 0usize;
            while page + ((run * PAGE_SIZE) as u64) < end
                && space
                    .address_to_region(page + (run * PAGE_SIZE) as u64)
                    .is_none()
            {
                run += 1;
            }
            if run > 0 {
                space
                    .map_anonymous(run * PAGE_SIZE, page, true, flags)
                    .map_err(|_| ExecError::NoMemory)?;
                page += (run * PAGE_SIZE) as u64;
            } else {
                page += PAGE_SIZE as u64;
            }
        }

        if ph.p_filesz > 0 {
            let start = ph.p_offset as usize;
            let file_end = start
                .checked_add(ph.p_filesz as usize)
                .ok_or(ExecError::NotExecutable)?;
            let bytes = data.get(start..file_end).ok_or(ExecError::NotExecutable)?;
            space
                .poke_bytes(ph.p_vaddr, bytes)
                .map_err(|_| ExecError::NoMemory)?;
        }
    }

    Ok(elf.entry)
}
