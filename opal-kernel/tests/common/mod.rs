//! Shared helpers for the scenario tests.

#![allow(dead_code)]

/// Build a minimal static ELF64 executable: one PT_LOAD segment at
/// 0x400000 containing the headers plus `code`, entry at the first code
/// byte.
pub fn tiny_elf(code: &[u8]) -> Vec<u8> {
    const BASE: u64 = 0x40_0000;
    const EHDR: usize = 64;
    const PHDR: usize = 56;
    let filesz = (EHDR + PHDR + code.len()) as u64;
    let entry = BASE + (EHDR + PHDR) as u64;

    let mut image = Vec::new();
    // e_ident
    image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    image.extend_from_slice(&[0; 8]);
    image.extend_from_slice(&2u16.to_le_bytes()); // e_type = EXEC
    image.extend_from_slice(&0x3eu16.to_le_bytes()); // e_machine = x86-64
    image.extend_from_slice(&1u32.to_le_bytes()); // e_version
    image.extend_from_slice(&entry.to_le_bytes()); // e_entry
    image.extend_from_slice(&(EHDR as u64).to_le_bytes()); // e_phoff
    image.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&(EHDR as u16).to_le_bytes()); // e_ehsize
    image.extend_from_slice(&(PHDR as u16).to_le_bytes()); // e_phentsize
    image.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    assert_eq!(image.len(), EHDR);

    // Program header: PT_LOAD, R+X
    image.extend_from_slice(&1u32.to_le_bytes()); // p_type
    image.extend_from_slice(&5u32.to_le_bytes()); // p_flags
    image.extend_from_slice(&0u64.to_le_bytes()); // p_offset
    image.extend_from_slice(&BASE.to_le_bytes()); // p_vaddr
    image.extend_from_slice(&BASE.to_le_bytes()); // p_paddr
    image.extend_from_slice(&filesz.to_le_bytes()); // p_filesz
    image.extend_from_slice(&filesz.to_le_bytes()); // p_memsz
    image.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
    assert_eq!(image.len(), EHDR + PHDR);

    image.extend_from_slice(code);
    image
}

/// Bytes of an AF_UNIX sockaddr for `path`.
pub fn unix_addr(path: &str) -> Vec<u8> {
    let mut bytes = vec![0u8; 110];
    bytes[..2].copy_from_slice(&1u16.to_ne_bytes());
    bytes[2..2 + path.len()].copy_from_slice(path.as_bytes());
    bytes
}

/// Bytes of an AF_INET sockaddr for 127.0.0.1:`port`.
pub fn inet_addr(port: u16) -> Vec<u8> {
    let mut bytes = vec![0u8; 16];
    bytes[..2].copy_from_slice(&2u16.to_ne_bytes());
    bytes[2..4].copy_from_slice(&port.to_be_bytes());
    bytes[4..8].copy_from_slice(&[127, 0, 0, 1]);
    bytes
}
