//! File descriptor tables.
//!
//! A table is an ordered sparse sequence indexed by small non-negative
//! integers. Allocation returns the lowest unused index. Descriptors carry
//! their own position and mode; duplication shares the backing node but not
//! the position.

use alloc::sync::Arc;
use alloc::vec::Vec;

use opal_abi::fcntl::OpenFlags;

use crate::fs::FsNode;

#[derive(Clone)]
pub struct FileDescriptor {
    pub node: Arc<dyn FsNode>,
    pub pos: u64,
    pub mode: u32,
}

impl FileDescriptor {
    /// Open a descriptor on `node`, notifying it of the new reference.
    pub fn open(node: Arc<dyn FsNode>, mode: u32) -> FileDescriptor {
        node.on_open();
        FileDescriptor { node, pos: 0, mode }
    }

    /// Duplicate for `dup`/`fork`: shared node, independent position.
    pub fn duplicate(&self) -> FileDescriptor {
        self.node.on_open();
        self.clone()
    }

    pub fn flags(&self) -> OpenFlags {
        OpenFlags::from_bits_truncate(self.mode)
    }

    pub fn is_nonblocking(&self) -> bool {
        self.flags().contains(OpenFlags::NONBLOCK)
    }
}

pub struct FdTable {
    slots: Vec<Option<FileDescriptor>>,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable { slots: Vec::new() }
    }

    /// Insert at the lowest unused index.
    pub fn allocate(&mut self, descriptor: FileDescriptor) -> usize {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(descriptor);
                return index;
            }
        }
        self.slots.push(Some(descriptor));
        self.slots.len() - 1
    }

    pub fn get(&self, fd: usize) -> Option<&FileDescriptor> {
        self.slots.get(fd)?.as_ref()
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut FileDescriptor> {
        self.slots.get_mut(fd)?.as_mut()
    }

    /// Install `descriptor` at exactly `fd`, closing any previous occupant.
    pub fn replace(&mut self, fd: usize, descriptor: FileDescriptor) {
        if fd >= self.slots.len() {
            self.slots.resize_with(fd + 1, || None);
        }
        if let Some(previous) = self.slots[fd].take() {
            previous.node.on_close();
        }
        self.slots[fd] = Some(descriptor);
    }

    pub fn close(&mut self, fd: usize) -> Result<(), ()> {
        match self.slots.get_mut(fd).and_then(Option::take) {
            Some(descriptor) => {
                descriptor.node.on_close();
                Ok(())
            }
            None => Err(()),
        }
    }

    /// Close descriptors marked `O_CLOEXEC`. Used on exec.
    pub fn close_cloexec(&mut self) {
        for slot in self.slots.iter_mut() {
            let close = slot
                .as_ref()
                .map(|d| d.flags().contains(OpenFlags::CLOEXEC))
                .unwrap_or(false);
            if close {
                if let Some(descriptor) = slot.take() {
                    descriptor.node.on_close();
                }
            }
        }
    }

    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(descriptor) = slot.take() {
                descriptor.node.on_close();
            }
        }
        self.slots.clear();
    }

    /// Duplicate the whole table for fork: shared nodes, independent
    /// positions and modes.
    pub fn duplicate_table(&self) -> FdTable {
        FdTable {
            slots: self
                .slots
                .iter()
                .map(|slot| slot.as_ref().map(FileDescriptor::duplicate))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &FileDescriptor)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, slot)| slot.as_ref().map(|d| (fd, d)))
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
