//! VM objects: the storage identity behind mapped regions.
//!
//! An object provisions physical pages on demand ("hit"). Pages are held as
//! `Arc<Frame>` so a fork can share them copy-on-write: a write hit on a
//! page with more than one referent allocates a private copy for the writer.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spinning_top::Spinlock;

use crate::fs::FsNode;

use super::phys::Frame;
use super::{pages_for, shared, MapError, PAGE_SIZE};

enum VmKind {
    /// Zero-filled, demand-paged.
    Anonymous,
    /// Pages read from a filesystem node at `base_offset`.
    FileBacked {
        node: Arc<dyn FsNode>,
        base_offset: u64,
    },
    /// Named by a process-wide key; destruction is deferred until the key is
    /// released and no mapping remains.
    Shared(SharedState),
}

pub(crate) struct SharedState {
    pub key: i64,
    pub owner: u64,
    pub recipient: Option<u64>,
    pub destroy_requested: AtomicBool,
    mappings: AtomicUsize,
}

pub struct VmObject {
    size: usize,
    kind: VmKind,
    pages: Spinlock<Vec<Option<Arc<Frame>>>>,
}

impl VmObject {
    fn new(size: usize, kind: VmKind) -> Arc<VmObject> {
        let count = pages_for(size);
        let mut pages = Vec::new();
        pages.resize_with(count, || None);
        Arc::new(VmObject {
            size,
            kind,
            pages: Spinlock::new(pages),
        })
    }

    pub fn anonymous(size: usize) -> Arc<VmObject> {
        Self::new(size, VmKind::Anonymous)
    }

    pub fn file_backed(node: Arc<dyn FsNode>, base_offset: u64, size: usize) -> Arc<VmObject> {
        Self::new(size, VmKind::FileBacked { node, base_offset })
    }

    pub(crate) fn shared(key: i64, size: usize, owner: u64, recipient: Option<u64>) -> Arc<VmObject> {
        Self::new(
            size,
            VmKind::Shared(SharedState {
                key,
                owner,
                recipient,
                destroy_requested: AtomicBool::new(false),
                mappings: AtomicUsize::new(0),
            }),
        )
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.kind, VmKind::Shared(_))
    }

    pub(crate) fn shared_state(&self) -> Option<&SharedState> {
        match &self.kind {
            VmKind::Shared(state) => Some(state),
            _ => None,
        }
    }

    /// Provision the page containing `index` and return its frame.
    ///
    /// A write hit on a copy-on-write page that is still shared allocates a
    /// private copy for this object. A hit always terminates: provisioning
    /// never re-enters fault handling.
    pub fn page(&self, index: usize, write: bool, cow: bool) -> Result<Arc<Frame>, MapError> {
        if index >= pages_for(self.size) {
            return Err(MapError::BadAddress);
        }

        let mut pages = self.pages.lock();
        match &pages[index] {
            None => {
                let frame = Frame::allocate_zeroed()?;
                if let VmKind::FileBacked { node, base_offset } = &self.kind {
                    let mut buf = [0u8; PAGE_SIZE];
                    let offset = base_offset + (index * PAGE_SIZE) as u64;
                    let n = node.read(offset, &mut buf).map_err(|_| MapError::Io)?;
                    frame.copy_from(0, &buf[..n]);
                }
                let frame = Arc::new(frame);
                pages[index] = Some(frame.clone());
                Ok(frame)
            }
            Some(frame) => {
                if write && cow && Arc::strong_count(frame) > 1 {
                    let copy = Frame::allocate_zeroed()?;
                    copy.copy_page(frame);
                    let copy = Arc::new(copy);
                    pages[index] = Some(copy.clone());
                    Ok(copy)
                } else {
                    Ok(frame.clone())
                }
            }
        }
    }

    /// Write directly into the object's backing pages, provisioning as
    /// needed. Used by the executable loader before the image is live.
    pub fn write_bytes(&self, offset: usize, mut data: &[u8]) -> Result<(), MapError> {
        if offset + data.len() > self.size {
            return Err(MapError::BadAddress);
        }
        let mut pos = offset;
        while !data.is_empty() {
            let page_off = pos % PAGE_SIZE;
            let chunk = (PAGE_SIZE - page_off).min(data.len());
            let frame = self.page(pos / PAGE_SIZE, true, false)?;
            frame.copy_from(page_off, &data[..chunk]);
            data = &data[chunk..];
            pos += chunk;
        }
        Ok(())
    }

    /// Resident bytes within the window `[offset, offset + len)`.
    pub fn resident_bytes(&self, offset: usize, len: usize) -> usize {
        let pages = self.pages.lock();
        let first = offset / PAGE_SIZE;
        let last = pages_for(offset + len);
        pages
            .iter()
            .take(last)
            .skip(first)
            .filter(|p| p.is_some())
            .count()
            * PAGE_SIZE
    }

    /// Clone for fork: private objects share their pages copy-on-write,
    /// shared objects are returned as-is.
    pub fn clone_cow(self: &Arc<Self>) -> Arc<VmObject> {
        match &self.kind {
            VmKind::Shared(_) => self.clone(),
            VmKind::Anonymous => {
                let pages = self.pages.lock().clone();
                Arc::new(VmObject {
                    size: self.size,
                    kind: VmKind::Anonymous,
                    pages: Spinlock::new(pages),
                })
            }
            VmKind::FileBacked { node, base_offset } => {
                let pages = self.pages.lock().clone();
                Arc::new(VmObject {
                    size: self.size,
                    kind: VmKind::FileBacked {
                        node: node.clone(),
                        base_offset: *base_offset,
                    },
                    pages: Spinlock::new(pages),
                })
            }
        }
    }

    /// A region now maps this object.
    pub(crate) fn retain_mapping(&self) {
        if let VmKind::Shared(state) = &self.kind {
            state.mappings.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// A region mapping this object was removed. For a shared object whose
    /// destruction was requested, the last unmap finalises it.
    pub(crate) fn release_mapping(&self) {
        if let VmKind::Shared(state) = &self.kind {
            let remaining = state.mappings.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining == 0 && state.destroy_requested.load(Ordering::Acquire) {
                shared::release_if_unused(state.key);
            }
        }
    }

    pub(crate) fn has_mappings(&self) -> bool {
        match &self.kind {
            VmKind::Shared(state) => state.mappings.load(Ordering::Acquire) > 0,
            _ => false,
        }
    }
}

impl crate::object::KernelObject for VmObject {
    fn kind(&self) -> crate::object::ObjectKind {
        crate::object::ObjectKind::SharedMemory
    }

    /// Destruction stays deferred while mappings remain.
    fn destroy(&self) {
        if let Some(state) = self.shared_state() {
            shared::destroy(state.key);
        }
    }

    fn as_shared_memory(&self) -> Option<&VmObject> {
        Some(self)
    }
}
