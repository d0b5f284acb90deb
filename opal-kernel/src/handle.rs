//! Per-process handle tables.
//!
//! A handle is a small positive integer naming a kernel object. Ids are
//! allocated densely from 1 and recycled on destruction. Destroying a
//! handle releases exactly one reference to the referent; the object is
//! finalised when the last reference drops.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::object::KernelObject;

pub type HandleId = u32;

pub struct HandleTable {
    slots: Vec<Option<Arc<dyn KernelObject>>>,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable { slots: Vec::new() }
    }

    /// Register an object and return its id.
    pub fn register(&mut self, object: Arc<dyn KernelObject>) -> HandleId {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(object);
                return index as HandleId + 1;
            }
        }
        self.slots.push(Some(object));
        self.slots.len() as HandleId
    }

    pub fn find(&self, id: HandleId) -> Option<Arc<dyn KernelObject>> {
        if id == 0 {
            return None;
        }
        self.slots.get(id as usize - 1)?.clone()
    }

    /// Remove the handle, returning its referent.
    pub fn destroy(&mut self, id: HandleId) -> Option<Arc<dyn KernelObject>> {
        if id == 0 {
            return None;
        }
        self.slots.get_mut(id as usize - 1)?.take()
    }

    /// Remove every handle. Used when a process ends.
    pub fn drain(&mut self) -> Vec<Arc<dyn KernelObject>> {
        self.slots.drain(..).flatten().collect()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{KernelObject, ObjectKind};
    use alloc::sync::Arc;

    struct Dummy;

    impl KernelObject for Dummy {
        fn kind(&self) -> ObjectKind {
            ObjectKind::Service
        }
        fn destroy(&self) {}
    }

    #[test]
    fn ids_are_dense_and_recycled() {
        let mut table = HandleTable::new();
        let a = table.register(Arc::new(Dummy));
        let b = table.register(Arc::new(Dummy));
        let c = table.register(Arc::new(Dummy));
        assert_eq!((a, b, c), (1, 2, 3));

        assert!(table.destroy(b).is_some());
        assert!(table.find(b).is_none());
        assert_eq!(table.register(Arc::new(Dummy)), b);
    }

    #[test]
    fn destroyed_handles_stop_resolving() {
        let mut table = HandleTable::new();
        let id = table.register(Arc::new(Dummy));
        assert!(table.find(id).is_some());
        assert!(table.destroy(id).is_some());
        assert!(table.destroy(id).is_none());
        assert!(table.find(id).is_none());
        assert!(table.find(0).is_none());
    }
}
