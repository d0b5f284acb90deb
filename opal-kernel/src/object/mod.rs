//! Kernel objects: reference-counted entities addressable through handles.
//!
//! Each object implements the focused accessors it supports; callers
//! dispatch through the `as_*` methods rather than downcasting.

mod watcher;

pub use watcher::{WatchList, Watcher};

use crate::ipc::{MessageEndpoint, MessageInterface, Service};
use crate::memory::VmObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Service,
    Interface,
    Endpoint,
    SharedMemory,
}

pub trait KernelObject: Send + Sync {
    fn kind(&self) -> ObjectKind;

    /// Transition the object to its terminal state. Idempotent.
    fn destroy(&self);

    /// Subscribe a watcher to this object's signal source.
    fn watch(&self, _watcher: &Watcher, _events: u32) {}

    fn unwatch(&self, _watcher: &Watcher) {}

    fn as_service(&self) -> Option<&Service> {
        None
    }

    fn as_interface(&self) -> Option<&MessageInterface> {
        None
    }

    fn as_endpoint(&self) -> Option<&MessageEndpoint> {
        None
    }

    fn as_shared_memory(&self) -> Option<&VmObject> {
        None
    }
}
