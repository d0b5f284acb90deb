//! The process-wide shared memory registry.
//!
//! Shared VM objects are named by 64-bit keys. Destruction is deferred: the
//! object is finalised only once destruction has been requested *and* the
//! last mapping is gone.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use spinning_top::Spinlock;

use super::vm_object::VmObject;
use super::{page_align_up, MapError};

struct Registry {
    next_key: i64,
    objects: BTreeMap<i64, Arc<VmObject>>,
}

static REGISTRY: Spinlock<Registry> = Spinlock::new(Registry {
    next_key: 1,
    objects: BTreeMap::new(),
});

/// Create a shared object and return its key.
pub fn create(size: u64, flags: u64, owner: u64, recipient: u64) -> Result<i64, MapError> {
    if size == 0 {
        return Err(MapError::InvalidArgument);
    }
    let size = page_align_up(size) as usize;
    let recipient = if flags & opal_abi::mem::SMEM_PRIVATE != 0 {
        Some(recipient)
    } else {
        None
    };

    let mut registry = REGISTRY.lock();
    let key = registry.next_key;
    registry.next_key += 1;
    let object = VmObject::shared(key, size, owner, recipient);
    registry.objects.insert(key, object);
    Ok(key)
}

pub fn get(key: i64) -> Option<Arc<VmObject>> {
    REGISTRY.lock().objects.get(&key).cloned()
}

/// Whether `pid` may map the object. Private objects are restricted to the
/// owner and the named recipient.
pub fn can_access(key: i64, pid: u64) -> bool {
    let registry = REGISTRY.lock();
    let Some(object) = registry.objects.get(&key) else {
        return false;
    };
    let state = object.shared_state().expect("registry holds shared objects");
    match state.recipient {
        Some(recipient) => state.owner == pid || recipient == pid,
        None => true,
    }
}

/// Whether `pid` may destroy the object.
pub fn can_modify(key: i64, pid: u64) -> bool {
    let registry = REGISTRY.lock();
    let Some(object) = registry.objects.get(&key) else {
        return false;
    };
    let state = object.shared_state().expect("registry holds shared objects");
    state.owner == pid || state.recipient == Some(pid)
}

/// Request destruction. The object survives until its last mapping is
/// removed.
pub fn destroy(key: i64) {
    let mut registry = REGISTRY.lock();
    let Some(object) = registry.objects.get(&key) else {
        return;
    };
    let state = object.shared_state().expect("registry holds shared objects");
    state.destroy_requested.store(true, Ordering::Release);
    if !object.has_mappings() {
        registry.objects.remove(&key);
    }
}

/// Called by the object when its last mapping is dropped after destruction
/// was requested.
pub(crate) fn release_if_unused(key: i64) {
    let mut registry = REGISTRY.lock();
    let remove = match registry.objects.get(&key) {
        Some(object) => {
            let state = object.shared_state().expect("registry holds shared objects");
            state.destroy_requested.load(Ordering::Acquire) && !object.has_mappings()
        }
        None => false,
    };
    if remove {
        registry.objects.remove(&key);
    }
}

#[cfg(any(test, feature = "testing"))]
pub(crate) fn reset() {
    let mut registry = REGISTRY.lock();
    registry.next_key = 1;
    registry.objects.clear();
}
