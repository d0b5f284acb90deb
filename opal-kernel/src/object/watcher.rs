//! The generic multi-object wait support.
//!
//! A `WatchList` is the signal source side: kernel objects, processes, and
//! filesystem nodes each embed one and fire it when their state changes. A
//! `Watcher` is the consumer side: it owns the blocker a waiting thread
//! parks on and remembers its subscriptions so they are removed when the
//! wait ends.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spinning_top::Spinlock;

use crate::fs::FsNode;
use crate::object::KernelObject;
use crate::sched::Blocker;

#[derive(Debug)]
struct WatchEntry {
    blocker: Weak<Blocker>,
    events: u32,
}

/// The registration list on a signal source. An `events` mask of zero
/// subscribes to every signal.
#[derive(Debug)]
pub struct WatchList {
    entries: Spinlock<Vec<WatchEntry>>,
}

impl WatchList {
    pub const fn new() -> WatchList {
        WatchList {
            entries: Spinlock::new(Vec::new()),
        }
    }

    /// Add a subscription. A duplicate add for the same blocker is a no-op.
    pub fn add(&self, blocker: &Arc<Blocker>, events: u32) {
        let mut entries = self.entries.lock();
        if entries
            .iter()
            .any(|e| e.blocker.as_ptr() == Arc::as_ptr(blocker))
        {
            return;
        }
        entries.push(WatchEntry {
            blocker: Arc::downgrade(blocker),
            events,
        });
    }

    pub fn remove(&self, blocker: &Arc<Blocker>) {
        self.entries
            .lock()
            .retain(|e| e.blocker.as_ptr() != Arc::as_ptr(blocker));
    }

    /// Fire subscriptions matching `events`, pruning dead ones.
    pub fn signal(&self, events: u32) {
        let mut fired = Vec::new();
        {
            let mut entries = self.entries.lock();
            entries.retain(|e| match e.blocker.upgrade() {
                Some(blocker) => {
                    if e.events == 0 || e.events & events != 0 {
                        fired.push(blocker);
                    }
                    true
                }
                None => false,
            });
        }
        // Waking takes the scheduler lock; do it outside our own.
        for blocker in fired {
            blocker.wake();
        }
    }
}

enum Watched {
    Object(Arc<dyn KernelObject>),
    Node(Arc<dyn FsNode>),
}

/// A single wait over any number of subjects.
pub struct Watcher {
    blocker: Arc<Blocker>,
    watched: Spinlock<Vec<Watched>>,
}

impl Watcher {
    pub fn new() -> Watcher {
        Watcher {
            blocker: Blocker::new(),
            watched: Spinlock::new(Vec::new()),
        }
    }

    pub fn blocker(&self) -> &Arc<Blocker> {
        &self.blocker
    }

    /// Watch a kernel object. Duplicate watches of one subject are no-ops.
    pub fn watch_object(&self, object: &Arc<dyn KernelObject>, events: u32) {
        {
            let watched = self.watched.lock();
            if watched.iter().any(|w| match w {
                Watched::Object(existing) => Arc::ptr_eq(existing, object),
                _ => false,
            }) {
                return;
            }
        }
        object.watch(self, events);
        self.watched.lock().push(Watched::Object(object.clone()));
    }

    /// Watch a filesystem node for the poll events in `events`.
    pub fn watch_node(&self, node: &Arc<dyn FsNode>, events: u32) {
        {
            let watched = self.watched.lock();
            if watched.iter().any(|w| match w {
                Watched::Node(existing) => Arc::ptr_eq(existing, node),
                _ => false,
            }) {
                return;
            }
        }
        node.watch(self, events);
        self.watched.lock().push(Watched::Node(node.clone()));
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let watched = core::mem::take(&mut *self.watched.lock());
        for entry in watched {
            match entry {
                Watched::Object(object) => object.unwatch(self),
                Watched::Node(node) => node.unwatch(self),
            }
        }
    }
}
