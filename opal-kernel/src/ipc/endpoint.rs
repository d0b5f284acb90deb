//! Message endpoints.
//!
//! The endpoint↔peer relation is cyclic, so endpoints live in an arena and
//! refer to their peer by index plus a generation counter, never by an
//! owning pointer. Destroying an endpoint bumps its slot generation; the
//! peer observes the stale generation as "disconnected".

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spinning_top::Spinlock;

use crate::object::{KernelObject, ObjectKind, WatchList, Watcher};

use super::IpcError;

/// A message arrived in the endpoint's queue.
pub const EP_EVENT_MESSAGE: u32 = 1 << 0;
/// Space opened up in the endpoint's queue.
pub const EP_EVENT_SPACE: u32 = 1 << 1;
/// One side of the pair was destroyed.
pub const EP_EVENT_DISCONNECT: u32 = 1 << 2;

/// Bound on queued messages per endpoint; writers park when the peer's
/// queue is full.
pub const ENDPOINT_QUEUE_LIMIT: usize = 256;

pub struct Message {
    pub id: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EndpointRef {
    index: usize,
    generation: u64,
}

struct EndpointState {
    queue: VecDeque<Message>,
    peer: EndpointRef,
    /// Set when the peer is destroyed.
    disconnected: bool,
    watchers: Arc<WatchList>,
}

struct Slot {
    generation: u64,
    state: Option<EndpointState>,
}

struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Arena {
    fn allocate(&mut self, state: EndpointState) -> EndpointRef {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.state = Some(state);
                EndpointRef {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    state: Some(state),
                });
                EndpointRef {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        }
    }

    fn state(&mut self, eref: EndpointRef) -> Option<&mut EndpointState> {
        let slot = self.slots.get_mut(eref.index)?;
        if slot.generation != eref.generation {
            return None;
        }
        slot.state.as_mut()
    }
}

static ARENA: Spinlock<Arena> = Spinlock::new(Arena {
    slots: Vec::new(),
    free: Vec::new(),
});

/// One side of a paired IPC channel carrying typed, sized messages.
#[derive(Debug)]
pub struct MessageEndpoint {
    slot: EndpointRef,
    max_message_size: u16,
    watchers: Arc<WatchList>,
}

impl MessageEndpoint {
    /// Create a connected pair. Both ends share the message size limit.
    pub fn create_pair(
        max_message_size: u16,
    ) -> (Arc<MessageEndpoint>, Arc<MessageEndpoint>) {
        let watchers_a = Arc::new(WatchList::new());
        let watchers_b = Arc::new(WatchList::new());

        let mut arena = ARENA.lock();
        let a = arena.allocate(EndpointState {
            queue: VecDeque::new(),
            peer: EndpointRef {
                index: 0,
                generation: 0,
            },
            disconnected: false,
            watchers: watchers_a.clone(),
        });
        let b = arena.allocate(EndpointState {
            queue: VecDeque::new(),
            peer: a,
            disconnected: false,
            watchers: watchers_b.clone(),
        });
        arena
            .state(a)
            .expect("freshly allocated endpoint")
            .peer = b;
        drop(arena);

        (
            Arc::new(MessageEndpoint {
                slot: a,
                max_message_size,
                watchers: watchers_a,
            }),
            Arc::new(MessageEndpoint {
                slot: b,
                max_message_size,
                watchers: watchers_b,
            }),
        )
    }

    pub fn max_message_size(&self) -> u16 {
        self.max_message_size
    }

    pub(crate) fn watch_list(&self) -> &Arc<WatchList> {
        &self.watchers
    }

    /// Queue a message on the peer. Fails with `MessageTooLarge` above the
    /// interface limit, `NotConnected` after the peer is destroyed, and
    /// `WouldBlock` when the peer's queue is full.
    pub fn write(&self, id: u64, data: &[u8]) -> Result<(), IpcError> {
        if data.len() > self.max_message_size as usize {
            return Err(IpcError::MessageTooLarge);
        }

        let peer_watchers = {
            let mut arena = ARENA.lock();
            let own = arena.state(self.slot).ok_or(IpcError::NotConnected)?;
            if own.disconnected {
                return Err(IpcError::NotConnected);
            }
            let peer_ref = own.peer;
            let peer = arena.state(peer_ref).ok_or(IpcError::NotConnected)?;
            if peer.queue.len() >= ENDPOINT_QUEUE_LIMIT {
                return Err(IpcError::WouldBlock);
            }
            peer.queue.push_back(Message {
                id,
                data: data.to_vec(),
            });
            peer.watchers.clone()
        };

        peer_watchers.signal(EP_EVENT_MESSAGE);
        Ok(())
    }

    /// Dequeue the head message, or `None` when the queue is empty.
    pub fn read(&self) -> Option<Message> {
        self.take_message(|_| true)
    }

    /// Dequeue the first message whose id is `id`, leaving every other
    /// message in arrival order.
    pub fn read_matching(&self, id: u64) -> Option<Message> {
        self.take_message(|message| message.id == id)
    }

    fn take_message(&self, mut want: impl FnMut(&Message) -> bool) -> Option<Message> {
        let (message, own_watchers) = {
            let mut arena = ARENA.lock();
            let own = arena.state(self.slot)?;
            let position = own.queue.iter().position(|m| want(m))?;
            let message = own.queue.remove(position)?;
            (message, own.watchers.clone())
        };
        // The peer's writers wait for space in our queue, and they are
        // registered on our watch list.
        own_watchers.signal(EP_EVENT_SPACE);
        Some(message)
    }

    pub fn has_message(&self) -> bool {
        let mut arena = ARENA.lock();
        arena
            .state(self.slot)
            .map(|s| !s.queue.is_empty())
            .unwrap_or(false)
    }

    pub fn has_message_with_id(&self, id: u64) -> bool {
        let mut arena = ARENA.lock();
        arena
            .state(self.slot)
            .map(|s| s.queue.iter().any(|m| m.id == id))
            .unwrap_or(false)
    }

    /// Whether the peer can currently accept a message from us.
    pub fn peer_has_space(&self) -> Result<bool, IpcError> {
        let mut arena = ARENA.lock();
        let own = arena.state(self.slot).ok_or(IpcError::NotConnected)?;
        if own.disconnected {
            return Err(IpcError::NotConnected);
        }
        let peer_ref = own.peer;
        let peer = arena.state(peer_ref).ok_or(IpcError::NotConnected)?;
        Ok(peer.queue.len() < ENDPOINT_QUEUE_LIMIT)
    }

    pub fn is_disconnected(&self) -> bool {
        let mut arena = ARENA.lock();
        match arena.state(self.slot) {
            Some(state) => state.disconnected,
            None => true,
        }
    }

    /// The watch list of the peer endpoint, used by writers waiting for
    /// queue space.
    pub(crate) fn peer_watch_list(&self) -> Option<Arc<WatchList>> {
        let mut arena = ARENA.lock();
        let peer_ref = arena.state(self.slot)?.peer;
        arena.state(peer_ref).map(|peer| peer.watchers.clone())
    }

    fn destroy_inner(&self) {
        let notify = {
            let mut arena = ARENA.lock();
            let Some(own) = arena.state(self.slot) else {
                return; // already destroyed
            };
            let peer_ref = own.peer;
            let own_watchers = own.watchers.clone();

            let slot = &mut arena.slots[self.slot.index];
            slot.state = None;
            slot.generation += 1;
            arena.free.push(self.slot.index);

            let peer_watchers = arena.state(peer_ref).map(|peer| {
                peer.disconnected = true;
                peer.watchers.clone()
            });
            (own_watchers, peer_watchers)
        };

        let (own_watchers, peer_watchers) = notify;
        own_watchers.signal(EP_EVENT_DISCONNECT);
        if let Some(peer_watchers) = peer_watchers {
            peer_watchers.signal(EP_EVENT_DISCONNECT | EP_EVENT_MESSAGE);
        }
    }
}

impl KernelObject for MessageEndpoint {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Endpoint
    }

    fn destroy(&self) {
        self.destroy_inner();
    }

    fn watch(&self, watcher: &Watcher, events: u32) {
        self.watchers.add(watcher.blocker(), events);
        // A condition that is already pending signals immediately.
        if self.has_message() || self.is_disconnected() {
            watcher.blocker().wake();
        }
    }

    fn unwatch(&self, watcher: &Watcher) {
        self.watchers.remove(watcher.blocker());
    }

    fn as_endpoint(&self) -> Option<&MessageEndpoint> {
        Some(self)
    }
}

impl Drop for MessageEndpoint {
    fn drop(&mut self) {
        self.destroy_inner();
    }
}

#[cfg(any(test, feature = "testing"))]
pub(crate) fn reset() {
    let mut arena = ARENA.lock();
    arena.slots.clear();
    arena.free.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn messages_arrive_in_write_order() {
        let _guard = testing::fixture();
        let (a, b) = MessageEndpoint::create_pair(64);
        a.write(1, b"first").unwrap();
        a.write(2, b"second").unwrap();

        let first = b.read().unwrap();
        let second = b.read().unwrap();
        assert_eq!((first.id, first.data.as_slice()), (1, b"first".as_slice()));
        assert_eq!((second.id, second.data.as_slice()), (2, b"second".as_slice()));
        assert!(b.read().is_none());
    }

    #[test]
    fn matching_reads_leave_other_messages_queued_in_order() {
        let _guard = testing::fixture();
        let (a, b) = MessageEndpoint::create_pair(64);
        a.write(5, b"x").unwrap();
        a.write(7, b"reply").unwrap();
        a.write(6, b"y").unwrap();

        let reply = b.read_matching(7).unwrap();
        assert_eq!(reply.data, b"reply");
        assert_eq!(b.read().unwrap().id, 5);
        assert_eq!(b.read().unwrap().id, 6);
    }

    #[test]
    fn oversized_messages_are_rejected() {
        let _guard = testing::fixture();
        let (a, _b) = MessageEndpoint::create_pair(4);
        assert_eq!(a.write(1, b"toolong"), Err(IpcError::MessageTooLarge));
    }

    #[test]
    fn destroying_one_end_disconnects_the_other() {
        let _guard = testing::fixture();
        let (a, b) = MessageEndpoint::create_pair(16);
        a.write(1, b"pending").unwrap();
        a.destroy();

        // Pending data survives the disconnect; further writes fail.
        assert!(b.read().is_some());
        assert!(b.is_disconnected());
        assert_eq!(b.write(1, b"z"), Err(IpcError::NotConnected));
    }

    #[test]
    fn backpressure_reports_would_block() {
        let _guard = testing::fixture();
        let (a, b) = MessageEndpoint::create_pair(8);
        for i in 0..ENDPOINT_QUEUE_LIMIT {
            a.write(i as u64, b"m").unwrap();
        }
        assert_eq!(a.write(999, b"m"), Err(IpcError::WouldBlock));
        assert!(!a.peer_has_space().unwrap());

        b.read().unwrap();
        assert!(a.peer_has_space().unwrap());
        a.write(999, b"m").unwrap();
    }
}
