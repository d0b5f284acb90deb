//! Services and interfaces.
//!
//! A service is a process-wide named container of interfaces. Connecting to
//! `"service/interface"` creates an endpoint pair: the caller gets one end,
//! the other is queued on the interface for accept.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spinning_top::Spinlock;

use crate::object::{KernelObject, ObjectKind, WatchList, Watcher};

use super::endpoint::MessageEndpoint;
use super::IpcError;

/// A connection is waiting on the interface's pending list.
pub const IF_EVENT_CONNECTION: u32 = 1 << 0;

#[derive(Debug)]
struct InterfaceInner {
    pending: VecDeque<Arc<MessageEndpoint>>,
    active: bool,
}

/// A named connection point exposed by a service.
#[derive(Debug)]
pub struct MessageInterface {
    name: String,
    max_message_size: u16,
    inner: Spinlock<InterfaceInner>,
    watchers: WatchList,
}

impl MessageInterface {
    fn new(name: &str, max_message_size: u16) -> Arc<MessageInterface> {
        Arc::new(MessageInterface {
            name: String::from(name),
            max_message_size,
            inner: Spinlock::new(InterfaceInner {
                pending: VecDeque::new(),
                active: true,
            }),
            watchers: WatchList::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_message_size(&self) -> u16 {
        self.max_message_size
    }

    /// Connect a client: returns the client end, queues the server end for
    /// accept, and signals the accept waiter.
    pub fn connect(&self) -> Result<Arc<MessageEndpoint>, IpcError> {
        let (server, client) = MessageEndpoint::create_pair(self.max_message_size);
        {
            let mut inner = self.inner.lock();
            if !inner.active {
                return Err(IpcError::InvalidArgument);
            }
            inner.pending.push_back(server);
        }
        self.watchers.signal(IF_EVENT_CONNECTION);
        Ok(client)
    }

    /// Pop one pending connection, in connect order.
    pub fn accept(&self) -> Option<Arc<MessageEndpoint>> {
        self.inner.lock().pending.pop_front()
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().pending.is_empty()
    }

    fn destroy_inner(&self) {
        let dropped = {
            let mut inner = self.inner.lock();
            inner.active = false;
            core::mem::take(&mut inner.pending)
        };
        // Dropping the queued server ends disconnects their clients.
        drop(dropped);
    }
}

impl KernelObject for MessageInterface {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Interface
    }

    fn destroy(&self) {
        self.destroy_inner();
    }

    fn watch(&self, watcher: &Watcher, events: u32) {
        self.watchers.add(watcher.blocker(), events);
        // A connection that is already pending signals immediately.
        if self.has_pending() {
            watcher.blocker().wake();
        }
    }

    fn unwatch(&self, watcher: &Watcher) {
        self.watchers.remove(watcher.blocker());
    }

    fn as_interface(&self) -> Option<&MessageInterface> {
        Some(self)
    }
}

#[derive(Debug)]
struct ServiceInner {
    interfaces: Vec<Arc<MessageInterface>>,
    destroyed: bool,
}

/// A process-wide named container of interfaces.
#[derive(Debug)]
pub struct Service {
    name: String,
    inner: Spinlock<ServiceInner>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add an interface. Names are unique within the service; the message
    /// size must be non-zero and within the protocol bound.
    pub fn create_interface(
        &self,
        name: &str,
        max_message_size: u16,
    ) -> Result<Arc<MessageInterface>, IpcError> {
        if name.is_empty() || name.contains('/') {
            return Err(IpcError::InvalidArgument);
        }
        if max_message_size == 0 || max_message_size > opal_abi::ipc::MESSAGE_SIZE_MAX {
            return Err(IpcError::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(IpcError::InvalidArgument);
        }
        if inner.interfaces.iter().any(|i| i.name() == name) {
            return Err(IpcError::Exists);
        }
        let interface = MessageInterface::new(name, max_message_size);
        inner.interfaces.push(interface.clone());
        Ok(interface)
    }

    pub fn resolve_interface(&self, name: &str) -> Option<Arc<MessageInterface>> {
        self.inner
            .lock()
            .interfaces
            .iter()
            .find(|i| i.name() == name)
            .cloned()
    }

    fn destroy_inner(&self) {
        let interfaces = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            core::mem::take(&mut inner.interfaces)
        };
        for interface in interfaces {
            interface.destroy_inner();
        }
        unregister(&self.name);
    }
}

impl KernelObject for Service {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Service
    }

    fn destroy(&self) {
        self.destroy_inner();
    }

    fn as_service(&self) -> Option<&Service> {
        Some(self)
    }
}

static SERVICES: Spinlock<Vec<Arc<Service>>> = Spinlock::new(Vec::new());

/// Register a service. The name is unique process-wide.
pub fn create_service(name: &str) -> Result<Arc<Service>, IpcError> {
    if name.is_empty() || name.contains('/') {
        return Err(IpcError::InvalidArgument);
    }
    let mut services = SERVICES.lock();
    if services.iter().any(|s| s.name() == name) {
        return Err(IpcError::Exists);
    }
    let service = Arc::new(Service {
        name: String::from(name),
        inner: Spinlock::new(ServiceInner {
            interfaces: Vec::new(),
            destroyed: false,
        }),
    });
    services.push(service.clone());
    Ok(service)
}

pub fn resolve_service(name: &str) -> Option<Arc<Service>> {
    SERVICES.lock().iter().find(|s| s.name() == name).cloned()
}

fn unregister(name: &str) {
    SERVICES.lock().retain(|s| s.name() != name);
}

/// Resolve a `"service/interface"` path and connect to it. The slash
/// separator is mandatory.
pub fn connect(path: &str) -> Result<Arc<MessageEndpoint>, IpcError> {
    let (service_name, interface_name) =
        path.split_once('/').ok_or(IpcError::InvalidArgument)?;
    let service = resolve_service(service_name).ok_or(IpcError::NotFound)?;
    let interface = service
        .resolve_interface(interface_name)
        .ok_or(IpcError::NotFound)?;
    interface.connect()
}

#[cfg(any(test, feature = "testing"))]
pub(crate) fn reset() {
    SERVICES.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn service_names_are_unique() {
        let _guard = testing::fixture();
        create_service("wm").unwrap();
        assert_eq!(create_service("wm").unwrap_err(), IpcError::Exists);
    }

    #[test]
    fn connect_requires_the_slash_separator() {
        let _guard = testing::fixture();
        let service = create_service("svc").unwrap();
        service.create_interface("if", 64).unwrap();

        assert_eq!(connect("svc").unwrap_err(), IpcError::InvalidArgument);
        assert_eq!(connect("nosuch/if").unwrap_err(), IpcError::NotFound);
        assert_eq!(connect("svc/nosuch").unwrap_err(), IpcError::NotFound);
        assert!(connect("svc/if").is_ok());
    }

    #[test]
    fn accept_pops_connections_in_connect_order() {
        let _guard = testing::fixture();
        let service = create_service("svc").unwrap();
        let interface = service.create_interface("if", 64).unwrap();

        let first = connect("svc/if").unwrap();
        let second = connect("svc/if").unwrap();

        let a = interface.accept().expect("first pending");
        let b = interface.accept().expect("second pending");
        assert!(interface.accept().is_none());

        // Endpoints pair up in connect order.
        first.write(1, b"one").unwrap();
        second.write(2, b"two").unwrap();
        assert_eq!(a.read().unwrap().id, 1);
        assert_eq!(b.read().unwrap().id, 2);
    }

    #[test]
    fn interface_message_size_bounds_are_enforced() {
        let _guard = testing::fixture();
        let service = create_service("svc").unwrap();
        assert_eq!(
            service.create_interface("if", 0).unwrap_err(),
            IpcError::InvalidArgument
        );
        service.create_interface("if", 64).unwrap();
        assert_eq!(
            service.create_interface("if", 64).unwrap_err(),
            IpcError::Exists
        );
    }
}
