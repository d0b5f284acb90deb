//! The socket layer.
//!
//! A socket is one flat filesystem node tagged with its concrete kind. The
//! syscall layer reaches it through `FsNode::as_socket` and owns all
//! blocking; socket operations themselves never park.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spinning_top::Spinlock;
use zerocopy::FromBytes;

use opal_abi::poll::{POLLHUP, POLLIN, POLLOUT};
use opal_abi::socket::{
    SockAddrIn, SockAddrUn, AF_INET, AF_UNIX, SOCK_DGRAM, SOCK_SEQPACKET, SOCK_STREAM,
    SOCK_TYPE_MASK,
};

use crate::fs::{FsError, FsNode, NodeType};
use crate::object::{WatchList, Watcher};

use super::udp::UdpSocket;
use super::{Ipv4Address, SocketError};

/// Stream buffer bound per direction: 128 KiB.
pub const STREAM_MAX_BUFSIZE: usize = 0x20000;

/// Pending connection backlog limit.
pub const CONNECTION_BACKLOG: usize = 128;

enum Inbound {
    Stream(VecDeque<u8>),
    Datagram { queue: VecDeque<Vec<u8>>, bytes: usize },
}

impl Inbound {
    fn is_empty(&self) -> bool {
        match self {
            Inbound::Stream(buf) => buf.is_empty(),
            Inbound::Datagram { queue, .. } => queue.is_empty(),
        }
    }
}

struct LocalState {
    bound_path: Option<String>,
    passive: bool,
    backlog: usize,
    pending: VecDeque<Arc<Socket>>,
    connected: bool,
    peer: Weak<Socket>,
    peer_closed: bool,
    inbound: Inbound,
}

pub struct LocalSocket {
    state: Spinlock<LocalState>,
}

impl LocalSocket {
    fn new(stream: bool) -> LocalSocket {
        LocalSocket {
            state: Spinlock::new(LocalState {
                bound_path: None,
                passive: false,
                backlog: CONNECTION_BACKLOG,
                pending: VecDeque::new(),
                connected: false,
                peer: Weak::new(),
                peer_closed: false,
                inbound: if stream {
                    Inbound::Stream(VecDeque::new())
                } else {
                    Inbound::Datagram {
                        queue: VecDeque::new(),
                        bytes: 0,
                    }
                },
            }),
        }
    }
}

pub enum SocketKind {
    Local(LocalSocket),
    Udp(UdpSocket),
}

pub struct Socket {
    domain: i32,
    sock_type: i32,
    kind: SocketKind,
    /// Open file descriptors referring to this socket.
    handle_count: AtomicUsize,
    watchers: WatchList,
    weak_self: Weak<Socket>,
}

/// AF_UNIX path bindings.
static BINDINGS: Spinlock<BTreeMap<String, Weak<Socket>>> = Spinlock::new(BTreeMap::new());

fn lookup_binding(path: &str) -> Option<Arc<Socket>> {
    let mut bindings = BINDINGS.lock();
    match bindings.get(path).and_then(Weak::upgrade) {
        Some(socket) => Some(socket),
        None => {
            bindings.remove(path);
            None
        }
    }
}

impl Socket {
    /// Create a socket for `socket(domain, type, protocol)`. The type may
    /// carry extra bits (`SOCK_NONBLOCK`); only the base type matters here.
    pub fn create(domain: i32, sock_type: i32, _protocol: i32) -> Result<Arc<Socket>, SocketError> {
        let base = sock_type & SOCK_TYPE_MASK;
        let kind = match domain {
            AF_UNIX => match base {
                SOCK_STREAM | SOCK_SEQPACKET => SocketKind::Local(LocalSocket::new(true)),
                SOCK_DGRAM => SocketKind::Local(LocalSocket::new(false)),
                _ => return Err(SocketError::ProtocolUnsupported),
            },
            AF_INET => match base {
                SOCK_DGRAM => SocketKind::Udp(UdpSocket::new()),
                // TCP packet processing lives below the socket layer, in
                // the external transport.
                _ => return Err(SocketError::ProtocolUnsupported),
            },
            _ => Err(SocketError::AddressFamily)?,
        };
        Ok(Arc::new_cyclic(|weak_self| Socket {
            domain,
            sock_type: base,
            kind,
            handle_count: AtomicUsize::new(0),
            watchers: WatchList::new(),
            weak_self: weak_self.clone(),
        }))
    }

    fn new_local_child(sock_type: i32, client: &Arc<Socket>) -> Arc<Socket> {
        let local = LocalSocket::new(sock_type != SOCK_DGRAM);
        {
            let mut state = local.state.lock();
            state.connected = true;
            state.peer = Arc::downgrade(client);
        }
        Arc::new_cyclic(|weak_self| Socket {
            domain: AF_UNIX,
            sock_type,
            kind: SocketKind::Local(local),
            handle_count: AtomicUsize::new(0),
            watchers: WatchList::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// A strong reference to this socket, for callers that only hold the
    /// node reference.
    pub fn arc(&self) -> Arc<Socket> {
        self.weak_self.upgrade().expect("socket is alive")
    }

    pub fn domain(&self) -> i32 {
        self.domain
    }

    pub fn sock_type(&self) -> i32 {
        self.sock_type
    }

    pub fn kind(&self) -> &SocketKind {
        &self.kind
    }

    pub(crate) fn watch_list(&self) -> &WatchList {
        &self.watchers
    }

    fn local(&self) -> Option<&LocalSocket> {
        match &self.kind {
            SocketKind::Local(local) => Some(local),
            _ => None,
        }
    }

    pub fn bind(self: &Arc<Self>, addr: &[u8]) -> Result<(), SocketError> {
        match &self.kind {
            SocketKind::Local(local) => {
                let path = parse_unix_addr(addr)?;
                let mut state = local.state.lock();
                if state.bound_path.is_some() {
                    return Err(SocketError::InvalidArgument);
                }
                let mut bindings = BINDINGS.lock();
                if bindings.get(&path).and_then(Weak::upgrade).is_some() {
                    return Err(SocketError::AddressInUse);
                }
                bindings.insert(path.clone(), Arc::downgrade(self));
                state.bound_path = Some(path);
                Ok(())
            }
            SocketKind::Udp(udp) => udp.bind(self, addr),
        }
    }

    pub fn listen(&self, backlog: i32) -> Result<(), SocketError> {
        match &self.kind {
            SocketKind::Local(local) => {
                let mut state = local.state.lock();
                if state.bound_path.is_none() {
                    return Err(SocketError::InvalidArgument);
                }
                state.passive = true;
                if backlog > 0 {
                    state.backlog = (backlog as usize).min(CONNECTION_BACKLOG);
                }
                Ok(())
            }
            SocketKind::Udp(_) => Err(SocketError::OperationUnsupported),
        }
    }

    /// Pop one pending connection, already connected to its client.
    pub fn accept(&self) -> Result<Option<Arc<Socket>>, SocketError> {
        match &self.kind {
            SocketKind::Local(local) => {
                let mut state = local.state.lock();
                if !state.passive {
                    return Err(SocketError::InvalidArgument);
                }
                Ok(state.pending.pop_front())
            }
            SocketKind::Udp(_) => Err(SocketError::OperationUnsupported),
        }
    }

    pub fn connect(self: &Arc<Self>, addr: &[u8]) -> Result<(), SocketError> {
        match &self.kind {
            SocketKind::Local(local) => {
                let path = parse_unix_addr(addr)?;
                let server = lookup_binding(&path).ok_or(SocketError::ConnectionRefused)?;

                {
                    let state = local.state.lock();
                    if state.connected {
                        return Err(SocketError::InvalidArgument);
                    }
                }

                let child = Socket::new_local_child(self.sock_type, self);
                {
                    let server_local =
                        server.local().ok_or(SocketError::ConnectionRefused)?;
                    let mut server_state = server_local.state.lock();
                    if !server_state.passive {
                        return Err(SocketError::ConnectionRefused);
                    }
                    if server_state.pending.len() >= server_state.backlog {
                        return Err(SocketError::ConnectionRefused);
                    }
                    server_state.pending.push_back(child.clone());
                }

                {
                    let mut state = local.state.lock();
                    state.connected = true;
                    state.peer = Arc::downgrade(&child);
                }
                server.watchers.signal(POLLIN as u32);
                Ok(())
            }
            // Datagram association is not supported; sendto names the
            // destination explicitly.
            SocketKind::Udp(_) => Err(SocketError::OperationUnsupported),
        }
    }

    /// Send on a connected socket. Returns the bytes accepted, which may be
    /// fewer than offered for streams.
    pub fn send(self: &Arc<Self>, data: &[u8], _flags: i32) -> Result<usize, SocketError> {
        match &self.kind {
            SocketKind::Local(_) => self.local_send(data),
            SocketKind::Udp(udp) => udp.sendto(self, data, None),
        }
    }

    pub fn sendto(
        self: &Arc<Self>,
        data: &[u8],
        _flags: i32,
        addr: Option<&[u8]>,
    ) -> Result<usize, SocketError> {
        match &self.kind {
            SocketKind::Local(_) => self.local_send(data),
            SocketKind::Udp(udp) => {
                let dest = match addr {
                    Some(bytes) => Some(parse_inet_addr(bytes)?),
                    None => None,
                };
                udp.sendto(self, data, dest)
            }
        }
    }

    fn local_send(self: &Arc<Self>, data: &[u8]) -> Result<usize, SocketError> {
        let local = self.local().expect("local_send on a local socket");
        let (connected, peer_closed, peer) = {
            let state = local.state.lock();
            (state.connected, state.peer_closed, state.peer.clone())
        };
        if !connected {
            return Err(SocketError::NotConnected);
        }
        let peer = match peer.upgrade() {
            Some(peer) if !peer_closed => peer,
            _ => return Err(SocketError::BrokenPipe),
        };

        let peer_local = peer.local().expect("local peers pair with local sockets");
        let accepted = {
            let mut peer_state = peer_local.state.lock();
            match &mut peer_state.inbound {
                Inbound::Stream(buf) => {
                    let space = STREAM_MAX_BUFSIZE - buf.len();
                    if space == 0 {
                        return Err(SocketError::WouldBlock);
                    }
                    let n = space.min(data.len());
                    buf.extend(&data[..n]);
                    n
                }
                Inbound::Datagram { queue, bytes } => {
                    if *bytes + data.len() > STREAM_MAX_BUFSIZE {
                        return Err(SocketError::WouldBlock);
                    }
                    queue.push_back(data.to_vec());
                    *bytes += data.len();
                    data.len()
                }
            }
        };
        peer.watchers.signal(POLLIN as u32);
        Ok(accepted)
    }

    /// Receive. Streams return any available bytes; datagrams return one
    /// message truncated to the buffer. An empty queue with the peer gone
    /// is end-of-stream.
    pub fn recv(&self, buf: &mut [u8], flags: i32) -> Result<usize, SocketError> {
        self.recvfrom(buf, flags).map(|(n, _)| n)
    }

    pub fn recvfrom(
        &self,
        buf: &mut [u8],
        _flags: i32,
    ) -> Result<(usize, Option<(Ipv4Address, u16)>), SocketError> {
        match &self.kind {
            SocketKind::Local(local) => {
                let (n, peer) = {
                    let mut state = local.state.lock();
                    let eof = state.peer_closed
                        || (state.connected && state.peer.upgrade().is_none());
                    if !state.connected && !eof {
                        return Err(SocketError::NotConnected);
                    }
                    match &mut state.inbound {
                        Inbound::Stream(queue) => {
                            if queue.is_empty() {
                                if eof {
                                    return Ok((0, None));
                                }
                                return Err(SocketError::WouldBlock);
                            }
                            let n = queue.len().min(buf.len());
                            for byte in buf.iter_mut().take(n) {
                                *byte = queue.pop_front().expect("length checked");
                            }
                            (n, state.peer.clone())
                        }
                        Inbound::Datagram { queue, bytes } => match queue.pop_front() {
                            Some(message) => {
                                *bytes -= message.len();
                                let n = message.len().min(buf.len());
                                buf[..n].copy_from_slice(&message[..n]);
                                (n, state.peer.clone())
                            }
                            None => {
                                if eof {
                                    return Ok((0, None));
                                }
                                return Err(SocketError::WouldBlock);
                            }
                        },
                    }
                };
                // Space opened up; wake the peer's blocked writers.
                if let Some(peer) = peer.upgrade() {
                    peer.watchers.signal(POLLOUT as u32);
                }
                Ok((n, None))
            }
            SocketKind::Udp(udp) => udp.recvfrom(buf),
        }
    }

    pub fn can_read(&self) -> bool {
        match &self.kind {
            SocketKind::Local(local) => {
                let state = local.state.lock();
                !state.inbound.is_empty()
                    || state.peer_closed
                    || (state.connected && state.peer.upgrade().is_none())
            }
            SocketKind::Udp(udp) => udp.can_read(),
        }
    }

    pub fn can_write(&self) -> bool {
        match &self.kind {
            SocketKind::Local(local) => {
                let (connected, peer_closed, peer) = {
                    let state = local.state.lock();
                    (state.connected, state.peer_closed, state.peer.clone())
                };
                if !connected || peer_closed {
                    return false;
                }
                let Some(peer) = peer.upgrade() else {
                    return false;
                };
                let peer_local = peer.local().expect("local peers pair with local sockets");
                let peer_state = peer_local.state.lock();
                match &peer_state.inbound {
                    Inbound::Stream(buf) => buf.len() < STREAM_MAX_BUFSIZE,
                    Inbound::Datagram { bytes, .. } => *bytes < STREAM_MAX_BUFSIZE,
                }
            }
            SocketKind::Udp(_) => true,
        }
    }

    pub fn is_listening(&self) -> bool {
        match &self.kind {
            SocketKind::Local(local) => local.state.lock().passive,
            SocketKind::Udp(_) => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        match &self.kind {
            SocketKind::Local(local) => {
                let state = local.state.lock();
                state.connected && !state.peer_closed
            }
            SocketKind::Udp(udp) => udp.is_bound(),
        }
    }

    pub fn pending_connections(&self) -> usize {
        match &self.kind {
            SocketKind::Local(local) => local.state.lock().pending.len(),
            SocketKind::Udp(_) => 0,
        }
    }

    /// Last descriptor closed: disconnect the peer and release names.
    fn teardown(&self) {
        match &self.kind {
            SocketKind::Local(local) => {
                let (path, peer, pending) = {
                    let mut state = local.state.lock();
                    (
                        state.bound_path.take(),
                        state.peer.clone(),
                        core::mem::take(&mut state.pending),
                    )
                };
                if let Some(path) = path {
                    BINDINGS.lock().remove(&path);
                }
                drop(pending);
                if let Some(peer) = peer.upgrade() {
                    if let Some(peer_local) = peer.local() {
                        peer_local.state.lock().peer_closed = true;
                    }
                    peer.watchers.signal((POLLIN | POLLHUP) as u32);
                }
            }
            SocketKind::Udp(udp) => udp.release(),
        }
    }
}

impl FsNode for Socket {
    fn node_type(&self) -> NodeType {
        NodeType::Socket
    }

    fn read(&self, _offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        match self.recvfrom(buf, 0) {
            Ok((n, _)) => Ok(n),
            Err(SocketError::WouldBlock) => Err(FsError::WouldBlock),
            Err(SocketError::BrokenPipe) => Err(FsError::BrokenPipe),
            Err(_) => Err(FsError::Io),
        }
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        match self.arc().send(buf, 0) {
            Ok(n) => Ok(n),
            Err(SocketError::WouldBlock) => Err(FsError::WouldBlock),
            Err(SocketError::BrokenPipe) => Err(FsError::BrokenPipe),
            Err(_) => Err(FsError::Io),
        }
    }

    fn can_read(&self) -> bool {
        Socket::can_read(self)
    }

    fn can_write(&self) -> bool {
        Socket::can_write(self)
    }

    fn watch(&self, watcher: &Watcher, events: u32) {
        self.watchers.add(watcher.blocker(), events);
    }

    fn unwatch(&self, watcher: &Watcher) {
        self.watchers.remove(watcher.blocker());
    }

    fn on_open(&self) {
        self.handle_count.fetch_add(1, Ordering::AcqRel);
    }

    fn on_close(&self) {
        if self.handle_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.teardown();
        }
    }

    fn as_socket(&self) -> Option<&Socket> {
        Some(self)
    }

    fn poll_events(&self, requested: i16) -> i16 {
        let mut revents = 0;
        if !self.is_connected() && !self.is_listening() {
            if let SocketKind::Local(local) = &self.kind {
                let state = local.state.lock();
                if state.connected || state.peer_closed {
                    revents |= POLLHUP;
                }
            }
        }
        if requested & POLLIN != 0 && self.pending_connections() > 0 {
            revents |= POLLIN;
        }
        if requested & POLLIN != 0 && self.can_read() {
            revents |= POLLIN;
        }
        if requested & POLLOUT != 0 && self.can_write() {
            revents |= POLLOUT;
        }
        revents
    }
}

fn parse_unix_addr(addr: &[u8]) -> Result<String, SocketError> {
    let (addr, _) =
        SockAddrUn::read_from_prefix(addr).map_err(|_| SocketError::InvalidArgument)?;
    if i32::from(addr.sun_family) != AF_UNIX {
        return Err(SocketError::AddressFamily);
    }
    let path = addr.path_bytes();
    if path.is_empty() {
        return Err(SocketError::InvalidArgument);
    }
    core::str::from_utf8(path)
        .map(String::from)
        .map_err(|_| SocketError::InvalidArgument)
}

pub(crate) fn parse_inet_addr(addr: &[u8]) -> Result<SockAddrIn, SocketError> {
    let (addr, _) =
        SockAddrIn::read_from_prefix(addr).map_err(|_| SocketError::InvalidArgument)?;
    if i32::from(addr.sin_family) != AF_INET {
        return Err(SocketError::InvalidArgument);
    }
    Ok(addr)
}

#[cfg(any(test, feature = "testing"))]
pub(crate) fn reset() {
    BINDINGS.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn stream_pair() -> (Arc<Socket>, Arc<Socket>) {
        let server = Socket::create(AF_UNIX, SOCK_STREAM, 0).unwrap();
        let mut un = SockAddrUn {
            sun_family: AF_UNIX as u16,
            sun_path: [0; 108],
        };
        un.sun_path[..4].copy_from_slice(b"/srv");
        server.bind(zerocopy::IntoBytes::as_bytes(&un)).unwrap();
        server.listen(8).unwrap();

        let client = Socket::create(AF_UNIX, SOCK_STREAM, 0).unwrap();
        client.connect(zerocopy::IntoBytes::as_bytes(&un)).unwrap();
        let child = server.accept().unwrap().expect("pending connection");
        (client, child)
    }

    #[test]
    fn stream_data_flows_both_ways() {
        let _guard = testing::fixture();
        let (client, child) = stream_pair();

        client.send(b"ping", 0).unwrap();
        let mut buf = [0u8; 16];
        let n = child.recv(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"ping");

        child.send(b"pong", 0).unwrap();
        let n = client.recv(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn bound_paths_are_exclusive() {
        let _guard = testing::fixture();
        let first = Socket::create(AF_UNIX, SOCK_STREAM, 0).unwrap();
        let second = Socket::create(AF_UNIX, SOCK_STREAM, 0).unwrap();
        let mut un = SockAddrUn {
            sun_family: AF_UNIX as u16,
            sun_path: [0; 108],
        };
        un.sun_path[..2].copy_from_slice(b"/a");
        first.bind(zerocopy::IntoBytes::as_bytes(&un)).unwrap();
        assert_eq!(
            second.bind(zerocopy::IntoBytes::as_bytes(&un)),
            Err(SocketError::AddressInUse)
        );
    }

    #[test]
    fn close_disconnects_the_peer() {
        let _guard = testing::fixture();
        let (client, child) = stream_pair();

        client.send(b"bye", 0).unwrap();
        // Close the only descriptor on the client side.
        client.on_open();
        client.on_close();

        let mut buf = [0u8; 8];
        // Queued data drains first, then end-of-stream.
        assert_eq!(child.recv(&mut buf, 0).unwrap(), 3);
        assert_eq!(child.recv(&mut buf, 0).unwrap(), 0);
        assert_eq!(child.send(b"x", 0), Err(SocketError::BrokenPipe));
    }

    #[test]
    fn stream_backpressure_reports_would_block() {
        let _guard = testing::fixture();
        let (client, child) = stream_pair();

        let chunk = alloc::vec![0u8; STREAM_MAX_BUFSIZE];
        assert_eq!(client.send(&chunk, 0).unwrap(), STREAM_MAX_BUFSIZE);
        assert_eq!(client.send(b"x", 0), Err(SocketError::WouldBlock));
        assert!(!client.can_write());

        let mut buf = alloc::vec![0u8; 1024];
        child.recv(&mut buf, 0).unwrap();
        assert!(client.can_write());
    }
}
