//! UDP sockets: port allocation, datagram queues, and wire composition.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use log::warn;
use spinning_top::Spinlock;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use opal_abi::poll::POLLIN;
use opal_abi::socket::SockAddrIn;

use crate::object::WatchList;

use super::socket::Socket;
use super::{transport, Ipv4Address, MacAddress, SocketError};

pub const PORT_MAX: u16 = u16::MAX;
pub const EPHEMERAL_PORT_RANGE_START: u16 = 49152;
pub const EPHEMERAL_PORT_RANGE_END: u16 = PORT_MAX;

/// Largest UDP payload accepted for transmission.
pub const MAX_PAYLOAD: usize = 1518;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct UdpHeader {
    pub src_port: U16,
    pub dest_port: U16,
    pub length: U16,
    pub checksum: U16,
}

pub struct UdpDatagram {
    pub source_ip: Ipv4Address,
    pub source_port: u16,
    pub data: Vec<u8>,
}

struct PortTable {
    sockets: BTreeMap<u16, Weak<Socket>>,
    next_ephemeral: u32,
}

static PORTS: Spinlock<PortTable> = Spinlock::new(PortTable {
    sockets: BTreeMap::new(),
    next_ephemeral: EPHEMERAL_PORT_RANGE_START as u32,
});

fn port_in_use(table: &mut PortTable, port: u16) -> bool {
    match table.sockets.get(&port) {
        Some(weak) if weak.upgrade().is_some() => true,
        Some(_) => {
            table.sockets.remove(&port);
            false
        }
        None => false,
    }
}

fn acquire_port(socket: &Arc<Socket>, port: u16) -> Result<(), SocketError> {
    if port == 0 {
        warn!("acquire_port: invalid port {port}");
        return Err(SocketError::InvalidArgument);
    }
    let mut table = PORTS.lock();
    if port_in_use(&mut table, port) {
        warn!("acquire_port: port {port} in use");
        return Err(SocketError::AddressInUse);
    }
    table.sockets.insert(port, Arc::downgrade(socket));
    Ok(())
}

/// Allocate an ephemeral port: a walking counter until the range is
/// exhausted, then a linear rescan for ports that have been released.
fn allocate_port(socket: &Arc<Socket>) -> Option<u16> {
    let mut table = PORTS.lock();
    while table.next_ephemeral <= EPHEMERAL_PORT_RANGE_END as u32 {
        let candidate = table.next_ephemeral as u16;
        table.next_ephemeral += 1;
        if !port_in_use(&mut table, candidate) {
            table.sockets.insert(candidate, Arc::downgrade(socket));
            return Some(candidate);
        }
    }
    for candidate in EPHEMERAL_PORT_RANGE_START..=EPHEMERAL_PORT_RANGE_END {
        if !port_in_use(&mut table, candidate) {
            table.sockets.insert(candidate, Arc::downgrade(socket));
            return Some(candidate);
        }
    }
    warn!("allocate_port: ephemeral range exhausted");
    None
}

fn release_port(port: u16) {
    PORTS.lock().sockets.remove(&port);
}

fn socket_for_port(port: u16) -> Option<Arc<Socket>> {
    PORTS.lock().sockets.get(&port)?.upgrade()
}

struct UdpState {
    bound: bool,
    address: Ipv4Address,
    port: u16,
    packets: VecDeque<UdpDatagram>,
}

pub struct UdpSocket {
    state: Spinlock<UdpState>,
}

impl UdpSocket {
    pub(crate) fn new() -> UdpSocket {
        UdpSocket {
            state: Spinlock::new(UdpState {
                bound: false,
                address: Ipv4Address::ANY,
                port: 0,
                packets: VecDeque::new(),
            }),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.state.lock().port
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().bound
    }

    pub fn can_read(&self) -> bool {
        !self.state.lock().packets.is_empty()
    }

    pub(crate) fn bind(&self, socket: &Arc<Socket>, addr: &[u8]) -> Result<(), SocketError> {
        let addr = super::socket::parse_inet_addr(addr)?;
        let mut state = self.state.lock();
        if state.bound {
            return Err(SocketError::InvalidArgument);
        }
        let port = addr.sin_port.get();
        let port = if port == 0 {
            allocate_port(socket).ok_or(SocketError::AddressInUse)?
        } else {
            acquire_port(socket, port).map_err(|_| SocketError::AddressInUse)?;
            port
        };
        state.port = port;
        state.address = Ipv4Address::from_u32(addr.sin_addr.get());
        state.bound = true;
        Ok(())
    }

    /// Compose a datagram and hand it to the transport. Allocates an
    /// ephemeral source port on first use.
    pub(crate) fn sendto(
        &self,
        socket: &Arc<Socket>,
        data: &[u8],
        dest: Option<SockAddrIn>,
    ) -> Result<usize, SocketError> {
        if data.len() > MAX_PAYLOAD {
            return Err(SocketError::MessageTooLarge);
        }
        let dest = dest.ok_or(SocketError::NotConnected)?;
        let dest_ip = Ipv4Address::from_u32(dest.sin_addr.get());
        let dest_port = dest.sin_port.get();

        let transport = transport()?;
        let source = self.state.lock().address;
        let dest_mac = if dest_ip.is_broadcast() {
            MacAddress::BROADCAST
        } else {
            transport.route(source, dest_ip)?
        };

        let src_port = {
            let port = self.state.lock().port;
            if port != 0 {
                port
            } else {
                let port = allocate_port(socket).ok_or(SocketError::AddressInUse)?;
                self.state.lock().port = port;
                port
            }
        };

        let header = UdpHeader {
            src_port: U16::new(src_port),
            dest_port: U16::new(dest_port),
            length: U16::new((core::mem::size_of::<UdpHeader>() + data.len()) as u16),
            checksum: U16::new(0),
        };
        let mut packet = Vec::with_capacity(core::mem::size_of::<UdpHeader>() + data.len());
        packet.extend_from_slice(header.as_bytes());
        packet.extend_from_slice(data);

        transport.transmit(dest_mac, dest_ip, &packet)?;
        Ok(data.len())
    }

    /// Dequeue one datagram, truncated to the buffer. The source address
    /// and port are reported alongside.
    pub(crate) fn recvfrom(
        &self,
        buf: &mut [u8],
    ) -> Result<(usize, Option<(Ipv4Address, u16)>), SocketError> {
        let mut state = self.state.lock();
        let Some(packet) = state.packets.pop_front() else {
            return Err(SocketError::WouldBlock);
        };
        let n = packet.data.len().min(buf.len());
        buf[..n].copy_from_slice(&packet.data[..n]);
        Ok((n, Some((packet.source_ip, packet.source_port))))
    }

    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        if state.port != 0 {
            release_port(state.port);
            state.port = 0;
            state.bound = false;
        }
    }
}

/// Deliver a received UDP packet (header plus payload) from the transport.
pub fn on_receive(source_ip: Ipv4Address, packet: &[u8]) {
    let Ok((header, payload)) = UdpHeader::read_from_prefix(packet) else {
        warn!("udp: discarding short packet ({} bytes)", packet.len());
        return;
    };
    let length = header.length.get() as usize;
    if length < core::mem::size_of::<UdpHeader>() || length > packet.len() {
        warn!("udp: discarding packet with bad length {length}");
        return;
    }
    let payload_len = length - core::mem::size_of::<UdpHeader>();

    let Some(socket) = socket_for_port(header.dest_port.get()) else {
        return;
    };
    let Some(udp) = (match socket.kind() {
        super::SocketKind::Udp(udp) => Some(udp),
        _ => None,
    }) else {
        return;
    };

    udp.state.lock().packets.push_back(UdpDatagram {
        source_ip,
        source_port: header.src_port.get(),
        data: payload[..payload_len].to_vec(),
    });
    socket.watch_list().signal(POLLIN as u32);
}

#[cfg(any(test, feature = "testing"))]
pub(crate) fn reset() {
    let mut table = PORTS.lock();
    table.sockets.clear();
    table.next_ephemeral = EPHEMERAL_PORT_RANGE_START as u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use opal_abi::socket::{AF_INET, SOCK_DGRAM};
    use zerocopy::byteorder::network_endian::U32;

    fn inet_addr(port: u16) -> SockAddrIn {
        SockAddrIn {
            sin_family: AF_INET as u16,
            sin_port: U16::new(port),
            sin_addr: U32::new(Ipv4Address::LOOPBACK.to_u32()),
            sin_zero: [0; 8],
        }
    }

    #[test]
    fn bound_ports_are_exclusive() {
        let _guard = testing::fixture();
        let a = Socket::create(AF_INET, SOCK_DGRAM, 0).unwrap();
        let b = Socket::create(AF_INET, SOCK_DGRAM, 0).unwrap();
        a.bind(inet_addr(5000).as_bytes()).unwrap();
        assert_eq!(
            b.bind(inet_addr(5000).as_bytes()),
            Err(SocketError::AddressInUse)
        );
    }

    #[test]
    fn ephemeral_allocation_skips_acquired_ports() {
        let _guard = testing::fixture();
        let a = Socket::create(AF_INET, SOCK_DGRAM, 0).unwrap();
        a.bind(inet_addr(EPHEMERAL_PORT_RANGE_START).as_bytes())
            .unwrap();

        let b = Socket::create(AF_INET, SOCK_DGRAM, 0).unwrap();
        b.bind(inet_addr(0).as_bytes()).unwrap();
        let port = match b.kind() {
            crate::net::SocketKind::Udp(udp) => udp.local_port(),
            _ => unreachable!(),
        };
        assert_eq!(port, EPHEMERAL_PORT_RANGE_START + 1);
    }

    #[test]
    fn released_ports_are_found_by_the_linear_rescan() {
        let _guard = testing::fixture();
        // Exhaust the walking counter.
        PORTS.lock().next_ephemeral = EPHEMERAL_PORT_RANGE_END as u32 + 1;

        let a = Socket::create(AF_INET, SOCK_DGRAM, 0).unwrap();
        a.bind(inet_addr(0).as_bytes()).unwrap();
        let port = match a.kind() {
            crate::net::SocketKind::Udp(udp) => udp.local_port(),
            _ => unreachable!(),
        };
        assert_eq!(port, EPHEMERAL_PORT_RANGE_START);
    }

    #[test]
    fn received_packets_truncate_to_the_caller_buffer() {
        let _guard = testing::fixture();
        let socket = Socket::create(AF_INET, SOCK_DGRAM, 0).unwrap();
        socket.bind(inet_addr(7000).as_bytes()).unwrap();

        let header = UdpHeader {
            src_port: U16::new(9000),
            dest_port: U16::new(7000),
            length: U16::new(8 + 5),
            checksum: U16::new(0),
        };
        let mut packet = Vec::new();
        packet.extend_from_slice(header.as_bytes());
        packet.extend_from_slice(b"hello");
        on_receive(Ipv4Address::LOOPBACK, &packet);

        let mut buf = [0u8; 3];
        let (n, source) = socket.recvfrom(&mut buf, 0).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(source, Some((Ipv4Address::LOOPBACK, 9000)));
    }
}
