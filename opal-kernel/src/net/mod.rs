//! Sockets and the packet transport facility.
//!
//! IP/UDP framing below the socket layer — adapters, ARP, routing tables —
//! belongs to the external packet transport. The core composes UDP
//! datagrams, owns port allocation, and queues received packets on sockets.

pub mod socket;
pub mod udp;

pub use socket::{Socket, SocketKind};

use spinning_top::RwSpinlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Address(pub [u8; 4]);

impl Ipv4Address {
    pub const ANY: Ipv4Address = Ipv4Address([0, 0, 0, 0]);
    pub const BROADCAST: Ipv4Address = Ipv4Address([255, 255, 255, 255]);
    pub const LOOPBACK: Ipv4Address = Ipv4Address([127, 0, 0, 1]);

    /// From the host-order value of a network-order `sin_addr`.
    pub fn from_u32(value: u32) -> Ipv4Address {
        Ipv4Address(value.to_be_bytes())
    }

    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    WouldBlock,
    NotConnected,
    BrokenPipe,
    AddressInUse,
    AddressFamily,
    InvalidArgument,
    ConnectionRefused,
    MessageTooLarge,
    ProtocolUnsupported,
    OperationUnsupported,
    NoRoute,
    HostUnreachable,
    NoMemory,
}

impl SocketError {
    pub fn errno(self) -> isize {
        use opal_abi::errno;
        match self {
            SocketError::WouldBlock => errno::EAGAIN,
            SocketError::NotConnected => errno::ENOTCONN,
            SocketError::BrokenPipe => errno::EPIPE,
            SocketError::AddressInUse => errno::EADDRINUSE,
            SocketError::AddressFamily => errno::EAFNOSUPPORT,
            SocketError::InvalidArgument => errno::EINVAL,
            SocketError::ConnectionRefused => errno::ECONNREFUSED,
            SocketError::MessageTooLarge => errno::EMSGSIZE,
            SocketError::ProtocolUnsupported => errno::EPROTONOSUPPORT,
            SocketError::OperationUnsupported => errno::EOPNOTSUPP,
            SocketError::NoRoute => errno::ENETUNREACH,
            SocketError::HostUnreachable => errno::EHOSTUNREACH,
            SocketError::NoMemory => errno::ENOMEM,
        }
    }
}

/// The transport below the socket layer.
pub trait PacketTransport: Send + Sync {
    /// Resolve the L2 destination for an IPv4 destination.
    fn route(&self, source: Ipv4Address, dest: Ipv4Address) -> Result<MacAddress, SocketError>;

    /// Submit a composed UDP packet (header plus payload) to the adapter.
    fn transmit(
        &self,
        dest_mac: MacAddress,
        dest_ip: Ipv4Address,
        packet: &[u8],
    ) -> Result<(), SocketError>;
}

static TRANSPORT: RwSpinlock<Option<&'static dyn PacketTransport>> = RwSpinlock::new(None);

pub fn init(transport: &'static dyn PacketTransport) {
    *TRANSPORT.write() = Some(transport);
}

pub(crate) fn transport() -> Result<&'static dyn PacketTransport, SocketError> {
    (*TRANSPORT.read()).ok_or(SocketError::NoRoute)
}
