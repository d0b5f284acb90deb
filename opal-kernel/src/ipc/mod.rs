//! Local IPC: named services exposing interfaces, which accept into paired
//! message endpoints.

mod endpoint;
mod service;

pub use endpoint::{
    Message, MessageEndpoint, EP_EVENT_DISCONNECT, EP_EVENT_MESSAGE, EP_EVENT_SPACE,
};
pub use service::{
    connect, create_service, resolve_service, MessageInterface, Service, IF_EVENT_CONNECTION,
};

#[cfg(any(test, feature = "testing"))]
pub(crate) use endpoint::reset as reset_endpoints;
#[cfg(any(test, feature = "testing"))]
pub(crate) use service::reset as reset_services;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// A service with this name already exists.
    Exists,
    /// No such service or interface.
    NotFound,
    InvalidArgument,
    /// Message exceeds the interface's configured maximum.
    MessageTooLarge,
    /// The peer endpoint has been destroyed.
    NotConnected,
    /// The queue is full.
    WouldBlock,
}

impl IpcError {
    pub fn errno(self) -> isize {
        use opal_abi::errno;
        match self {
            IpcError::Exists => errno::EEXIST,
            IpcError::NotFound => errno::ENOENT,
            IpcError::InvalidArgument => errno::EINVAL,
            IpcError::MessageTooLarge => errno::EMSGSIZE,
            IpcError::NotConnected => errno::ENOTCONN,
            IpcError::WouldBlock => errno::EAGAIN,
        }
    }
}
