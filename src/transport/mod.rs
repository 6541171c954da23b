//! Channel substrate for the broker protocol.
//!
//! Delivers framed messages over local sockets (Unix domain sockets or
//! Windows named pipes) and provides the blocking invoke-with-timeout
//! primitive the announce handshake is built on. The broker core above
//! only depends on `Channel`, `InboundHandler`, and `NodeId`.

mod channel;
mod connections;
mod frame;

pub use channel::{Channel, ChannelError, ChannelState, InboundHandler};
pub use connections::{ConnectionConfig, ConnectionPool, OwnedConnectionGuard};
pub use frame::{read_frame, write_frame, FrameError};

use interprocess::local_socket::{
    GenericFilePath, GenericNamespaced, Name, NameType as _, ToFsName, ToNsName,
};

/// Opaque endpoint address identifying a channel's peer.
///
/// Immutable once a channel is created. On platforms with a named-pipe /
/// abstract-socket namespace the string is used as a namespaced name,
/// otherwise as a filesystem socket path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve to a local-socket name for listen/connect.
    pub fn to_local_name(&self) -> std::io::Result<Name<'static>> {
        if GenericNamespaced::is_supported() {
            self.0.clone().to_ns_name::<GenericNamespaced>()
        } else {
            self.0.clone().to_fs_name::<GenericFilePath>()
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
