//! comrpc: out-of-process object broker.
//!
//! Lets a process export interfaces implemented by separately launched
//! processes and call into them as if local, via proxy objects that
//! marshal invocations over an inter-process channel.
//!
//! # Protocol
//!
//! Right after a channel opens, exactly one Announce exchange negotiates
//! what the connection is for: a bare probe, a request for a typed object,
//! or an offer of a callback object. The response carries the raw
//! implementation token, the default trace-category set to adopt, and the
//! directory of marshaling modules to load. Ordinary interface calls then
//! travel as opaque Invoke envelopes dispatched through the proxy
//! registry.
//!
//! # Roles
//!
//! - [`Communicator`]: the broker; accepts connections, tracks live
//!   remote processes, resolves announce requests.
//! - [`CommunicatorClient`]: the connector; opens a channel, drives the
//!   announce handshake, exposes the resulting proxy.
//! - [`ProxyRegistry`]: maps interface ids plus raw tokens to local
//!   proxies, and dispatches inbound invokes to exposed objects.
//! - [`ProxyStubLoader`]: loads marshaling modules from a directory,
//!   deduplicated for its lifetime.

pub mod broker;
pub mod client;
pub mod config;
pub mod loader;
pub mod protocol;
pub mod registry;
pub mod telemetry;
pub mod transport;

pub use broker::{BrokerError, Communicator, ObjectResolver, ProcessId, RemoteProcess};
pub use client::{AnnounceState, ClientError, CommunicatorClient};
pub use config::BrokerConfig;
pub use loader::{ProxyStubLoader, REGISTER_SYMBOL};
pub use protocol::{
    AnnounceKind, AnnounceRequest, AnnounceResponse, InvokeRequest, InvokeResponse, Message,
    ProtocolError, RawToken, RequestBody, ResponseBody,
};
pub use registry::{
    DispatchError, LocalObject, ProxyError, ProxyFactory, ProxyLink, ProxyObject, ProxyRegistry,
    RemoteObject, RemoteObjectFactory,
};
pub use transport::{Channel, ChannelError, ChannelState, InboundHandler, NodeId};
