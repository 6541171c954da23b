//! CommunicatorClient: the connecting side of the announce protocol.
//!
//! Opening is synchronous from the caller's perspective: the transport
//! connects, the announce request goes out, and the caller blocks on the
//! pending invoke until the dispatch path completes the exchange, the
//! timeout elapses, or the channel becomes invalid. Whatever happens, the
//! waiter is woken exactly once.
//!
//! Three opening modes exist, all requiring the client to be closed:
//! a wildcard probe, a typed interface request, and the offer form that
//! exposes a caller-supplied object to the broker for callbacks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::loader::ProxyStubLoader;
use crate::protocol::{
    AnnounceKind, AnnounceRequest, AnnounceResponse, RawToken, RequestBody, ResponseBody,
};
use crate::registry::{LocalObject, ProxyObject, ProxyRegistry};
use crate::telemetry::set_default_categories_json;
use crate::transport::{Channel, ChannelError, InboundHandler, NodeId};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Client is already open")]
    AlreadyOpen,

    #[error("Open timed out")]
    Timeout,

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Remote side has no implementation to offer")]
    NoImplementation,

    #[error("No proxy factory registered for interface {interface_id:#x}")]
    NoFactory { interface_id: u32 },

    #[error("Unexpected response to announce")]
    UnexpectedResponse,
}

/// Announce exchange state, per open attempt.
///
/// Terminal states are not re-entered for a given attempt; closing and
/// reopening the client starts again from `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceState {
    Idle,
    AwaitingResponse,
    Success,
    Failure,
    TimedOut,
}

#[derive(Default)]
struct OfferedObjects {
    map: Mutex<HashMap<u32, RawToken>>,
}

/// Inbound dispatch for the connector: answers broker-initiated announce
/// requests from the offered-object set and routes invokes to the
/// registry's exposed objects.
struct ClientInbound {
    registry: Arc<ProxyRegistry>,
    offered: Arc<OfferedObjects>,
}

#[async_trait]
impl InboundHandler for ClientInbound {
    async fn handle(&self, _channel: &Arc<Channel>, request: RequestBody) -> ResponseBody {
        match request {
            RequestBody::Announce(AnnounceRequest { kind, .. }) => {
                let response = match kind {
                    AnnounceKind::Interface { interface_id, .. } => {
                        match self.offered.map.lock().get(&interface_id) {
                            Some(token) => AnnounceResponse::with_implementation(*token),
                            None => AnnounceResponse::empty(),
                        }
                    }
                    _ => AnnounceResponse::empty(),
                };
                ResponseBody::Announce(response)
            }
            RequestBody::Invoke(invoke) => ResponseBody::Invoke(self.registry.dispatch(&invoke)),
        }
    }
}

/// Connector to one broker endpoint.
pub struct CommunicatorClient {
    node: NodeId,
    registry: Arc<ProxyRegistry>,
    loader: ProxyStubLoader,
    config: BrokerConfig,
    channel: Mutex<Option<Arc<Channel>>>,
    state: Mutex<AnnounceState>,
    offered: Arc<OfferedObjects>,
}

impl CommunicatorClient {
    pub fn new(node: NodeId, registry: Arc<ProxyRegistry>, config: BrokerConfig) -> Self {
        Self {
            node,
            loader: ProxyStubLoader::new(Arc::clone(&registry)),
            registry,
            config,
            channel: Mutex::new(None),
            state: Mutex::new(AnnounceState::Idle),
            offered: Arc::new(OfferedObjects::default()),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn is_open(&self) -> bool {
        self.channel.lock().as_ref().is_some_and(|c| c.is_open())
    }

    pub fn announce_state(&self) -> AnnounceState {
        *self.state.lock()
    }

    /// Loader for marshaling modules announced by the broker.
    pub fn loader(&self) -> &ProxyStubLoader {
        &self.loader
    }

    /// Wildcard open: establish presence without requesting an object.
    pub async fn open(&self, wait_time: Duration) -> Result<(), ClientError> {
        self.open_with(wait_time, AnnounceKind::Probe).await?;
        Ok(())
    }

    /// Request a named/typed object from the broker and wrap the returned
    /// token as a local proxy.
    pub async fn open_interface(
        &self,
        wait_time: Duration,
        class_name: Option<&str>,
        interface_id: u32,
        version: u32,
    ) -> Result<Arc<dyn ProxyObject>, ClientError> {
        let response = self
            .open_with(
                wait_time,
                AnnounceKind::Interface {
                    class_name: class_name.map(str::to_string),
                    interface_id,
                    version,
                },
            )
            .await?;

        let token = response.implementation.ok_or(ClientError::NoImplementation)?;
        let channel = self
            .channel
            .lock()
            .clone()
            .ok_or(ChannelError::NotConnected)?;
        self.registry
            .create_proxy(interface_id, channel, token, false, true)
            .ok_or(ClientError::NoFactory { interface_id })
    }

    /// Offer form: expose `object` to the broker under `interface_id` so
    /// the broker can call back into it. Returns the token it was
    /// registered under.
    pub async fn open_offer(
        &self,
        wait_time: Duration,
        interface_id: u32,
        object: Arc<dyn LocalObject>,
    ) -> Result<RawToken, ClientError> {
        let token = self.registry.expose(object);
        self.offered.map.lock().insert(interface_id, token);

        match self
            .open_with(
                wait_time,
                AnnounceKind::Offer {
                    interface_id,
                    token,
                },
            )
            .await
        {
            Ok(_) => {
                info!(interface_id, token = token.get(), "offer announced");
                Ok(token)
            }
            Err(e) => {
                self.offered.map.lock().remove(&interface_id);
                self.registry.revoke(token);
                Err(e)
            }
        }
    }

    /// Close the transport. A pending open is woken with a failure.
    pub async fn close(&self, _wait_time: Duration) -> Result<(), ClientError> {
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        *self.state.lock() = AnnounceState::Idle;
        Ok(())
    }

    /// Drive one announce exchange, bounded end to end by `wait_time`.
    async fn open_with(
        &self,
        wait_time: Duration,
        kind: AnnounceKind,
    ) -> Result<AnnounceResponse, ClientError> {
        {
            let channel = self.channel.lock();
            if channel.as_ref().is_some_and(|c| c.is_open()) {
                debug_assert!(false, "open() on an already-open CommunicatorClient");
                return Err(ClientError::AlreadyOpen);
            }
        }
        *self.state.lock() = AnnounceState::Idle;

        let deadline = tokio::time::Instant::now() + wait_time;

        let handler: Arc<dyn InboundHandler> = Arc::new(ClientInbound {
            registry: Arc::clone(&self.registry),
            offered: Arc::clone(&self.offered),
        });
        let connect = Channel::connect(&self.node, Some(handler), self.config.frame_limit);
        let channel = match tokio::time::timeout_at(deadline, connect).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                *self.state.lock() = AnnounceState::Failure;
                return Err(e.into());
            }
            Err(_) => {
                *self.state.lock() = AnnounceState::TimedOut;
                return Err(ClientError::Timeout);
            }
        };
        *self.channel.lock() = Some(Arc::clone(&channel));
        *self.state.lock() = AnnounceState::AwaitingResponse;

        let request = RequestBody::Announce(AnnounceRequest::new(kind));
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());

        match channel.invoke(request, remaining).await {
            Ok(ResponseBody::Announce(response)) => {
                self.apply_response(&response);
                *self.state.lock() = AnnounceState::Success;
                Ok(response)
            }
            Ok(other) => {
                debug!(?other, "announce answered with a non-announce body");
                *self.state.lock() = AnnounceState::Failure;
                Err(ClientError::UnexpectedResponse)
            }
            Err(ChannelError::Timeout) => {
                *self.state.lock() = AnnounceState::TimedOut;
                Err(ClientError::Timeout)
            }
            Err(e) => {
                *self.state.lock() = AnnounceState::Failure;
                Err(e.into())
            }
        }
    }

    /// Side effects of a successful announce, applied before the opener
    /// is released: adopt diagnostic defaults, then load any indicated
    /// marshaling modules.
    fn apply_response(&self, response: &AnnounceResponse) {
        if let Some(json) = &response.trace_categories {
            if let Err(e) = set_default_categories_json(json) {
                warn!(error = %e, "announced trace categories rejected");
            }
        }
        if let Some(path) = &response.proxy_stub_path {
            self.loader.load_all(Path::new(path));
        }
    }
}

impl Drop for CommunicatorClient {
    fn drop(&mut self) {
        // Withdraw anything this client offered.
        for (_, token) in self.offered.map.lock().drain() {
            self.registry.revoke(token);
        }
    }
}
