//! Communicator: the broker/server side of the announce protocol.
//!
//! Accepts connections, runs the live-process map, and resolves each
//! announce request to a concrete object through the embedder-supplied
//! [`ObjectResolver`]. A [`RemoteProcess`] handle represents one connected
//! peer and can itself be asked to supply an implementation (`acquire`)
//! or be torn down (`terminate`).
//!
//! Teardown ordering is a caller contract: every remote process must have
//! been terminated or have disconnected before [`Communicator::close`];
//! the listener is then stopped with an unbounded wait.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use interprocess::local_socket::{tokio::prelude::*, ListenerOptions};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::loader::ProxyStubLoader;
use crate::protocol::{
    AnnounceKind, AnnounceRequest, AnnounceResponse, RawToken, RequestBody, ResponseBody,
};
use crate::registry::{LocalObject, ProxyObject, ProxyRegistry};
use crate::transport::{Channel, ChannelState, ConnectionPool, InboundHandler, NodeId};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to bind listener on {node}: {source}")]
    Bind {
        node: String,
        source: std::io::Error,
    },

    #[error("Process map not empty: {0} live remote processes")]
    ProcessesAlive(usize),

    #[error("Remote process handle is detached from its communicator")]
    Detached,
}

/// Identifier of one connected peer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

/// Resolves announce requests to concrete local objects.
///
/// Supplied at broker construction; `None` means the broker has nothing
/// to offer for the request, which is answered with a null token.
#[async_trait]
pub trait ObjectResolver: Send + Sync {
    async fn resolve(
        &self,
        class_name: Option<&str>,
        interface_id: u32,
        version: u32,
    ) -> Option<Arc<dyn LocalObject>>;
}

/// One connected peer process.
///
/// Created when the peer's first announce is processed; removed when the
/// peer disconnects or is explicitly terminated. Never outlives its
/// Communicator: the back-reference is weak, and operations on a
/// detached handle fail the ownership precondition.
pub struct RemoteProcess {
    id: ProcessId,
    channel: Arc<Channel>,
    parent: Weak<BrokerInner>,
    /// Tokens this broker exposed while answering this peer's announces.
    served: Mutex<Vec<RawToken>>,
    /// Interfaces the peer offered at announce time.
    offered: Mutex<HashMap<u32, RawToken>>,
}

impl RemoteProcess {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Whether the peer's channel is currently connected.
    pub fn is_valid(&self) -> bool {
        self.channel.is_open()
    }

    /// Token the peer offered for `interface_id`, if any.
    pub fn offered_token(&self, interface_id: u32) -> Option<RawToken> {
        self.offered.lock().get(&interface_id).copied()
    }

    /// Ask this peer to supply an implementation of `interface_id`.
    ///
    /// The peer acts as a server for this one call: an announce request
    /// goes out over its channel, and a returned token is wrapped as a
    /// local proxy through the registry. Returns `None` when the channel
    /// is invalid, the invoke fails, the peer has nothing to offer, or no
    /// factory is registered for the interface.
    pub async fn acquire(
        &self,
        timeout: Duration,
        class_name: Option<&str>,
        interface_id: u32,
        version: u32,
    ) -> Option<Arc<dyn ProxyObject>> {
        let parent = self.parent.upgrade()?;

        if !self.channel.is_open() {
            debug!(process = self.id.0, "acquire on a closed channel");
            return None;
        }

        let request = AnnounceRequest::new(AnnounceKind::Interface {
            class_name: class_name.map(str::to_string),
            interface_id,
            version,
        });

        match self
            .channel
            .invoke(RequestBody::Announce(request), timeout)
            .await
        {
            Ok(ResponseBody::Announce(response)) => response.implementation.and_then(|token| {
                parent.registry.create_proxy(
                    interface_id,
                    Arc::clone(&self.channel),
                    token,
                    false,
                    true,
                )
            }),
            Ok(other) => {
                warn!(process = self.id.0, ?other, "unexpected announce reply");
                None
            }
            Err(e) => {
                debug!(process = self.id.0, error = %e, "acquire failed");
                None
            }
        }
    }

    /// Tear this process down through its owning Communicator.
    ///
    /// Calling this on a handle whose Communicator is gone is a caller
    /// bug; it is flagged in debug builds and fails with
    /// [`BrokerError::Detached`].
    pub async fn terminate(&self) -> Result<(), BrokerError> {
        let parent = self.parent.upgrade();
        debug_assert!(
            parent.is_some(),
            "terminate() on a detached RemoteProcess handle"
        );
        match parent {
            Some(parent) => {
                parent.destroy(self.id).await;
                Ok(())
            }
            None => Err(BrokerError::Detached),
        }
    }
}

struct BrokerInner {
    node: NodeId,
    registry: Arc<ProxyRegistry>,
    resolver: Arc<dyn ObjectResolver>,
    processes: DashMap<ProcessId, Arc<RemoteProcess>>,
    connections: Arc<ConnectionPool>,
    // Keeps marshaling-module handles alive; modules are never unloaded.
    #[allow(dead_code)]
    loader: ProxyStubLoader,
    config: BrokerConfig,
}

impl BrokerInner {
    /// Remove a process, revoke what was exposed for it, close its channel.
    /// Idempotent: a process already reaped is a no-op.
    async fn destroy(&self, id: ProcessId) {
        if let Some((_, process)) = self.processes.remove(&id) {
            for token in process.served.lock().drain(..) {
                self.registry.revoke(token);
            }
            process.channel.close().await;
            info!(process = id.0, "remote process destroyed");
        }
    }

    /// Flush entries whose channel has already closed.
    fn reap_closed(&self) {
        let dead: Vec<ProcessId> = self
            .processes
            .iter()
            .filter(|entry| !entry.value().channel.is_open())
            .map(|entry| *entry.key())
            .collect();
        for id in dead {
            if let Some((_, process)) = self.processes.remove(&id) {
                for token in process.served.lock().drain(..) {
                    self.registry.revoke(token);
                }
                debug!(process = id.0, "reaped disconnected process");
            }
        }
    }

    /// Attach the configured diagnostic and module-path payloads.
    fn announce_extras(&self, mut response: AnnounceResponse) -> AnnounceResponse {
        response.trace_categories = self.config.trace_categories.clone();
        response.proxy_stub_path = self
            .config
            .proxy_stub_path
            .as_ref()
            .map(|p| p.display().to_string());
        response
    }
}

/// Per-connection inbound dispatch for the broker.
struct BrokerInbound {
    inner: Weak<BrokerInner>,
    /// Set by the first announce; read by the connection task for reaping.
    process: Mutex<Option<ProcessId>>,
}

#[async_trait]
impl InboundHandler for BrokerInbound {
    async fn handle(&self, channel: &Arc<Channel>, request: RequestBody) -> ResponseBody {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => {
                return ResponseBody::Error {
                    code: 503,
                    message: "communicator is shutting down".into(),
                }
            }
        };

        match request {
            RequestBody::Announce(announce) => self.handle_announce(&inner, channel, announce).await,
            RequestBody::Invoke(invoke) => ResponseBody::Invoke(inner.registry.dispatch(&invoke)),
        }
    }
}

impl BrokerInbound {
    async fn handle_announce(
        &self,
        inner: &Arc<BrokerInner>,
        channel: &Arc<Channel>,
        announce: AnnounceRequest,
    ) -> ResponseBody {
        let pid = ProcessId(announce.process_id);

        // First announce on this connection registers the process. The map
        // guard must not be held across an await.
        let process = {
            let entry = inner.processes.entry(pid).or_insert_with(|| {
                info!(process = pid.0, peer = %channel.peer(), "remote process connected");
                Arc::new(RemoteProcess {
                    id: pid,
                    channel: Arc::clone(channel),
                    parent: Arc::downgrade(inner),
                    served: Mutex::new(Vec::new()),
                    offered: Mutex::new(HashMap::new()),
                })
            });
            Arc::clone(entry.value())
        };
        *self.process.lock() = Some(pid);

        let response = match announce.kind {
            AnnounceKind::Probe => AnnounceResponse::empty(),

            AnnounceKind::Offer {
                interface_id,
                token,
            } => {
                info!(
                    process = pid.0,
                    interface_id, "peer offered an implementation"
                );
                process.offered.lock().insert(interface_id, token);
                AnnounceResponse::empty()
            }

            AnnounceKind::Interface {
                class_name,
                interface_id,
                version,
            } => {
                let resolved = inner
                    .resolver
                    .resolve(class_name.as_deref(), interface_id, version)
                    .await;
                match resolved {
                    Some(object) => {
                        let token = inner.registry.expose(object);
                        process.served.lock().push(token);
                        debug!(process = pid.0, interface_id, token = token.get(), "announce resolved");
                        AnnounceResponse::with_implementation(token)
                    }
                    None => {
                        debug!(process = pid.0, interface_id, "nothing to offer");
                        AnnounceResponse::empty()
                    }
                }
            }
        };

        ResponseBody::Announce(inner.announce_extras(response))
    }
}

/// The broker: owns the listening side and the live-process map.
pub struct Communicator {
    inner: Arc<BrokerInner>,
    shutdown: watch::Sender<bool>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl Communicator {
    /// Bind `node` and start accepting.
    ///
    /// If the configuration names a proxy-stub directory, its modules are
    /// loaded before the listener starts so early announces can already
    /// be satisfied.
    pub fn new(
        node: NodeId,
        resolver: Arc<dyn ObjectResolver>,
        registry: Arc<ProxyRegistry>,
        config: BrokerConfig,
    ) -> Result<Self, BrokerError> {
        let loader = ProxyStubLoader::new(Arc::clone(&registry));
        if let Some(path) = &config.proxy_stub_path {
            loader.load_all(path);
        }

        let name = node.to_local_name().map_err(|source| BrokerError::Bind {
            node: node.as_str().to_string(),
            source,
        })?;
        let listener =
            ListenerOptions::new()
                .name(name)
                .create_tokio()
                .map_err(|source| BrokerError::Bind {
                    node: node.as_str().to_string(),
                    source,
                })?;

        let connections = Arc::new(ConnectionPool::new(config.connections.clone()));
        let inner = Arc::new(BrokerInner {
            node,
            registry,
            resolver,
            processes: DashMap::new(),
            connections: Arc::clone(&connections),
            loader,
            config,
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_inner = Arc::clone(&inner);
        let listener_task = tokio::spawn(async move {
            accept_loop(accept_inner, listener, connections, shutdown_rx).await;
        });

        Ok(Self {
            inner,
            shutdown,
            listener_task: Mutex::new(Some(listener_task)),
        })
    }

    pub fn node(&self) -> &NodeId {
        &self.inner.node
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.inner.registry
    }

    /// Handle to a connected process, if present.
    pub fn process(&self, id: u32) -> Option<Arc<RemoteProcess>> {
        self.inner
            .processes
            .get(&ProcessId(id))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live remote processes.
    pub fn process_count(&self) -> usize {
        self.inner.processes.len()
    }

    /// Number of accepted connections currently active.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.active_count()
    }

    /// Flush process entries whose channel has already closed.
    pub fn reap_closed(&self) {
        self.inner.reap_closed();
    }

    /// Stop the broker.
    ///
    /// Precondition: the process map is empty, every process having been
    /// explicitly terminated or reaped beforehand. A non-empty map is a
    /// contract violation and fails with [`BrokerError::ProcessesAlive`]
    /// without touching the listener. The listener stop itself waits
    /// without a timeout; by contract everything is quiescent by then.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.inner.reap_closed();

        let live = self.inner.processes.len();
        if live != 0 {
            return Err(BrokerError::ProcessesAlive(live));
        }

        let _ = self.shutdown.send(true);
        let task = self.listener_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        let live = self.inner.processes.len();
        if live != 0 && !std::thread::panicking() {
            tracing::error!(live, "communicator dropped with live remote processes");
            debug_assert!(
                false,
                "communicator dropped with {live} live remote processes"
            );
        }
        if let Some(task) = self.listener_task.lock().take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    inner: Arc<BrokerInner>,
    listener: interprocess::local_socket::tokio::Listener,
    connections: Arc<ConnectionPool>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(node = %inner.node, "communicator listening");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok(stream) => {
                        let guard = match connections.try_acquire_owned() {
                            Some(guard) => guard,
                            None => {
                                warn!(
                                    max = connections.max_connections(),
                                    "connection limit reached, dropping connection"
                                );
                                continue;
                            }
                        };

                        let inbound = Arc::new(BrokerInbound {
                            inner: Arc::downgrade(&inner),
                            process: Mutex::new(None),
                        });
                        let channel = Channel::spawn(
                            stream,
                            inner.node.clone(),
                            Some(Arc::clone(&inbound) as Arc<dyn InboundHandler>),
                            inner.config.frame_limit,
                        );

                        let conn_inner = Arc::downgrade(&inner);
                        tokio::spawn(async move {
                            let _guard = guard;
                            let mut state = channel.state_watch();
                            while *state.borrow() != ChannelState::Closed {
                                if state.changed().await.is_err() {
                                    break;
                                }
                            }
                            // Peer disconnected: reap its process entry.
                            let pid = *inbound.process.lock();
                            if let (Some(inner), Some(pid)) = (conn_inner.upgrade(), pid) {
                                inner.destroy(pid).await;
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
    debug!(node = %inner.node, "communicator listener stopped");
}
