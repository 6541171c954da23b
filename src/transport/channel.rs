//! Bidirectional message channel with invoke/response correlation.
//!
//! A `Channel` owns one connected stream. Outbound requests are matched
//! to their responses through a pending map keyed by correlation id;
//! unsolicited inbound requests are handed to the registered
//! [`InboundHandler`] on the channel's own delivery task.
//!
//! Completion discipline: every pending invoke is woken exactly once, by
//! whichever of {response, timeout, channel close} wins. Closing a channel
//! drops all pending senders, so waiters blocked on an in-flight exchange
//! observe `ChannelError::Closed` instead of hanging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

use super::frame::{read_frame, write_frame, FrameError};
use super::NodeId;
use crate::protocol::{decode_message, encode_message, Message, ProtocolError, RequestBody, ResponseBody};

/// Process-unique channel ids; part of proxy identity.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Channel is not connected")]
    NotConnected,

    #[error("Invoke timed out")]
    Timeout,

    #[error("Channel closed while waiting for a response")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Connect failed: {0}")]
    Connect(#[from] std::io::Error),
}

/// Connection state observable by owners of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connected,
    Closed,
}

/// Receiver of unsolicited inbound requests.
///
/// Invoked on the channel's delivery task, not the caller's thread.
/// Each request is delivered exactly once; the returned body is sent
/// back under the request's correlation id.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, channel: &Arc<Channel>, request: RequestBody) -> ResponseBody;
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// One bidirectional message transport to a single peer.
pub struct Channel {
    id: u64,
    peer: NodeId,
    frame_limit: usize,
    writer: tokio::sync::Mutex<Writer>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ResponseBody>>>,
    next_request: AtomicU64,
    state: watch::Sender<ChannelState>,
}

impl Channel {
    /// Wrap a connected stream and start its delivery task.
    pub fn spawn<S>(
        stream: S,
        peer: NodeId,
        handler: Option<Arc<dyn InboundHandler>>,
        frame_limit: usize,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (state, _) = watch::channel(ChannelState::Connected);

        let channel = Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::SeqCst),
            peer,
            frame_limit,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            state,
        });

        let driver = Arc::clone(&channel);
        tokio::spawn(async move {
            driver.read_loop(reader, handler).await;
        });

        channel
    }

    /// Connect to a listening peer and spawn the channel.
    pub async fn connect(
        node: &NodeId,
        handler: Option<Arc<dyn InboundHandler>>,
        frame_limit: usize,
    ) -> Result<Arc<Self>, ChannelError> {
        use interprocess::local_socket::tokio::{prelude::*, Stream};

        let name = node.to_local_name()?;
        let stream = Stream::connect(name).await?;
        Ok(Self::spawn(stream, node.clone(), handler, frame_limit))
    }

    /// Process-unique channel id; part of proxy identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow() == ChannelState::Connected
    }

    /// Watch for connect/disconnect transitions.
    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Send a request and wait for its response, bounded by `timeout`.
    ///
    /// The timeout covers the full exchange. A timed-out invoke removes
    /// its pending entry, so a late response is discarded rather than
    /// delivered to a completed call.
    pub async fn invoke(
        &self,
        body: RequestBody,
        timeout: Duration,
    ) -> Result<ResponseBody, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotConnected);
        }

        let id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let bytes = match encode_message(&Message::Request { id, body }) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.pending.lock().remove(&id);
                return Err(e.into());
            }
        };

        if let Err(e) = self.write(&bytes).await {
            self.pending.lock().remove(&id);
            self.mark_closed();
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the channel died while we were waiting.
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(ChannelError::Timeout)
            }
        }
    }

    /// Send a response for an inbound request.
    pub async fn respond(&self, id: u64, body: ResponseBody) -> Result<(), ChannelError> {
        let bytes = encode_message(&Message::Response { id, body })?;
        self.write(&bytes).await
    }

    /// Close the channel: wake all pending invokes and shut the stream down.
    pub async fn close(&self) {
        self.mark_closed();
        use tokio::io::AsyncWriteExt;
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, bytes, self.frame_limit).await?;
        Ok(())
    }

    fn mark_closed(&self) {
        self.state.send_replace(ChannelState::Closed);
        // Dropping the senders wakes every pending waiter with Closed.
        self.pending.lock().clear();
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: R, handler: Option<Arc<dyn InboundHandler>>)
    where
        R: AsyncRead + Send + Unpin,
    {
        loop {
            let bytes = match read_frame(&mut reader, self.frame_limit).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(channel = self.id, error = %e, "channel read ended");
                    break;
                }
            };

            let message = match decode_message(&bytes) {
                Ok(message) => message,
                Err(e) => {
                    warn!(channel = self.id, error = %e, "undecodable frame, closing channel");
                    break;
                }
            };

            match message {
                Message::Response { id, body } => {
                    let sender = self.pending.lock().remove(&id);
                    match sender {
                        Some(tx) => {
                            let _ = tx.send(body);
                        }
                        // Completed or timed out before the response arrived.
                        None => trace!(channel = self.id, id, "response without pending invoke"),
                    }
                }
                Message::Request { id, body } => match &handler {
                    Some(handler) => {
                        let channel = Arc::clone(&self);
                        let handler = Arc::clone(handler);
                        tokio::spawn(async move {
                            let response = handler.handle(&channel, body).await;
                            if let Err(e) = channel.respond(id, response).await {
                                debug!(channel = channel.id, error = %e, "failed to send response");
                            }
                        });
                    }
                    None => {
                        let response = ResponseBody::Error {
                            code: 501,
                            message: "no inbound handler registered".into(),
                        };
                        if let Err(e) = self.respond(id, response).await {
                            debug!(channel = self.id, error = %e, "failed to send error response");
                        }
                    }
                },
            }
        }

        self.mark_closed();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}
