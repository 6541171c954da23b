//! Proxy registry: turns remote implementation tokens into typed local
//! proxies, and dispatches inbound invokes to locally exposed objects.
//!
//! Factories are registered per interface id, normally as a load-time
//! effect of a marshaling module. Proxies are shared-ownership handles;
//! the registry keeps a per-identity live count with a weak back-reference
//! so the last holder's drop releases the identity exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, trace};

use crate::protocol::{InvokeRequest, InvokeResponse, RawToken, RequestBody, ResponseBody};
use crate::transport::{Channel, ChannelError};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No exposed object for token {0}")]
    UnknownToken(u64),

    #[error("Interface mismatch: object is {actual:#x}, invoke names {requested:#x}")]
    InterfaceMismatch { requested: u32, actual: u32 },

    #[error("Invoke failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Remote fault: {0}")]
    Remote(String),

    #[error("Unexpected response type")]
    UnexpectedResponse,
}

/// Proxy identity: two requests resolving to the same key address the
/// same remote object, even when the registry hands out fresh wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ProxyKey {
    channel_id: u64,
    token: RawToken,
    interface_id: u32,
}

/// Everything a proxy needs to reach its remote implementation.
///
/// Dropping the last link for an identity releases it back to the
/// registry.
pub struct ProxyLink {
    pub channel: Arc<Channel>,
    pub token: RawToken,
    pub interface_id: u32,
    /// True when the implementation lives on this side and was offered to
    /// the peer, false for an ordinary remote implementation.
    pub offered_locally: bool,
    /// Whether the proxy should allocate event/callback plumbing.
    pub event_handling: bool,
    _release: ReleaseGuard,
}

struct ReleaseGuard {
    registry: Weak<ProxyRegistry>,
    key: ProxyKey,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.key);
        }
    }
}

/// A local stand-in for a remote interface implementation.
///
/// `invoke_raw` forwards a method call over the link's channel, tagged
/// with the raw token so the remote side dispatches to the right object.
#[async_trait]
pub trait ProxyObject: Send + Sync {
    fn link(&self) -> &ProxyLink;

    fn interface_id(&self) -> u32 {
        self.link().interface_id
    }

    fn token(&self) -> RawToken {
        self.link().token
    }

    async fn invoke_raw(
        &self,
        method_id: u32,
        params: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProxyError> {
        let link = self.link();
        let request = InvokeRequest {
            token: link.token,
            interface_id: link.interface_id,
            method_id,
            params,
        };
        match link
            .channel
            .invoke(RequestBody::Invoke(request), timeout)
            .await?
        {
            ResponseBody::Invoke(response) => match response.error {
                None => Ok(response.data),
                Some(message) => Err(ProxyError::Remote(message)),
            },
            ResponseBody::Error { message, .. } => Err(ProxyError::Remote(message)),
            ResponseBody::Announce(_) => Err(ProxyError::UnexpectedResponse),
        }
    }
}

/// Constructs proxies for one interface id.
///
/// Registered by marshaling modules (or directly by embedders in tests).
pub trait ProxyFactory: Send + Sync {
    fn interface_id(&self) -> u32;
    fn create(&self, link: ProxyLink) -> Arc<dyn ProxyObject>;
}

/// An object exposed locally so the remote end can call into it.
pub trait LocalObject: Send + Sync {
    fn interface_id(&self) -> u32;
    fn invoke(&self, method_id: u32, params: &[u8]) -> Result<Vec<u8>, DispatchError>;
}

/// Untyped proxy over the generic invoke envelope.
///
/// Marshaling modules usually wrap this in a typed facade; it is also the
/// proxy of last resort for interfaces without generated code.
pub struct RemoteObject {
    link: ProxyLink,
}

impl ProxyObject for RemoteObject {
    fn link(&self) -> &ProxyLink {
        &self.link
    }
}

/// Factory producing [`RemoteObject`] proxies for a fixed interface id.
pub struct RemoteObjectFactory {
    interface_id: u32,
}

impl RemoteObjectFactory {
    pub fn new(interface_id: u32) -> Self {
        Self { interface_id }
    }
}

impl ProxyFactory for RemoteObjectFactory {
    fn interface_id(&self) -> u32 {
        self.interface_id
    }

    fn create(&self, link: ProxyLink) -> Arc<dyn ProxyObject> {
        Arc::new(RemoteObject { link })
    }
}

/// The administrator of cross-process object identity for one process.
pub struct ProxyRegistry {
    factories: RwLock<HashMap<u32, Arc<dyn ProxyFactory>>>,
    live: Mutex<HashMap<ProxyKey, usize>>,
    exposed: Mutex<HashMap<RawToken, Arc<dyn LocalObject>>>,
    next_token: AtomicU64,
}

impl ProxyRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            factories: RwLock::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
            exposed: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    /// Register a proxy factory for its interface id. Later registrations
    /// for the same id replace earlier ones.
    pub fn register_factory(&self, factory: Arc<dyn ProxyFactory>) {
        let interface_id = factory.interface_id();
        self.factories.write().insert(interface_id, factory);
        trace!(interface_id, "proxy factory registered");
    }

    pub fn unregister_factory(&self, interface_id: u32) {
        self.factories.write().remove(&interface_id);
    }

    pub fn has_factory(&self, interface_id: u32) -> bool {
        self.factories.read().contains_key(&interface_id)
    }

    /// Wrap a raw remote-implementation token as a local proxy bound to
    /// `channel`. Returns `None` when no factory is registered for the
    /// interface id.
    pub fn create_proxy(
        self: &Arc<Self>,
        interface_id: u32,
        channel: Arc<Channel>,
        token: RawToken,
        offered_locally: bool,
        event_handling: bool,
    ) -> Option<Arc<dyn ProxyObject>> {
        let factory = self.factories.read().get(&interface_id).cloned();
        let factory = match factory {
            Some(factory) => factory,
            None => {
                debug!(interface_id, "no proxy factory for interface");
                return None;
            }
        };

        let key = ProxyKey {
            channel_id: channel.id(),
            token,
            interface_id,
        };
        *self.live.lock().entry(key).or_insert(0) += 1;

        let link = ProxyLink {
            channel,
            token,
            interface_id,
            offered_locally,
            event_handling,
            _release: ReleaseGuard {
                registry: Arc::downgrade(self),
                key,
            },
        };
        Some(factory.create(link))
    }

    /// Number of distinct live proxy identities.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    fn release(&self, key: ProxyKey) {
        let mut live = self.live.lock();
        if let Some(count) = live.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                live.remove(&key);
                trace!(?key, "proxy identity released");
            }
        }
    }

    /// Expose a local object under a freshly allocated token.
    pub fn expose(&self, object: Arc<dyn LocalObject>) -> RawToken {
        let token = RawToken::new(self.next_token.fetch_add(1, Ordering::SeqCst))
            .expect("token counter starts at 1");
        self.exposed.lock().insert(token, object);
        token
    }

    /// Expose a local object under a caller-chosen token (the offer form).
    pub fn expose_as(&self, token: RawToken, object: Arc<dyn LocalObject>) {
        self.exposed.lock().insert(token, object);
    }

    /// Withdraw an exposed object.
    pub fn revoke(&self, token: RawToken) -> Option<Arc<dyn LocalObject>> {
        self.exposed.lock().remove(&token)
    }

    pub fn exposed_count(&self) -> usize {
        self.exposed.lock().len()
    }

    /// Dispatch an inbound invoke to the exposed object it names.
    pub fn dispatch(&self, request: &InvokeRequest) -> InvokeResponse {
        let object = self.exposed.lock().get(&request.token).cloned();
        let object = match object {
            Some(object) => object,
            None => {
                return InvokeResponse::error(
                    DispatchError::UnknownToken(request.token.get()).to_string(),
                )
            }
        };

        if object.interface_id() != request.interface_id {
            return InvokeResponse::error(
                DispatchError::InterfaceMismatch {
                    requested: request.interface_id,
                    actual: object.interface_id(),
                }
                .to_string(),
            );
        }

        match object.invoke(request.method_id, &request.params) {
            Ok(data) => InvokeResponse::success(data),
            Err(e) => InvokeResponse::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NodeId;

    fn test_channel() -> Arc<Channel> {
        let (a, _b) = tokio::io::duplex(4096);
        Channel::spawn(a, NodeId::new("test"), None, 1024 * 1024)
    }

    struct Echo {
        interface_id: u32,
    }

    impl LocalObject for Echo {
        fn interface_id(&self) -> u32 {
            self.interface_id
        }

        fn invoke(&self, _method_id: u32, params: &[u8]) -> Result<Vec<u8>, DispatchError> {
            Ok(params.to_vec())
        }
    }

    #[tokio::test]
    async fn test_create_proxy_without_factory_is_none() {
        let registry = ProxyRegistry::new();
        let proxy = registry.create_proxy(
            0xFFFF_FFFF,
            test_channel(),
            RawToken::new(1).unwrap(),
            false,
            true,
        );
        assert!(proxy.is_none());
    }

    #[tokio::test]
    async fn test_create_proxy_with_factory() {
        let registry = ProxyRegistry::new();
        registry.register_factory(Arc::new(RemoteObjectFactory::new(0x1001)));

        let token = RawToken::new(99).unwrap();
        let proxy = registry
            .create_proxy(0x1001, test_channel(), token, false, true)
            .expect("factory is registered");
        assert_eq!(proxy.interface_id(), 0x1001);
        assert_eq!(proxy.token(), token);
    }

    #[tokio::test]
    async fn test_last_drop_releases_identity_once() {
        let registry = ProxyRegistry::new();
        registry.register_factory(Arc::new(RemoteObjectFactory::new(0x1001)));
        let channel = test_channel();
        let token = RawToken::new(5).unwrap();

        let first = registry
            .create_proxy(0x1001, Arc::clone(&channel), token, false, false)
            .unwrap();
        let second = registry
            .create_proxy(0x1001, Arc::clone(&channel), token, false, false)
            .unwrap();
        assert_eq!(registry.live_count(), 1, "same identity, fresh wrappers");

        drop(first);
        assert_eq!(registry.live_count(), 1, "still held by the second wrapper");

        drop(second);
        assert_eq!(registry.live_count(), 0, "last drop releases");
    }

    #[tokio::test]
    async fn test_distinct_tokens_are_distinct_identities() {
        let registry = ProxyRegistry::new();
        registry.register_factory(Arc::new(RemoteObjectFactory::new(0x1001)));
        let channel = test_channel();

        let _a = registry
            .create_proxy(
                0x1001,
                Arc::clone(&channel),
                RawToken::new(1).unwrap(),
                false,
                false,
            )
            .unwrap();
        let _b = registry
            .create_proxy(
                0x1001,
                Arc::clone(&channel),
                RawToken::new(2).unwrap(),
                false,
                false,
            )
            .unwrap();
        assert_eq!(registry.live_count(), 2);
    }

    #[test]
    fn test_dispatch_unknown_token() {
        let registry = ProxyRegistry::new();
        let request = InvokeRequest {
            token: RawToken::new(404).unwrap(),
            interface_id: 1,
            method_id: 0,
            params: vec![],
        };
        let response = registry.dispatch(&request);
        assert!(response.error.is_some());
    }

    #[test]
    fn test_dispatch_interface_mismatch() {
        let registry = ProxyRegistry::new();
        let token = registry.expose(Arc::new(Echo { interface_id: 7 }));
        let request = InvokeRequest {
            token,
            interface_id: 8,
            method_id: 0,
            params: vec![],
        };
        let response = registry.dispatch(&request);
        assert!(response.error.unwrap().contains("mismatch"));
    }

    #[test]
    fn test_expose_dispatch_revoke() {
        let registry = ProxyRegistry::new();
        let token = registry.expose(Arc::new(Echo { interface_id: 7 }));

        let request = InvokeRequest {
            token,
            interface_id: 7,
            method_id: 1,
            params: vec![9, 9],
        };
        let response = registry.dispatch(&request);
        assert!(response.error.is_none());
        assert_eq!(response.data, vec![9, 9]);

        assert!(registry.revoke(token).is_some());
        let response = registry.dispatch(&request);
        assert!(response.error.is_some());
    }
}
