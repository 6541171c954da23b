//! Wire format for the broker protocol.
//!
//! Two message families travel over a channel: the Announce pair exchanged
//! once per connection to negotiate which interface a peer wants, and the
//! generic Invoke envelope used for ordinary interface calls afterwards.
//! Requests and responses are correlated by a per-channel `u64` id.
//!
//! # Security
//! - Message size limits prevent memory exhaustion attacks
//! - Size checks happen BEFORE parsing to prevent allocation attacks

use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard cap on a single encoded message.
const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024; // 4 MiB

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Opaque handle identifying a remote object instance.
///
/// Meaningful only to the two endpoints that negotiated it. Absence of an
/// implementation is expressed as `Option<RawToken>`, never as a zero
/// sentinel on the Rust side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawToken(NonZeroU64);

impl RawToken {
    pub fn new(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(RawToken)
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

/// The three observable announce forms, as a proper tagged variant
/// rather than one message overloaded with sentinel values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AnnounceKind {
    /// Bare connection probe: no specific class or interface requested.
    #[serde(rename = "probe")]
    Probe,

    /// Request a named/typed object from the peer.
    #[serde(rename = "interface")]
    Interface {
        class_name: Option<String>,
        interface_id: u32,
        version: u32,
    },

    /// Offer a local object to the peer under an interface id, used by the
    /// side that runs as a callback/event target rather than a requester.
    #[serde(rename = "offer")]
    Offer { interface_id: u32, token: RawToken },
}

/// Announce request, sent once per channel right after connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceRequest {
    /// OS process id of the announcing side.
    pub process_id: u32,
    #[serde(flatten)]
    pub kind: AnnounceKind,
}

impl AnnounceRequest {
    /// Build a request for this process.
    pub fn new(kind: AnnounceKind) -> Self {
        Self {
            process_id: std::process::id(),
            kind,
        }
    }
}

/// Announce response.
///
/// A `None` implementation token means the remote side has nothing to
/// offer for the request; that is a legitimate outcome, not a transport
/// failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnounceResponse {
    pub implementation: Option<RawToken>,
    /// JSON-encoded default trace-category set to adopt process-wide.
    pub trace_categories: Option<String>,
    /// Directory the connecting side should scan for marshaling modules.
    pub proxy_stub_path: Option<String>,
}

impl AnnounceResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_implementation(token: RawToken) -> Self {
        Self {
            implementation: Some(token),
            ..Self::default()
        }
    }
}

/// Generic method-call envelope used after the handshake.
///
/// Opaque to the broker core: `params` is whatever the marshaling module
/// for `interface_id` produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub token: RawToken,
    pub interface_id: u32,
    pub method_id: u32,
    pub params: Vec<u8>,
}

/// Result of a dispatched invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub data: Vec<u8>,
    pub error: Option<String>,
}

impl InvokeResponse {
    pub fn success(data: Vec<u8>) -> Self {
        Self { data, error: None }
    }

    pub fn error(error: String) -> Self {
        Self {
            data: Vec::new(),
            error: Some(error),
        }
    }
}

/// Request payloads deliverable to a channel's inbound handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum RequestBody {
    #[serde(rename = "announce")]
    Announce(AnnounceRequest),

    #[serde(rename = "invoke")]
    Invoke(InvokeRequest),
}

/// Response payloads matched back to a pending invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ResponseBody {
    #[serde(rename = "announce")]
    Announce(AnnounceResponse),

    #[serde(rename = "invoke")]
    Invoke(InvokeResponse),

    #[serde(rename = "error")]
    Error { code: u32, message: String },
}

/// Top-level framed message with correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "request")]
    Request { id: u64, body: RequestBody },

    #[serde(rename = "response")]
    Response { id: u64, body: ResponseBody },
}

/// Encode a message to JSON bytes with size limit enforcement.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode a message from JSON bytes with size limit enforcement.
///
/// The size check happens before parsing.
pub fn decode_message(bytes: &[u8]) -> Result<Message, ProtocolError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_token_rejects_zero() {
        assert!(RawToken::new(0).is_none());
        assert_eq!(RawToken::new(7).unwrap().get(), 7);
    }

    #[test]
    fn test_announce_probe_roundtrip() {
        let msg = Message::Request {
            id: 1,
            body: RequestBody::Announce(AnnounceRequest::new(AnnounceKind::Probe)),
        };
        let encoded = encode_message(&msg).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        match decoded {
            Message::Request {
                id: 1,
                body: RequestBody::Announce(req),
            } => {
                assert!(matches!(req.kind, AnnounceKind::Probe));
                assert_eq!(req.process_id, std::process::id());
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_announce_interface_roundtrip() {
        let req = AnnounceRequest::new(AnnounceKind::Interface {
            class_name: Some("Foo".into()),
            interface_id: 0x1001,
            version: 1,
        });
        let msg = Message::Request {
            id: 2,
            body: RequestBody::Announce(req),
        };
        let decoded = decode_message(&encode_message(&msg).unwrap()).unwrap();
        match decoded {
            Message::Request {
                body: RequestBody::Announce(req),
                ..
            } => match req.kind {
                AnnounceKind::Interface {
                    class_name,
                    interface_id,
                    version,
                } => {
                    assert_eq!(class_name.as_deref(), Some("Foo"));
                    assert_eq!(interface_id, 0x1001);
                    assert_eq!(version, 1);
                }
                other => panic!("unexpected kind: {:?}", other),
            },
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_announce_offer_roundtrip() {
        let token = RawToken::new(0xDEAD).unwrap();
        let req = AnnounceRequest::new(AnnounceKind::Offer {
            interface_id: 0x2002,
            token,
        });
        let msg = Message::Request {
            id: 3,
            body: RequestBody::Announce(req),
        };
        let decoded = decode_message(&encode_message(&msg).unwrap()).unwrap();
        match decoded {
            Message::Request {
                body: RequestBody::Announce(req),
                ..
            } => {
                assert!(matches!(
                    req.kind,
                    AnnounceKind::Offer { interface_id: 0x2002, token: t } if t == token
                ));
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_announce_response_null_token() {
        let msg = Message::Response {
            id: 4,
            body: ResponseBody::Announce(AnnounceResponse::empty()),
        };
        let decoded = decode_message(&encode_message(&msg).unwrap()).unwrap();
        match decoded {
            Message::Response {
                body: ResponseBody::Announce(resp),
                ..
            } => {
                assert!(resp.implementation.is_none());
                assert!(resp.trace_categories.is_none());
                assert!(resp.proxy_stub_path.is_none());
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_invoke_roundtrip() {
        let req = InvokeRequest {
            token: RawToken::new(42).unwrap(),
            interface_id: 0x1001,
            method_id: 5,
            params: vec![1, 2, 3],
        };
        let msg = Message::Request {
            id: 5,
            body: RequestBody::Invoke(req),
        };
        let decoded = decode_message(&encode_message(&msg).unwrap()).unwrap();
        match decoded {
            Message::Request {
                body: RequestBody::Invoke(req),
                ..
            } => {
                assert_eq!(req.token.get(), 42);
                assert_eq!(req.method_id, 5);
                assert_eq!(req.params, vec![1, 2, 3]);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_decode_message_too_large() {
        let large = vec![0u8; MAX_MESSAGE_SIZE + 1];
        let result = decode_message(&large);
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_invoke_response_error() {
        let resp = InvokeResponse::error("nope".into());
        assert!(resp.data.is_empty());
        assert_eq!(resp.error.as_deref(), Some("nope"));
    }
}
