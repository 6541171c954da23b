//! Broker configuration loading from environment variables.
//!
//! All values are loaded from `COMRPC_*` environment variables with
//! sensible defaults. Invalid values fall back to defaults without
//! crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `COMRPC_FRAME_LIMIT` | 4194304 | Max framed message size (bytes) |
//! | `COMRPC_MAX_CONNECTIONS` | 64 | Max concurrent accepted channels |
//! | `COMRPC_PROXY_STUB_PATH` | (unset) | Marshaling-module directory |

use std::path::PathBuf;

use crate::transport::ConnectionConfig;

/// Configuration for a Communicator or CommunicatorClient.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Upper bound for one framed message.
    pub frame_limit: usize,
    /// Accept-side connection limit.
    pub connections: ConnectionConfig,
    /// Directory of marshaling modules, loaded at construction and
    /// announced to connecting peers. None disables both.
    pub proxy_stub_path: Option<PathBuf>,
    /// JSON category set announced to connecting peers as their default
    /// diagnostic configuration.
    pub trace_categories: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            frame_limit: DEFAULT_FRAME,
            connections: ConnectionConfig::default(),
            proxy_stub_path: None,
            trace_categories: None,
        }
    }
}

const DEFAULT_FRAME: usize = 4 * 1024 * 1024; // 4 MiB
const MIN_FRAME: usize = 4096; // floor: 4 KiB

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

impl BrokerConfig {
    /// Load configuration from environment variables.
    ///
    /// Missing or invalid values fall back to defaults without panicking.
    pub fn from_env() -> Self {
        let frame_limit = parse_usize("COMRPC_FRAME_LIMIT", DEFAULT_FRAME).max(MIN_FRAME);
        let max_connections = parse_usize("COMRPC_MAX_CONNECTIONS", 64).max(1);
        let proxy_stub_path = std::env::var("COMRPC_PROXY_STUB_PATH")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        Self {
            frame_limit,
            connections: ConnectionConfig { max_connections },
            proxy_stub_path,
            trace_categories: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.frame_limit, DEFAULT_FRAME);
        assert_eq!(config.connections.max_connections, 64);
        assert!(config.proxy_stub_path.is_none());
    }

    #[test]
    fn test_parse_helpers_fall_back() {
        assert_eq!(parse_usize("COMRPC_TEST_UNSET_VAR", 17), 17);
    }

    // Single test for all COMRPC_* variables so parallel test threads
    // never race on the shared environment.
    #[test]
    fn test_from_env_overrides_and_clamps() {
        std::env::set_var("COMRPC_FRAME_LIMIT", "8388608");
        std::env::set_var("COMRPC_MAX_CONNECTIONS", "128");
        std::env::set_var("COMRPC_PROXY_STUB_PATH", "/opt/comrpc/proxystubs");

        let config = BrokerConfig::from_env();
        assert_eq!(config.frame_limit, 8 * 1024 * 1024);
        assert_eq!(config.connections.max_connections, 128);
        assert_eq!(
            config.proxy_stub_path,
            Some(PathBuf::from("/opt/comrpc/proxystubs"))
        );

        // Below-floor and unparseable values fall back without panicking.
        std::env::set_var("COMRPC_FRAME_LIMIT", "1");
        std::env::set_var("COMRPC_MAX_CONNECTIONS", "plenty");
        std::env::set_var("COMRPC_PROXY_STUB_PATH", "");

        let config = BrokerConfig::from_env();
        assert_eq!(config.frame_limit, MIN_FRAME);
        assert_eq!(config.connections.max_connections, 64);
        assert!(config.proxy_stub_path.is_none());

        std::env::remove_var("COMRPC_FRAME_LIMIT");
        std::env::remove_var("COMRPC_MAX_CONNECTIONS");
        std::env::remove_var("COMRPC_PROXY_STUB_PATH");
    }
}
