//! Accept-side connection limiting with RAII guards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_connections: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
        }
    }
}

/// Counts live accepted connections; connect servicing holds a guard for
/// the lifetime of its channel task.
pub struct ConnectionPool {
    active: AtomicUsize,
    config: ConnectionConfig,
}

impl ConnectionPool {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            active: AtomicUsize::new(0),
            config,
        }
    }

    /// Try to acquire a slot for a spawned connection task.
    pub fn try_acquire_owned(self: &Arc<Self>) -> Option<OwnedConnectionGuard> {
        loop {
            let current = self.active.load(Ordering::Relaxed);
            if current >= self.config.max_connections {
                return None;
            }

            if self
                .active
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some(OwnedConnectionGuard {
                    pool: Arc::clone(self),
                });
            }
            // CAS failed, retry
        }
    }

    /// Current number of active connections.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Guard that releases its slot on drop; owns a pool reference so it can
/// travel into spawned tasks.
pub struct OwnedConnectionGuard {
    pool: Arc<ConnectionPool>,
}

impl Drop for OwnedConnectionGuard {
    fn drop(&mut self) {
        self.pool.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let pool = Arc::new(ConnectionPool::new(ConnectionConfig { max_connections: 2 }));

        let g1 = pool.try_acquire_owned();
        assert!(g1.is_some());
        assert_eq!(pool.active_count(), 1);

        let g2 = pool.try_acquire_owned();
        assert!(g2.is_some());
        assert_eq!(pool.active_count(), 2);

        drop(g1);
        assert_eq!(pool.active_count(), 1);

        drop(g2);
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn test_rejects_at_limit() {
        let pool = Arc::new(ConnectionPool::new(ConnectionConfig { max_connections: 1 }));
        let _g = pool.try_acquire_owned();
        assert!(pool.try_acquire_owned().is_none());
    }
}
