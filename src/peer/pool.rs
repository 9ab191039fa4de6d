//! Bounded pool of reusable transports.
//!
//! Creating a peer connection and configuring its media slots is the slow
//! part of starting a preview, so released transports are kept around and
//! handed to the next negotiation. Terminal transports are dropped lazily,
//! whenever they are popped or released; nothing prunes the pool on a timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::transport::{Transport, TransportFactory};
use crate::error::Result;

/// Maximum number of idle transports kept for reuse
pub const MAX_POOL_SIZE: usize = 8;

/// Pool counters (atomic, lock-free)
#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time view of the pool
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub created: u64,
    pub reused: u64,
    pub returned: u64,
    pub discarded: u64,
}

pub struct TransportPool {
    factory: Arc<dyn TransportFactory>,
    idle: Mutex<Vec<Arc<dyn Transport>>>,
    capacity: usize,
    counters: PoolCounters,
}

impl TransportPool {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self::with_capacity(factory, MAX_POOL_SIZE)
    }

    pub fn with_capacity(factory: Arc<dyn TransportFactory>, capacity: usize) -> Self {
        Self {
            factory,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            counters: PoolCounters::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Borrow a transport.
    ///
    /// Pops the most recently released usable transport, or creates a new
    /// one when the pool is empty. Never waits for another borrower.
    pub async fn acquire(&self) -> Result<Arc<dyn Transport>> {
        loop {
            let popped = self.idle.lock().pop();
            match popped {
                Some(transport) if !transport.state().is_terminal() => {
                    self.counters.reused.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Reusing pooled transport {}", transport.id());
                    return Ok(transport);
                }
                Some(transport) => {
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "Dropping pooled transport {} in state {:?}",
                        transport.id(),
                        transport.state()
                    );
                }
                None => break,
            }
        }

        let transport = self.factory.create().await?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(transport)
    }

    /// Give a borrowed transport back.
    ///
    /// Terminal transports are discarded. Others have their tracks stripped
    /// and are kept if there is room, otherwise closed.
    pub async fn release(&self, transport: Arc<dyn Transport>) {
        if transport.state().is_terminal() {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            log::debug!("Discarding terminal transport {}", transport.id());
            return;
        }

        transport.strip_tracks().await;

        let overflow = {
            let mut idle = self.idle.lock();
            if idle.iter().any(|t| t.id() == transport.id()) {
                log::warn!("Transport {} released twice", transport.id());
                return;
            }
            if transport.state().is_terminal() {
                Some(transport)
            } else if idle.len() < self.capacity {
                idle.push(transport);
                None
            } else {
                Some(transport)
            }
        };

        match overflow {
            Some(transport) => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                log::debug!("Pool full, closing transport {}", transport.id());
                transport.close().await;
            }
            None => {
                self.counters.returned.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Create up to `count` transports ahead of time, bounded by free capacity.
    ///
    /// Each one gets its receive-only audio/video slots configured so the
    /// next [`acquire`](Self::acquire) skips that work. Returns how many were
    /// added.
    pub async fn pre_warm(&self, count: usize) -> Result<usize> {
        let room = self.capacity.saturating_sub(self.idle_count());
        let mut added = 0;

        for _ in 0..count.min(room) {
            let transport = self.factory.create().await?;
            self.counters.created.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = transport.add_receivers().await {
                transport.close().await;
                return Err(e);
            }

            let overflow = {
                let mut idle = self.idle.lock();
                if idle.len() < self.capacity {
                    idle.push(transport);
                    None
                } else {
                    Some(transport)
                }
            };
            if let Some(transport) = overflow {
                transport.close().await;
                break;
            }
            added += 1;
        }

        if added > 0 {
            log::debug!("Pre-warmed {} transport(s)", added);
        }
        Ok(added)
    }

    /// Close every idle transport.
    pub async fn drain(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.idle.lock());
        for transport in drained {
            transport.close().await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle_count(),
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            returned: self.counters.returned.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeFactory;
    use crate::peer::TransportState;

    fn pool(capacity: usize) -> (Arc<FakeFactory>, TransportPool) {
        let factory = Arc::new(FakeFactory::default());
        let pool = TransportPool::with_capacity(factory.clone(), capacity);
        (factory, pool)
    }

    #[tokio::test]
    async fn test_acquire_on_empty_pool_creates() {
        let (factory, pool) = pool(2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_release_then_acquire_reuses() {
        let (factory, pool) = pool(2);
        let a = pool.acquire().await.unwrap();
        let id = a.id();
        pool.release(a).await;
        assert_eq!(pool.idle_count(), 1);

        let b = pool.acquire().await.unwrap();
        assert_eq!(b.id(), id);
        assert_eq!(factory.created(), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_release_strips_tracks() {
        let (factory, pool) = pool(2);
        let a = pool.acquire().await.unwrap();
        pool.release(a).await;
        assert_eq!(factory.transport(0).strip_count(), 1);
    }

    #[tokio::test]
    async fn test_terminal_release_not_pooled() {
        let (factory, pool) = pool(2);
        let a = pool.acquire().await.unwrap();
        factory.transport(0).set_state(TransportState::Failed);
        pool.release(a).await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_terminal_idle_skipped_on_acquire() {
        let (factory, pool) = pool(2);
        let a = pool.acquire().await.unwrap();
        pool.release(a).await;
        factory.transport(0).set_state(TransportState::Closed);

        let b = pool.acquire().await.unwrap();
        assert_ne!(b.id(), factory.transport(0).id());
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_capacity() {
        let (_factory, pool) = pool(2);
        let mut borrowed = Vec::new();
        for _ in 0..4 {
            borrowed.push(pool.acquire().await.unwrap());
        }
        for t in borrowed {
            pool.release(t).await;
            assert!(pool.idle_count() <= 2);
        }
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.stats().discarded, 2);
    }

    #[tokio::test]
    async fn test_double_release_ignored() {
        let (_factory, pool) = pool(4);
        let a = pool.acquire().await.unwrap();
        pool.release(a.clone()).await;
        pool.release(a).await;
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_pre_warm_bounded_by_capacity() {
        let (factory, pool) = pool(3);
        let a = pool.acquire().await.unwrap();
        pool.release(a).await;

        let added = pool.pre_warm(5).await.unwrap();
        assert_eq!(added, 2);
        assert_eq!(pool.idle_count(), 3);
        assert!(factory.transport(1).has_receivers());
        assert!(factory.transport(2).has_receivers());
        assert!(!factory.transport(0).has_receivers());
    }

    #[tokio::test]
    async fn test_drain_closes_idle() {
        let (factory, pool) = pool(2);
        pool.pre_warm(2).await.unwrap();
        pool.drain().await;
        assert_eq!(pool.idle_count(), 0);
        assert!(factory.transport(0).state().is_terminal());
    }
}
