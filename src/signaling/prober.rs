//! Cached relay availability check.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::relay::RelayApi;

struct CachedProbe {
    available: bool,
    checked_at: Instant,
}

/// Answers "is the relay reachable?" without paying a round-trip every time.
///
/// Concurrent callers share one in-flight probe.
pub struct AvailabilityProber {
    relay: Arc<dyn RelayApi>,
    ttl: Duration,
    timeout: Duration,
    cache: Mutex<Option<CachedProbe>>,
}

impl AvailabilityProber {
    pub fn new(relay: Arc<dyn RelayApi>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            relay,
            ttl,
            timeout,
            cache: Mutex::new(None),
        }
    }

    /// Never fails; any error reaching the relay counts as unavailable.
    pub async fn is_available(&self) -> bool {
        let mut cache = self.cache.lock().await;
        if let Some(probe) = cache.as_ref() {
            if probe.checked_at.elapsed() < self.ttl {
                return probe.available;
            }
        }

        let available = match tokio::time::timeout(self.timeout, self.relay.status()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::warn!("Relay probe failed: {}", e);
                false
            }
            Err(_) => {
                log::warn!("Relay probe timed out after {:?}", self.timeout);
                false
            }
        };

        *cache = Some(CachedProbe {
            available,
            checked_at: Instant::now(),
        });
        available
    }

    /// Probe now so the first real connection finds a warm cache.
    pub async fn pre_warm(&self) -> bool {
        self.is_available().await
    }

    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }
}
