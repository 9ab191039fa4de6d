//! Exponential backoff and the timer that drives automatic reconnection.
//!
//! [`Backoff`] is the pure part: a delay that grows by a fixed factor up to
//! a ceiling and snaps back to its floor on success. [`RetryController`]
//! owns the timer and calls a [`Reconnect`] implementation when it fires.
//! The same controller type serves preview reconnection and any other
//! auto-reconnect loop; each use gets its own instance.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;
use crate::error::Result;

/// Backoff policy with a running delay.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor: factor.max(1.0),
            current: initial.min(max),
        }
    }

    /// The delay the next call to [`next_delay`](Self::next_delay) returns.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the delay to wait now and grow the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.factor).min(self.max);
        delay
    }

    /// Back to the floor, after a success.
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Backoff::new(
            Duration::from_millis(config.initial_ms),
            Duration::from_millis(config.max_ms),
            config.factor,
        )
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::from(&BackoffConfig::default())
    }
}

/// The guarded operation a [`RetryController`] re-attempts.
#[async_trait]
pub trait Reconnect: Send + Sync {
    async fn reconnect(&self) -> Result<()>;
}

struct ArmedTimer {
    generation: u64,
    cancel: CancellationToken,
}

struct RetryInner {
    name: String,
    operation: Arc<dyn Reconnect>,
    backoff: Mutex<Backoff>,
    manual_stop: AtomicBool,
    timer: Mutex<Option<ArmedTimer>>,
    generation: AtomicU64,
    attempts: AtomicU32,
}

/// Re-attempts an operation with exponential backoff until it succeeds,
/// unless the user has explicitly stopped it.
#[derive(Clone)]
pub struct RetryController {
    inner: Arc<RetryInner>,
}

impl RetryController {
    pub fn new(name: &str, operation: Arc<dyn Reconnect>, backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(RetryInner {
                name: name.to_string(),
                operation,
                backoff: Mutex::new(backoff),
                manual_stop: AtomicBool::new(false),
                timer: Mutex::new(None),
                generation: AtomicU64::new(0),
                attempts: AtomicU32::new(0),
            }),
        }
    }

    /// Arm the retry timer at the current delay.
    ///
    /// Returns `false` without doing anything if retries are suppressed by
    /// [`mark_manual_stop`](Self::mark_manual_stop) or a timer is already
    /// armed. Must be called from within a tokio runtime.
    pub fn schedule_retry(&self) -> bool {
        if self.inner.manual_stop.load(Ordering::SeqCst) {
            log::debug!("[{}] Retry suppressed by manual stop", self.inner.name);
            return false;
        }

        let cancel = CancellationToken::new();
        let generation = {
            let mut timer = self.inner.timer.lock();
            if timer.is_some() {
                return false;
            }
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *timer = Some(ArmedTimer {
                generation,
                cancel: cancel.clone(),
            });
            generation
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_retries(&inner, &cancel).await;
            let mut timer = inner.timer.lock();
            if timer.as_ref().map(|t| t.generation) == Some(generation) {
                *timer = None;
            }
        });
        true
    }

    /// Suppress automatic retries and disarm a pending timer.
    pub fn mark_manual_stop(&self) {
        self.inner.manual_stop.store(true, Ordering::SeqCst);
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.cancel.cancel();
        }
    }

    /// Allow automatic retries again.
    pub fn mark_manual_start(&self) {
        self.inner.manual_stop.store(false, Ordering::SeqCst);
    }

    pub fn is_manually_stopped(&self) -> bool {
        self.inner.manual_stop.load(Ordering::SeqCst)
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    /// Number of times the operation has been attempted.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn current_delay(&self) -> Duration {
        self.inner.backoff.lock().current()
    }
}

async fn run_retries(inner: &RetryInner, cancel: &CancellationToken) {
    loop {
        let delay = inner.backoff.lock().next_delay();
        log::debug!("[{}] Retrying in {:?}", inner.name, delay);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if inner.manual_stop.load(Ordering::SeqCst) {
            return;
        }

        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = inner.operation.reconnect() => result,
        };

        match result {
            Ok(()) => {
                log::info!("[{}] Reconnected after {} attempt(s)", inner.name, attempt);
                inner.backoff.lock().reset();
                return;
            }
            Err(e) => {
                log::warn!("[{}] Reconnect attempt {} failed: {}", inner.name, attempt, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PreviewError;

    /// Fails `failures` times, then succeeds.
    struct Flaky {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Reconnect for Flaky {
        async fn reconnect(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(());
            }
            self.failures.store(left - 1, Ordering::SeqCst);
            Err(PreviewError::Unavailable("relay down".into()))
        }
    }

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(5), Duration::from_millis(20), 2.0)
    }

    #[test]
    fn test_backoff_grows_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 2.0);
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_backoff_reset_returns_to_floor() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_secs(4));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retries_until_success_then_resets() {
        let op = Flaky::new(2);
        let controller = RetryController::new("test", op.clone(), fast_backoff());

        assert!(controller.schedule_retry());
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(op.calls.load(Ordering::SeqCst), 3);
        assert_eq!(controller.attempts(), 3);
        assert!(!controller.is_scheduled());
        assert_eq!(controller.current_delay(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_schedule_while_armed_is_ignored() {
        let op = Flaky::new(0);
        let controller = RetryController::new(
            "test",
            op.clone(),
            Backoff::new(Duration::from_millis(50), Duration::from_millis(50), 2.0),
        );
        assert!(controller.schedule_retry());
        assert!(!controller.schedule_retry());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_manual_stop_suppresses_until_start() {
        let op = Flaky::new(0);
        let controller = RetryController::new(
            "test",
            op.clone(),
            Backoff::new(Duration::from_millis(30), Duration::from_millis(30), 2.0),
        );

        assert!(controller.schedule_retry());
        controller.mark_manual_stop();
        assert!(!controller.is_scheduled());
        assert!(!controller.schedule_retry());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(op.calls.load(Ordering::SeqCst), 0);

        controller.mark_manual_start();
        assert!(controller.schedule_retry());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
    }
}
