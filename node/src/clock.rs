use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Source of wall time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Wall clock pinned to `base_ms` at construction and advanced by the tokio
/// monotonic clock.
///
/// Under a paused tokio runtime the reported time moves only when tokio
/// time advances, so timers and timestamps stay in lockstep.
#[derive(Clone, Debug)]
pub struct AnchoredClock {
    base_ms: u64,
    origin: Instant,
    skew_ms: Arc<AtomicU64>,
}

impl AnchoredClock {
    pub fn new(base_ms: u64) -> Self {
        Self {
            base_ms,
            origin: Instant::now(),
            skew_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Moves the reported wall time forward by `ms` without advancing tokio
    /// time, the way a host suspend shifts the wall clock under running
    /// timers.
    pub fn skew(&self, ms: u64) {
        self.skew_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for AnchoredClock {
    fn now_ms(&self) -> u64 {
        self.base_ms
            .saturating_add(self.origin.elapsed().as_millis() as u64)
            .saturating_add(self.skew_ms.load(Ordering::SeqCst))
    }
}
