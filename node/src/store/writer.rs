//! Single-writer queue in front of the shared store.
//!
//! Writes are best-effort: a failed write is logged (at most once per minute
//! per kind) and dropped, and marks its kind degraded until the next
//! successful write of the same kind.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use geotrace_primitives::{BtLocToken, DeviceLocation, Handshake};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::{SharedStore, StoreError};

pub const FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Kind reported when the writer thread itself is gone.
const WRITER_KIND: &str = "writer";

enum StoreOp {
    DeviceLocation(DeviceLocation),
    BtLocToken(BtLocToken),
    Handshake(Handshake),
    Purge(u64),
    Flush(oneshot::Sender<Result<(), StoreError>>),
}

impl StoreOp {
    fn kind(&self) -> &'static str {
        match self {
            Self::DeviceLocation(_) => "device_location",
            Self::BtLocToken(_) => "bt_loc_token",
            Self::Handshake(_) => "handshake",
            Self::Purge(_) => "purge",
            Self::Flush(_) => "flush",
        }
    }
}

/// Rate limiter for persistence failure logs.
struct FailureLog {
    interval: Duration,
    last: HashMap<&'static str, Instant>,
    suppressed: HashMap<&'static str, u64>,
}

impl FailureLog {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
            suppressed: HashMap::new(),
        }
    }

    fn record(&mut self, kind: &'static str, error: &StoreError, now: Instant) {
        let due = self
            .last
            .get(kind)
            .map_or(true, |last| now.duration_since(*last) >= self.interval);
        if due {
            let suppressed = self.suppressed.remove(kind).unwrap_or(0);
            log::warn!(
                "Persistence failure on {} ({} similar suppressed): {}",
                kind,
                suppressed,
                error
            );
            self.last.insert(kind, now);
        } else {
            *self.suppressed.entry(kind).or_insert(0) += 1;
        }
    }
}

#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<StoreOp>,
    store: SharedStore,
    degraded: Degraded,
}

/// Write kinds whose latest attempt failed.
#[derive(Clone, Default)]
struct Degraded(Arc<Mutex<BTreeSet<&'static str>>>);

impl Degraded {
    fn mark(&self, kind: &'static str) {
        self.0.lock().insert(kind);
    }

    fn clear(&self, kind: &'static str) {
        self.0.lock().remove(kind);
    }

    fn kinds(&self) -> Vec<&'static str> {
        self.0.lock().iter().copied().collect()
    }
}

impl StoreWriter {
    /// Starts the writer thread for `store`.
    pub fn spawn(store: SharedStore) -> Result<Self, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let degraded = Degraded::default();

        let worker_store = store.clone();
        let worker_degraded = degraded.clone();
        thread::Builder::new()
            .name("geotrace-store".into())
            .spawn(move || run_writer(worker_store, rx, worker_degraded))?;

        Ok(Self {
            tx,
            store,
            degraded,
        })
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// True while the most recent write of any kind failed.
    pub fn is_degraded(&self) -> bool {
        !self.degraded.0.lock().is_empty()
    }

    /// Kinds whose most recent write failed, e.g. `"handshake"`.
    pub fn degraded_kinds(&self) -> Vec<&'static str> {
        self.degraded.kinds()
    }

    pub fn save_device_location(&self, location: DeviceLocation) {
        self.submit(StoreOp::DeviceLocation(location));
    }

    pub fn save_bt_loc_token(&self, token: BtLocToken) {
        self.submit(StoreOp::BtLocToken(token));
    }

    pub fn save_handshake(&self, handshake: Handshake) {
        self.submit(StoreOp::Handshake(handshake));
    }

    pub fn purge_older_than(&self, cutoff_ms: u64) {
        self.submit(StoreOp::Purge(cutoff_ms));
    }

    /// Resolves once every write queued before it has been applied.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreOp::Flush(reply))
            .map_err(|_| StoreError::WriterClosed)?;
        rx.await.map_err(|_| StoreError::WriterClosed)?
    }

    fn submit(&self, op: StoreOp) {
        if self.tx.send(op).is_err() {
            log::warn!("Store writer is gone, dropping write");
            self.degraded.mark(WRITER_KIND);
        }
    }
}

fn run_writer(store: SharedStore, mut rx: mpsc::UnboundedReceiver<StoreOp>, degraded: Degraded) {
    let mut failures = FailureLog::new(FAILURE_LOG_INTERVAL);
    let mut fail = |kind: &'static str, error: &StoreError| {
        degraded.mark(kind);
        failures.record(kind, error, Instant::now());
    };

    while let Some(op) = rx.blocking_recv() {
        let kind = op.kind();
        let mut store = store.lock();
        match op {
            StoreOp::DeviceLocation(location) => match store.save_device_location(&location) {
                Ok(()) => degraded.clear(kind),
                Err(e) => fail(kind, &e),
            },
            StoreOp::BtLocToken(token) => match store.save_bt_loc_token(&token) {
                Ok(written) => {
                    log::debug!("Stored {} token rows for {}", written, token.ephid);
                    degraded.clear(kind);
                }
                Err(e) => fail(kind, &e),
            },
            StoreOp::Handshake(handshake) => match store.save_handshake(&handshake) {
                Ok(()) => degraded.clear(kind),
                Err(e) => fail(kind, &e),
            },
            StoreOp::Purge(cutoff_ms) => match store.purge_older_than(cutoff_ms) {
                Ok(stats) => {
                    if stats.total() > 0 {
                        log::info!("Purged {} records older than {}", stats.total(), cutoff_ms);
                    }
                    degraded.clear(kind);
                }
                Err(e) => fail(kind, &e),
            },
            StoreOp::Flush(reply) => {
                let result = store.flush();
                match &result {
                    Ok(()) => degraded.clear(kind),
                    Err(e) => fail(kind, e),
                }
                let _ = reply.send(result);
            }
        }
    }

    log::debug!("Store writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{shared, MemoryStore, Persistence, PurgeStats, StoreCounts};
    use geotrace_primitives::{EphId, TokenRow, EPHID_LENGTH};
    use std::io;

    /// Rejects tokens and handshakes, accepts everything else.
    struct BrokenStore;

    impl Persistence for BrokenStore {
        fn save_device_location(&mut self, _: &DeviceLocation) -> Result<(), StoreError> {
            Ok(())
        }

        fn save_bt_loc_token(&mut self, _: &BtLocToken) -> Result<usize, StoreError> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full").into())
        }

        fn save_handshake(&mut self, _: &Handshake) -> Result<(), StoreError> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full").into())
        }

        fn purge_older_than(&mut self, _: u64) -> Result<PurgeStats, StoreError> {
            Ok(PurgeStats::default())
        }

        fn flush(&mut self) -> Result<(), StoreError> {
            Ok(())
        }

        fn device_locations(&self) -> Vec<DeviceLocation> {
            Vec::new()
        }

        fn token_rows(&self) -> Vec<TokenRow> {
            Vec::new()
        }

        fn handshakes(&self) -> Vec<Handshake> {
            Vec::new()
        }

        fn counts(&self) -> StoreCounts {
            StoreCounts::default()
        }
    }

    /// Store whose first handshake write fails.
    struct FlakyStore {
        fail_next: bool,
    }

    impl Persistence for FlakyStore {
        fn save_device_location(&mut self, _: &DeviceLocation) -> Result<(), StoreError> {
            Ok(())
        }

        fn save_bt_loc_token(&mut self, _: &BtLocToken) -> Result<usize, StoreError> {
            Ok(0)
        }

        fn save_handshake(&mut self, _: &Handshake) -> Result<(), StoreError> {
            if std::mem::take(&mut self.fail_next) {
                return Err(io::Error::new(io::ErrorKind::Other, "busy").into());
            }
            Ok(())
        }

        fn purge_older_than(&mut self, _: u64) -> Result<PurgeStats, StoreError> {
            Ok(PurgeStats::default())
        }

        fn flush(&mut self) -> Result<(), StoreError> {
            Ok(())
        }

        fn device_locations(&self) -> Vec<DeviceLocation> {
            Vec::new()
        }

        fn token_rows(&self) -> Vec<TokenRow> {
            Vec::new()
        }

        fn handshakes(&self) -> Vec<Handshake> {
            Vec::new()
        }

        fn counts(&self) -> StoreCounts {
            StoreCounts::default()
        }
    }

    #[tokio::test]
    async fn flush_orders_after_queued_writes() {
        let writer = StoreWriter::spawn(shared(MemoryStore::new())).unwrap();
        for i in 0..10 {
            writer.save_device_location(DeviceLocation::new(1_000 * i, 47.0, 8.0));
        }
        writer.flush().await.unwrap();
        assert_eq!(writer.store().lock().counts().device_locations, 10);
    }

    fn handshake(time_ms: u64) -> Handshake {
        Handshake {
            ephid: EphId::from_raw([1u8; EPHID_LENGTH]),
            rssi: -50,
            time_ms,
            location: None,
        }
    }

    #[tokio::test]
    async fn failed_write_marks_its_kind_degraded() {
        let writer = StoreWriter::spawn(shared(BrokenStore)).unwrap();
        writer.save_handshake(handshake(1));
        writer.flush().await.unwrap();
        assert!(writer.is_degraded());
        assert_eq!(writer.degraded_kinds(), vec!["handshake"]);
    }

    #[tokio::test]
    async fn other_kinds_succeeding_keep_failure_visible() {
        let writer = StoreWriter::spawn(shared(BrokenStore)).unwrap();
        writer.save_handshake(handshake(1));
        writer.save_device_location(DeviceLocation::new(1, 0.0, 0.0));
        writer.purge_older_than(0);
        writer.flush().await.unwrap();
        assert!(writer.is_degraded());
        assert_eq!(writer.degraded_kinds(), vec!["handshake"]);
    }

    #[tokio::test]
    async fn same_kind_succeeding_clears_failure() {
        let writer = StoreWriter::spawn(shared(FlakyStore { fail_next: true })).unwrap();
        writer.save_handshake(handshake(1));
        writer.flush().await.unwrap();
        assert!(writer.is_degraded());

        writer.save_handshake(handshake(2));
        writer.flush().await.unwrap();
        assert!(!writer.is_degraded());
    }

    #[test]
    fn failure_log_rate_limited_per_kind() {
        let mut log = FailureLog::new(FAILURE_LOG_INTERVAL);
        let error = StoreError::WriterClosed;
        let start = Instant::now();

        log.record("handshake", &error, start);
        log.record("handshake", &error, start + Duration::from_secs(10));
        log.record("bt_loc_token", &error, start + Duration::from_secs(10));
        assert_eq!(log.suppressed.get("handshake"), Some(&1));
        assert_eq!(log.suppressed.get("bt_loc_token"), None);

        log.record("handshake", &error, start + Duration::from_secs(61));
        assert_eq!(log.suppressed.get("handshake"), None);
    }
}
