use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use geotrace_primitives::{derive_ephid, EphId, Epoch, RadioState, MILLISECONDS_PER_EPOCH};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::task::JoinHandle;

use super::{Observation, ObservationSink, Radio, Scanner, Transmitter};
use crate::clock::Clock;

#[derive(Clone, Debug)]
pub struct MockConfig {
    pub peer_count: u32,
    pub rssi_range: (i8, i8),
    pub seed: u64,
    /// Time between simulated advertisement bursts while scanning.
    pub burst_interval_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            peer_count: 15,
            rssi_range: (-90, -40),
            seed: 42,
            burst_interval_ms: 2_000,
        }
    }
}

struct MockPeer {
    secret: [u8; 32],
    base_rssi: i8,
    visibility_probability: f32,
}

impl MockPeer {
    fn ephid_at(&self, time_ms: u64) -> EphId {
        let epoch = Epoch::containing(time_ms, MILLISECONDS_PER_EPOCH);
        derive_ephid(&self.secret, epoch.index())
    }
}

struct PeerPool {
    rng: ChaCha8Rng,
    peers: Vec<MockPeer>,
}

impl PeerPool {
    fn generate(config: &MockConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let (low, high) = if config.rssi_range.0 < config.rssi_range.1 {
            config.rssi_range
        } else {
            (-90, -40)
        };
        let peers = (0..config.peer_count.min(100))
            .map(|_| {
                let mut secret = [0u8; 32];
                rng.fill(&mut secret);
                MockPeer {
                    secret,
                    base_rssi: rng.gen_range(low..high),
                    visibility_probability: rng.gen_range(0.3..1.0),
                }
            })
            .collect();
        Self { rng, peers }
    }

    fn scan(&mut self, now_ms: u64) -> Vec<Observation> {
        let mut observations = Vec::new();
        for peer in &self.peers {
            if self.rng.gen::<f32>() >= peer.visibility_probability {
                continue;
            }
            let jitter = self.rng.gen_range(-10i8..10i8);
            observations.push(Observation {
                ephid: peer.ephid_at(now_ms),
                rssi: peer.base_rssi.saturating_add(jitter),
                time_ms: now_ms,
            });
        }
        observations.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        observations
    }
}

/// Simulated radio with a seeded pool of peers that rotate their ephids
/// every epoch.
pub struct MockRadio {
    clock: Arc<dyn Clock>,
    config: MockConfig,
    pool: Arc<Mutex<PeerPool>>,
}

impl MockRadio {
    pub fn new(clock: Arc<dyn Clock>, config: MockConfig) -> Self {
        let pool = PeerPool::generate(&config);
        log::info!("Mock radio ready - {} peers, seed {}", pool.peers.len(), config.seed);
        Self {
            clock,
            config,
            pool: Arc::new(Mutex::new(pool)),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.pool.lock().peers.len()
    }

    /// One advertisement burst as seen at the current time.
    pub fn scan(&self) -> Vec<Observation> {
        self.pool.lock().scan(self.clock.now_ms())
    }
}

impl Radio for MockRadio {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn transmitter(&self) -> Box<dyn Transmitter> {
        Box::new(MockTransmitter { advertising: None })
    }

    fn scanner(&self, sink: ObservationSink) -> Box<dyn Scanner> {
        Box::new(MockScanner {
            clock: self.clock.clone(),
            pool: self.pool.clone(),
            sink,
            burst_interval: Duration::from_millis(self.config.burst_interval_ms.max(1)),
            task: None,
        })
    }
}

struct MockTransmitter {
    advertising: Option<EphId>,
}

#[async_trait]
impl Transmitter for MockTransmitter {
    async fn start(&mut self, ephid: EphId) -> RadioState {
        log::debug!("Mock advertising {}", ephid);
        self.advertising = Some(ephid);
        RadioState::Ok
    }

    async fn stop(&mut self) {
        if let Some(ephid) = self.advertising.take() {
            log::debug!("Mock advertising of {} stopped", ephid);
        }
    }
}

struct MockScanner {
    clock: Arc<dyn Clock>,
    pool: Arc<Mutex<PeerPool>>,
    sink: ObservationSink,
    burst_interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl MockScanner {
    fn halt(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Scanner for MockScanner {
    async fn start(&mut self) -> RadioState {
        self.halt();
        let clock = self.clock.clone();
        let pool = self.pool.clone();
        let sink = self.sink.clone();
        let burst_interval = self.burst_interval;

        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(burst_interval).await;
                let observations = pool.lock().scan(clock.now_ms());
                log::debug!("Mock scan burst: {} peers", observations.len());
                for observation in observations {
                    if !sink.report(observation) {
                        return;
                    }
                }
            }
        }));
        RadioState::Ok
    }

    async fn stop_scan(&mut self) {
        self.halt();
    }

    async fn stop(&mut self) {
        self.halt();
    }
}

impl Drop for MockScanner {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::AnchoredClock;
    use tokio::sync::mpsc;

    fn radio(base_ms: u64, seed: u64) -> MockRadio {
        let config = MockConfig {
            seed,
            ..MockConfig::default()
        };
        MockRadio::new(Arc::new(AnchoredClock::new(base_ms)), config)
    }

    #[test]
    fn pool_created_from_config() {
        assert_eq!(radio(0, 42).peer_count(), 15);
    }

    #[test]
    fn scan_is_deterministic_and_sorted() {
        let sighted = |radio: MockRadio| -> Vec<(EphId, i8)> {
            radio.scan().iter().map(|o| (o.ephid, o.rssi)).collect()
        };
        let first = sighted(radio(1_600_000_000_000, 42));
        let second = sighted(radio(1_600_000_000_000, 42));
        assert_eq!(first, second);
        assert!(first.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn peers_rotate_ephids_per_epoch() {
        let pool = PeerPool::generate(&MockConfig::default());
        let peer = &pool.peers[0];
        assert_eq!(peer.ephid_at(1_600_000_000_000), peer.ephid_at(1_600_001_999_999));
        assert_ne!(peer.ephid_at(1_600_000_000_000), peer.ephid_at(1_600_002_000_000));
    }

    #[tokio::test(start_paused = true)]
    async fn scanner_reports_until_stopped() {
        let radio = radio(1_600_000_000_000, 42);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scanner = radio.scanner(ObservationSink::new(move |o| tx.send(o).is_ok()));

        assert_eq!(scanner.start().await, RadioState::Ok);
        tokio::time::sleep(Duration::from_millis(4_500)).await;
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert!(seen > 0);

        scanner.stop_scan().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
