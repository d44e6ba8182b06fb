//! Counting fakes for orchestrator tests.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use geotrace_primitives::{
    derive_ephid, BtLocToken, DeviceLocation, EphId, Epoch, Handshake, RadioState, TokenRow,
    MILLISECONDS_PER_EPOCH,
};
use parking_lot::Mutex;

use crate::clock::{AnchoredClock, Clock};
use crate::config::TracingConfig;
use crate::ephid::{DerivedEphidSource, EphidError, EphidSource};
use crate::host::{Presence, WakeLease};
use crate::location::{Fix, LocationProvider};
use crate::orchestrator::{self, Capabilities, TracingHandle};
use crate::radio::{Observation, ObservationSink, Radio, Scanner, Transmitter};
use crate::scheduler::{Scheduler, SchedulerError, TimerHandle, TokioScheduler, WakeupKind, WakeupSink};
use crate::store::{
    self, MemoryStore, Persistence, PurgeStats, SharedStore, StoreCounts, StoreError, StoreWriter,
};

// =============================================================================
// Radio
// =============================================================================

#[derive(Debug)]
pub(crate) struct RadioLog {
    pub transmitter_result: RadioState,
    pub scanner_result: RadioState,
    pub transmitter_starts: usize,
    pub transmitter_stops: usize,
    pub scanner_starts: usize,
    pub scanner_stop_scans: usize,
    pub scanner_stops: usize,
    pub active_transmitters: usize,
    pub active_scanners: usize,
    pub max_active_transmitters: usize,
    pub max_active_scanners: usize,
    /// `(time, ephid)` of every advertising start.
    pub advertised: Vec<(u64, EphId)>,
    pub sinks: Vec<ObservationSink>,
}

impl Default for RadioLog {
    fn default() -> Self {
        Self {
            transmitter_result: RadioState::Ok,
            scanner_result: RadioState::Ok,
            transmitter_starts: 0,
            transmitter_stops: 0,
            scanner_starts: 0,
            scanner_stop_scans: 0,
            scanner_stops: 0,
            active_transmitters: 0,
            active_scanners: 0,
            max_active_transmitters: 0,
            max_active_scanners: 0,
            advertised: Vec::new(),
            sinks: Vec::new(),
        }
    }
}

impl RadioLog {
    /// Reports through the newest scanner's sink.
    pub fn report(&self, observation: Observation) -> bool {
        self.sinks.last().is_some_and(|sink| sink.report(observation))
    }
}

pub(crate) struct FakeRadio {
    clock: Arc<dyn Clock>,
    log: Arc<Mutex<RadioLog>>,
}

impl Radio for FakeRadio {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn transmitter(&self) -> Box<dyn Transmitter> {
        let mut log = self.log.lock();
        log.active_transmitters += 1;
        log.max_active_transmitters = log.max_active_transmitters.max(log.active_transmitters);
        Box::new(FakeTransmitter {
            clock: self.clock.clone(),
            log: self.log.clone(),
            live: true,
        })
    }

    fn scanner(&self, sink: ObservationSink) -> Box<dyn Scanner> {
        let mut log = self.log.lock();
        log.sinks.push(sink);
        log.active_scanners += 1;
        log.max_active_scanners = log.max_active_scanners.max(log.active_scanners);
        Box::new(FakeScanner {
            log: self.log.clone(),
            live: true,
        })
    }
}

struct FakeTransmitter {
    clock: Arc<dyn Clock>,
    log: Arc<Mutex<RadioLog>>,
    live: bool,
}

#[async_trait]
impl Transmitter for FakeTransmitter {
    async fn start(&mut self, ephid: EphId) -> RadioState {
        let mut log = self.log.lock();
        log.transmitter_starts += 1;
        log.advertised.push((self.clock.now_ms(), ephid));
        log.transmitter_result
    }

    async fn stop(&mut self) {
        let mut log = self.log.lock();
        log.transmitter_stops += 1;
        if std::mem::take(&mut self.live) {
            log.active_transmitters -= 1;
        }
    }
}

impl Drop for FakeTransmitter {
    fn drop(&mut self) {
        if self.live {
            self.log.lock().active_transmitters -= 1;
        }
    }
}

struct FakeScanner {
    log: Arc<Mutex<RadioLog>>,
    live: bool,
}

#[async_trait]
impl Scanner for FakeScanner {
    async fn start(&mut self) -> RadioState {
        let mut log = self.log.lock();
        log.scanner_starts += 1;
        log.scanner_result
    }

    async fn stop_scan(&mut self) {
        self.log.lock().scanner_stop_scans += 1;
    }

    async fn stop(&mut self) {
        let mut log = self.log.lock();
        log.scanner_stops += 1;
        if std::mem::take(&mut self.live) {
            log.active_scanners -= 1;
        }
    }
}

impl Drop for FakeScanner {
    fn drop(&mut self) {
        if self.live {
            self.log.lock().active_scanners -= 1;
        }
    }
}

// =============================================================================
// Host services
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct LeaseLog {
    pub acquired: usize,
    pub released: usize,
    pub held: bool,
}

struct CountingLease(Arc<Mutex<LeaseLog>>);

impl WakeLease for CountingLease {
    fn acquire(&mut self) {
        let mut log = self.0.lock();
        assert!(!log.held, "wake lease acquired twice");
        log.acquired += 1;
        log.held = true;
    }

    fn release(&mut self) {
        let mut log = self.0.lock();
        assert!(log.held, "wake lease released while not held");
        log.released += 1;
        log.held = false;
    }

    fn is_held(&self) -> bool {
        self.0.lock().held
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PresenceEvent {
    Show(String),
    Update(String),
    Withdraw,
}

struct RecordingPresence(Arc<Mutex<Vec<PresenceEvent>>>);

impl Presence for RecordingPresence {
    fn show(&mut self, text: &str) {
        self.0.lock().push(PresenceEvent::Show(text.to_owned()));
    }

    fn update(&mut self, text: &str) {
        self.0.lock().push(PresenceEvent::Update(text.to_owned()));
    }

    fn withdraw(&mut self) {
        self.0.lock().push(PresenceEvent::Withdraw);
    }
}

// =============================================================================
// Scheduling
// =============================================================================

/// Real scheduler that also records every armed wakeup.
struct RecordingScheduler {
    inner: TokioScheduler,
    armed: Arc<Mutex<Vec<(WakeupKind, u64)>>>,
}

impl Scheduler for RecordingScheduler {
    fn attach(&mut self, sink: Arc<dyn WakeupSink>) {
        self.inner.attach(sink);
    }

    fn schedule_at(&mut self, at_ms: u64, kind: WakeupKind) -> Result<TimerHandle, SchedulerError> {
        let handle = self.inner.schedule_at(at_ms, kind)?;
        self.armed.lock().push((kind, at_ms));
        Ok(handle)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.inner.cancel(handle);
    }

    fn cancel_all(&mut self) {
        self.inner.cancel_all();
    }
}

struct FailingScheduler(Arc<AtomicUsize>);

impl Scheduler for FailingScheduler {
    fn attach(&mut self, _sink: Arc<dyn WakeupSink>) {}

    fn schedule_at(&mut self, _at_ms: u64, _kind: WakeupKind) -> Result<TimerHandle, SchedulerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(SchedulerError::NoRuntime)
    }

    fn cancel(&mut self, _handle: TimerHandle) {}

    fn cancel_all(&mut self) {}
}

// =============================================================================
// Ephids and location
// =============================================================================

/// Ephid source whose epochs start at `origin_ms` instead of the Unix epoch.
pub(crate) struct AnchoredEphidSource {
    secret: [u8; 32],
    origin_ms: u64,
    duration_ms: u64,
}

impl AnchoredEphidSource {
    pub fn new(origin_ms: u64) -> Self {
        Self {
            secret: [9u8; 32],
            origin_ms,
            duration_ms: MILLISECONDS_PER_EPOCH,
        }
    }
}

impl EphidSource for AnchoredEphidSource {
    fn epoch_at(&self, time_ms: u64) -> Epoch {
        let start_ms = if time_ms >= self.origin_ms {
            self.origin_ms + (time_ms - self.origin_ms) / self.duration_ms * self.duration_ms
        } else {
            let behind = (self.origin_ms - time_ms).div_ceil(self.duration_ms);
            self.origin_ms - behind * self.duration_ms
        };
        Epoch {
            start_ms,
            duration_ms: self.duration_ms,
        }
    }

    fn ephid_at(&self, time_ms: u64) -> Result<EphId, EphidError> {
        if time_ms < self.origin_ms {
            return Err(EphidError::Unavailable(time_ms));
        }
        let index = (time_ms - self.origin_ms) / self.duration_ms;
        Ok(derive_ephid(&self.secret, index))
    }
}

/// Provider reporting a fresh fix at the current time while updates run.
struct SwitchableLocation {
    clock: Arc<dyn Clock>,
    permission: Arc<AtomicBool>,
    running: bool,
}

impl LocationProvider for SwitchableLocation {
    fn permission_granted(&self) -> bool {
        self.permission.load(Ordering::SeqCst)
    }

    fn start_updates(&mut self) -> bool {
        self.running = true;
        true
    }

    fn stop_updates(&mut self) {
        self.running = false;
    }

    fn last_known_fix(&mut self) -> Option<Fix> {
        (self.running && self.permission_granted()).then(|| Fix {
            time_ms: self.clock.now_ms(),
            latitude: 47.3769,
            longitude: 8.5417,
        })
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Memory store that refuses every handshake write.
#[derive(Default)]
pub(crate) struct HandshakeRejectingStore(MemoryStore);

impl Persistence for HandshakeRejectingStore {
    fn save_device_location(&mut self, location: &DeviceLocation) -> Result<(), StoreError> {
        self.0.save_device_location(location)
    }

    fn save_bt_loc_token(&mut self, token: &BtLocToken) -> Result<usize, StoreError> {
        self.0.save_bt_loc_token(token)
    }

    fn save_handshake(&mut self, _handshake: &Handshake) -> Result<(), StoreError> {
        Err(io::Error::new(io::ErrorKind::Other, "read-only medium").into())
    }

    fn purge_older_than(&mut self, cutoff_ms: u64) -> Result<PurgeStats, StoreError> {
        self.0.purge_older_than(cutoff_ms)
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.0.flush()
    }

    fn device_locations(&self) -> Vec<DeviceLocation> {
        self.0.device_locations()
    }

    fn token_rows(&self) -> Vec<TokenRow> {
        self.0.token_rows()
    }

    fn handshakes(&self) -> Vec<Handshake> {
        self.0.handshakes()
    }

    fn counts(&self) -> StoreCounts {
        self.0.counts()
    }
}

// =============================================================================
// Harness
// =============================================================================

pub(crate) fn config(scan_interval_ms: u64, scan_duration_ms: u64) -> TracingConfig {
    TracingConfig {
        scan_interval_ms,
        scan_duration_ms,
        ..TracingConfig::default()
    }
}

pub(crate) struct Harness {
    pub handle: TracingHandle,
    pub clock: Arc<AnchoredClock>,
    pub ephids: Arc<dyn EphidSource>,
    pub radio: Arc<Mutex<RadioLog>>,
    pub lease: Arc<Mutex<LeaseLog>>,
    pub presence: Arc<Mutex<Vec<PresenceEvent>>>,
    pub armed: Arc<Mutex<Vec<(WakeupKind, u64)>>>,
    pub schedule_attempts: Arc<AtomicUsize>,
    pub permission: Arc<AtomicBool>,
    pub store: StoreWriter,
}

impl Harness {
    pub fn builder(base_ms: u64) -> HarnessBuilder {
        HarnessBuilder {
            base_ms,
            ephids: None,
            failing_scheduler: false,
            radio: RadioLog::default(),
            permission: true,
            store: None,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn armed(&self, kind: WakeupKind) -> Vec<u64> {
        self.armed
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn last_presence(&self) -> Option<PresenceEvent> {
        self.presence.lock().last().cloned()
    }
}

pub(crate) struct HarnessBuilder {
    base_ms: u64,
    ephids: Option<Arc<dyn EphidSource>>,
    failing_scheduler: bool,
    radio: RadioLog,
    permission: bool,
    store: Option<SharedStore>,
}

impl HarnessBuilder {
    pub fn store(mut self, store: impl Persistence + 'static) -> Self {
        self.store = Some(store::shared(store));
        self
    }

    pub fn ephids(mut self, ephids: Arc<dyn EphidSource>) -> Self {
        self.ephids = Some(ephids);
        self
    }

    pub fn failing_scheduler(mut self) -> Self {
        self.failing_scheduler = true;
        self
    }

    pub fn transmitter_result(mut self, state: RadioState) -> Self {
        self.radio.transmitter_result = state;
        self
    }

    pub fn scanner_result(mut self, state: RadioState) -> Self {
        self.radio.scanner_result = state;
        self
    }

    pub fn permission(mut self, granted: bool) -> Self {
        self.permission = granted;
        self
    }

    /// Spawns the loop; must run inside a (paused) tokio runtime.
    pub fn spawn(self) -> Harness {
        let clock = Arc::new(AnchoredClock::new(self.base_ms));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let ephids = self
            .ephids
            .unwrap_or_else(|| Arc::new(DerivedEphidSource::new([7u8; 32])));
        let radio = Arc::new(Mutex::new(self.radio));
        let lease = Arc::new(Mutex::new(LeaseLog::default()));
        let presence = Arc::new(Mutex::new(Vec::new()));
        let armed = Arc::new(Mutex::new(Vec::new()));
        let schedule_attempts = Arc::new(AtomicUsize::new(0));
        let permission = Arc::new(AtomicBool::new(self.permission));
        let store = StoreWriter::spawn(
            self.store
                .unwrap_or_else(|| store::shared(MemoryStore::new())),
        )
        .unwrap();

        let scheduler: Box<dyn Scheduler> = if self.failing_scheduler {
            Box::new(FailingScheduler(schedule_attempts.clone()))
        } else {
            Box::new(RecordingScheduler {
                inner: TokioScheduler::new(dyn_clock.clone()),
                armed: armed.clone(),
            })
        };

        let capabilities = Capabilities {
            clock: dyn_clock.clone(),
            scheduler,
            ephids: ephids.clone(),
            radio: Arc::new(FakeRadio {
                clock: dyn_clock.clone(),
                log: radio.clone(),
            }),
            location: Box::new(SwitchableLocation {
                clock: dyn_clock,
                permission: permission.clone(),
                running: false,
            }),
            store: store.clone(),
            wake_lease: Box::new(CountingLease(lease.clone())),
            presence: Box::new(RecordingPresence(presence.clone())),
        };
        let handle = orchestrator::spawn(capabilities, TracingConfig::default());

        Harness {
            handle,
            clock,
            ephids,
            radio,
            lease,
            presence,
            armed,
            schedule_attempts,
            permission,
            store,
        }
    }
}
