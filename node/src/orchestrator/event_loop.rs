use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use geotrace_primitives::{
    retention_cutoff, BtLocToken, DeviceLocation, Epoch, ErrorSet, ErrorState, Handshake, RadioState,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::command::{ExternalEvent, Lifecycle, LoopEvent, TracingCommand, TracingStatus};
use super::Capabilities;
use crate::clock::Clock;
use crate::config::TracingConfig;
use crate::ephid::EphidSource;
use crate::host::{Presence, WakeLease};
use crate::location::GeoContextSampler;
use crate::radio::{Observation, ObservationSink, Radio, Scanner, Transmitter};
use crate::scheduler::{next_client_restart_at, next_server_restart_at, Scheduler, TimerHandle, WakeupKind};
use crate::store::StoreWriter;

pub(super) struct EventLoop {
    clock: Arc<dyn Clock>,
    scheduler: Box<dyn Scheduler>,
    ephids: Arc<dyn EphidSource>,
    radio: Arc<dyn Radio>,
    sampler: GeoContextSampler,
    store: StoreWriter,
    wake_lease: Box<dyn WakeLease>,
    presence: Box<dyn Presence>,
    inbox: mpsc::WeakUnboundedSender<LoopEvent>,
    errors_tx: watch::Sender<ErrorSet>,

    config: TracingConfig,
    lifecycle: Lifecycle,
    listening: bool,
    finishing: bool,
    errors: ErrorSet,
    /// Set when a wakeup could not be armed; the loop stops after the
    /// current event.
    fatal: bool,

    transmitter: Option<Box<dyn Transmitter>>,
    scanner: Option<(u64, Box<dyn Scanner>)>,
    /// Latest start results; together with the host flags below they
    /// decide the radio and permission error kinds.
    transmitter_state: RadioState,
    scanner_state: RadioState,
    radio_powered_off: bool,
    location_permission_missing: bool,
    next_scanner_id: u64,
    window_seq: u64,
    scan_window: Option<JoinHandle<()>>,
    location_generation: u64,
    location_tick: Option<JoinHandle<()>>,
    pending: HashMap<WakeupKind, TimerHandle>,
    current_epoch: Option<Epoch>,
}

impl EventLoop {
    pub(super) fn new(
        capabilities: Capabilities,
        config: TracingConfig,
        inbox: mpsc::WeakUnboundedSender<LoopEvent>,
        errors_tx: watch::Sender<ErrorSet>,
    ) -> Self {
        let config = config.normalized();
        let mut sampler = GeoContextSampler::new(capabilities.location, config.location_interval_ms);
        sampler.configure(config.location_interval_ms, config.stale_fix_factor);

        Self {
            clock: capabilities.clock,
            scheduler: capabilities.scheduler,
            ephids: capabilities.ephids,
            radio: capabilities.radio,
            sampler,
            store: capabilities.store,
            wake_lease: capabilities.wake_lease,
            presence: capabilities.presence,
            inbox,
            errors_tx,
            config,
            lifecycle: Lifecycle::Idle,
            listening: false,
            finishing: false,
            errors: ErrorSet::new(),
            fatal: false,
            transmitter: None,
            scanner: None,
            transmitter_state: RadioState::Ok,
            scanner_state: RadioState::Ok,
            radio_powered_off: false,
            location_permission_missing: false,
            next_scanner_id: 0,
            window_seq: 0,
            scan_window: None,
            location_generation: 0,
            location_tick: None,
            pending: HashMap::new(),
            current_epoch: None,
        }
    }

    pub(super) async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<LoopEvent>) {
        log::info!("Tracing orchestrator ready (radio: {})", self.radio.name());
        let mut shutdown = None;

        while let Some(event) = inbox.recv().await {
            match event {
                LoopEvent::Shutdown { reply } => {
                    shutdown = Some(reply);
                    break;
                }
                LoopEvent::Command { command, reply } => {
                    self.execute(command).await;
                    let _ = reply.send(());
                }
                LoopEvent::External(event) => self.on_external(event),
                LoopEvent::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                LoopEvent::Wakeup(handle) => self.on_wakeup(handle).await,
                LoopEvent::ScanWindowElapsed { window, ends_at } => {
                    self.on_scan_window_elapsed(window, ends_at).await
                }
                LoopEvent::SampleLocation { generation } => self.on_sample_location(generation),
                LoopEvent::Observed {
                    scanner,
                    observation,
                } => self.on_observed(scanner, observation),
            }

            if std::mem::take(&mut self.fatal) {
                log::error!("Wakeup scheduling failed, stopping tracing");
                self.stop().await;
            }
        }

        self.stop().await;
        log::info!("Tracing orchestrator finished");
        if let Some(reply) = shutdown {
            let _ = reply.send(());
        }
    }

    async fn execute(&mut self, command: TracingCommand) {
        log::info!("Tracing command {}", command.action());
        match command {
            TracingCommand::Start(config) => self.start(config).await,
            TracingCommand::RestartClient => {
                self.ensure_running();
                self.restart_client(None).await;
            }
            TracingCommand::RestartServer => {
                self.ensure_running();
                self.restart_server().await;
            }
            TracingCommand::Stop => self.stop().await,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn start(&mut self, config: TracingConfig) {
        self.config = config.normalized();
        self.sampler
            .configure(self.config.location_interval_ms, self.config.stale_fix_factor);

        self.cancel_timers();
        self.cancel_scan_window();
        self.stop_tracking_location();

        self.ensure_running();
        if self.errors.clear_sticky() {
            self.publish_errors();
        }

        let now = self.clock.now_ms();
        self.current_epoch = Some(self.ephids.epoch_at(now));
        self.purge_expired(now);

        self.refresh_presence();
        self.restart_tracking_location();
        self.restart_client(None).await;
        self.restart_server().await;
    }

    fn ensure_running(&mut self) {
        if self.lifecycle == Lifecycle::Running {
            return;
        }
        self.finishing = false;
        self.wake_lease.acquire();
        self.listening = true;
        let text = self.config.presence.render(&self.errors);
        self.presence.show(&text);
        self.lifecycle = Lifecycle::Running;
        log::info!(
            "Tracing running (advertise: {}, receive: {}, scan {}/{} ms)",
            self.config.advertise,
            self.config.receive,
            self.config.scan_duration_ms,
            self.config.scan_interval_ms
        );
    }

    async fn stop(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            log::debug!("Stop ignored, tracing is {:?}", self.lifecycle);
            return;
        }
        log::info!("Stopping tracing");
        self.finishing = true;

        self.scheduler.cancel_all();
        self.pending.clear();
        self.cancel_scan_window();
        self.stop_tracking_location();
        self.stop_client().await;
        self.stop_server().await;
        self.listening = false;

        if let Err(e) = self.store.flush().await {
            log::warn!("Store flush on stop failed: {}", e);
        }
        self.presence.withdraw();
        self.wake_lease.release();
        self.lifecycle = Lifecycle::Stopped;
        log::info!("Tracing stopped");
    }

    fn status(&mut self) -> TracingStatus {
        self.sync_persistence_state();
        let running = self.lifecycle == Lifecycle::Running;
        TracingStatus {
            lifecycle: self.lifecycle,
            advertising: running && self.config.advertise,
            receiving: running && self.config.receive,
            errors: self.errors.clone(),
            counts: Default::default(),
        }
    }

    // =========================================================================
    // Radio
    // =========================================================================

    /// Opens a scan window. `slot_ms` is the grid instant a wakeup was armed
    /// for; the window is measured from it so a late wakeup does not push
    /// the grid.
    async fn restart_client(&mut self, slot_ms: Option<u64>) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        // A fresh advertiser gets a fresh radio address, so peers that cache
        // addresses rediscover us.
        self.start_server().await;

        if self.start_client().await == Some(RadioState::Unsupported) {
            log::error!("Scanning not supported, client restarts suspended");
            return;
        }

        let now = self.clock.now_ms();
        let slot = slot_ms
            .filter(|slot| now.saturating_sub(*slot) < self.config.scan_interval_ms)
            .unwrap_or(now);
        let ends_at = slot.saturating_add(self.config.scan_duration_ms);
        if slot != now {
            log::debug!("Scan slot {} opened {} ms late", slot, now - slot);
        }

        self.cancel_scan_window();
        let window = self.window_seq;
        let remaining = Duration::from_millis(ends_at.saturating_sub(now));
        let inbox = self.inbox.clone();
        self.scan_window = Some(tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(LoopEvent::ScanWindowElapsed { window, ends_at });
            }
        }));
    }

    async fn on_scan_window_elapsed(&mut self, window: u64, ends_at: u64) {
        if window != self.window_seq || self.lifecycle != Lifecycle::Running {
            return;
        }
        self.scan_window = None;
        self.stop_scanning().await;

        let at = next_client_restart_at(ends_at, self.config.scan_interval_ms);
        self.schedule(WakeupKind::RestartClient, at);
    }

    async fn restart_server(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        if self.start_server().await == Some(RadioState::Unsupported) {
            log::error!("Advertising not supported, server restarts suspended");
            return;
        }

        let now = self.clock.now_ms();
        let epoch = self.ephids.epoch_at(now);
        let at = next_server_restart_at(&epoch, now, self.config.calibration);
        self.schedule(WakeupKind::RestartServer, at);
    }

    async fn start_server(&mut self) -> Option<RadioState> {
        self.stop_server().await;
        if !self.config.advertise {
            self.sync_radio_errors();
            return None;
        }

        let now = self.clock.now_ms();
        let ephid = match self.ephids.ephid_at(now) {
            Ok(ephid) => ephid,
            Err(e) => {
                log::warn!("No ephid to advertise at {}: {}", now, e);
                return None;
            }
        };

        let mut transmitter = self.radio.transmitter();
        let state = transmitter.start(ephid).await;
        if state.is_ok() {
            log::info!("Advertising {} via {}", ephid, self.radio.name());
        } else {
            log::warn!("Advertising via {} failed: {:?}", self.radio.name(), state);
        }
        self.transmitter = Some(transmitter);
        self.transmitter_state = state;
        self.sync_radio_errors();
        Some(state)
    }

    async fn stop_server(&mut self) {
        if let Some(mut transmitter) = self.transmitter.take() {
            transmitter.stop().await;
        }
        self.transmitter_state = RadioState::Ok;
    }

    async fn start_client(&mut self) -> Option<RadioState> {
        self.stop_client().await;
        if !self.config.receive {
            self.sync_radio_errors();
            return None;
        }

        self.next_scanner_id += 1;
        let id = self.next_scanner_id;
        let inbox = self.inbox.clone();
        let sink = ObservationSink::new(move |observation| {
            inbox.upgrade().is_some_and(|tx| {
                tx.send(LoopEvent::Observed {
                    scanner: id,
                    observation,
                })
                .is_ok()
            })
        });

        let mut scanner = self.radio.scanner(sink);
        let state = scanner.start().await;
        if state.is_ok() {
            log::info!("Scanning via {}", self.radio.name());
        } else {
            log::warn!("Scanning via {} failed: {:?}", self.radio.name(), state);
        }
        self.scanner = Some((id, scanner));
        self.scanner_state = state;
        self.sync_radio_errors();
        Some(state)
    }

    async fn stop_scanning(&mut self) {
        if let Some((_, scanner)) = self.scanner.as_mut() {
            scanner.stop_scan().await;
        }
    }

    async fn stop_client(&mut self) {
        if let Some((_, mut scanner)) = self.scanner.take() {
            scanner.stop().await;
        }
        self.scanner_state = RadioState::Ok;
    }

    fn on_observed(&mut self, scanner: u64, observation: Observation) {
        let current = self.scanner.as_ref().map(|(id, _)| *id);
        if self.lifecycle != Lifecycle::Running || current != Some(scanner) {
            return;
        }
        let handshake = Handshake {
            ephid: observation.ephid,
            rssi: observation.rssi,
            time_ms: observation.time_ms,
            location: self.sampler.context_for(observation.time_ms),
        };
        log::debug!("Handshake with {} at {} dBm", handshake.ephid, handshake.rssi);
        self.store.save_handshake(handshake);
    }

    // =========================================================================
    // Wakeups
    // =========================================================================

    fn schedule(&mut self, kind: WakeupKind, at_ms: u64) {
        if self.fatal {
            return;
        }
        let armed = match self.scheduler.schedule_at(at_ms, kind) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                log::warn!("Arming {:?} at {} failed: {}, retrying", kind, at_ms, e);
                self.scheduler.schedule_at(at_ms, kind)
            }
        };
        match armed {
            Ok(handle) => {
                log::info!("Next {:?} at {}", kind, at_ms);
                self.pending.insert(kind, handle);
            }
            Err(e) => {
                log::error!("Arming {:?} at {} failed again: {}", kind, at_ms, e);
                self.pending.remove(&kind);
                self.update_error(ErrorState::SchedulerFailure, true);
            }
        }
    }

    async fn on_wakeup(&mut self, handle: TimerHandle) {
        if self.pending.get(&handle.kind) != Some(&handle) {
            log::debug!("Ignoring stale wakeup {:?}", handle);
            return;
        }
        self.pending.remove(&handle.kind);
        if self.lifecycle != Lifecycle::Running {
            return;
        }

        log::debug!("Wakeup {:?} scheduled for {}", handle.kind, handle.at_ms);
        match handle.kind {
            WakeupKind::RestartClient => self.restart_client(Some(handle.at_ms)).await,
            WakeupKind::RestartServer => {
                self.roll_epoch();
                self.restart_server().await;
            }
        }
    }

    fn cancel_timers(&mut self) {
        for (_, handle) in self.pending.drain() {
            self.scheduler.cancel(handle);
        }
    }

    fn cancel_scan_window(&mut self) {
        self.window_seq += 1;
        if let Some(task) = self.scan_window.take() {
            task.abort();
        }
    }

    fn roll_epoch(&mut self) {
        let now = self.clock.now_ms();
        let epoch = self.ephids.epoch_at(now);
        if self.current_epoch == Some(epoch) {
            return;
        }
        log::info!("Epoch starting at {} is current", epoch.start_ms);
        self.current_epoch = Some(epoch);
        self.purge_expired(now);
    }

    fn purge_expired(&mut self, now_ms: u64) {
        let cutoff = retention_cutoff(now_ms, self.config.retention_days);
        log::debug!("Purging records older than {}", cutoff);
        self.store.purge_older_than(cutoff);
    }

    // =========================================================================
    // Location
    // =========================================================================

    fn restart_tracking_location(&mut self) {
        self.stop_tracking_location();
        if self.sampler.start() {
            self.location_permission_missing = false;
            self.arm_location_tick(Duration::ZERO);
        } else {
            log::error!("Location tracking not started");
            self.location_permission_missing = !self.sampler.permission_granted();
        }
        self.sync_radio_errors();
    }

    /// No-op when tracking never started.
    fn stop_tracking_location(&mut self) {
        self.location_generation += 1;
        if let Some(task) = self.location_tick.take() {
            task.abort();
        }
        self.sampler.stop();
    }

    fn arm_location_tick(&mut self, delay: Duration) {
        let generation = self.location_generation;
        let inbox = self.inbox.clone();
        self.location_tick = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(LoopEvent::SampleLocation { generation });
            }
        }));
    }

    fn on_sample_location(&mut self, generation: u64) {
        if generation != self.location_generation
            || self.lifecycle != Lifecycle::Running
            || !self.sampler.is_tracking()
        {
            return;
        }
        let now = self.clock.now_ms();
        if let Some(location) = self.sampler.sample(now) {
            self.on_location_update(location);
        }
        self.sync_persistence_state();
        self.arm_location_tick(Duration::from_millis(self.config.location_interval_ms));
    }

    fn on_location_update(&mut self, location: DeviceLocation) {
        log::debug!("Location update {}", location);
        let ephid = self.ephids.ephid_at(location.time_ms());
        self.store.save_device_location(location.clone());
        match ephid {
            Ok(ephid) => self.store.save_bt_loc_token(BtLocToken::new(ephid, location)),
            Err(e) => log::warn!("No ephid for fix at {}: {}", location.time_ms(), e),
        }
    }

    // =========================================================================
    // Host events and error state
    // =========================================================================

    fn on_external(&mut self, event: ExternalEvent) {
        if !self.listening {
            log::debug!("Ignoring {:?}, tracing is not running", event);
            return;
        }
        match event {
            ExternalEvent::RadioPower(on) => {
                log::warn!("Bluetooth powered {}", if on { "on" } else { "off" });
                self.radio_powered_off = !on;
                if on {
                    // Components re-report on their next restart.
                    for state in [&mut self.transmitter_state, &mut self.scanner_state] {
                        if *state == RadioState::Disabled {
                            *state = RadioState::Ok;
                        }
                    }
                }
                self.sync_radio_errors();
            }
            ExternalEvent::LocationMode(enabled) => {
                log::warn!("Location services {}", if enabled { "enabled" } else { "disabled" });
                self.update_error(ErrorState::LocationDisabled, !enabled);
            }
            ExternalEvent::LocationPermission(granted) => {
                if granted {
                    if !self.sampler.is_tracking() {
                        self.restart_tracking_location();
                    }
                } else {
                    self.stop_tracking_location();
                    self.location_permission_missing = true;
                    self.sync_radio_errors();
                }
            }
            ExternalEvent::ErrorsUpdated => self.refresh_presence(),
        }
    }

    fn sync_persistence_state(&mut self) {
        let degraded = self.store.is_degraded();
        self.update_error(ErrorState::PersistenceFailure, degraded);
    }

    /// Derives the error kinds fed by more than one source from the latest
    /// transmitter and scanner results and the host flags.
    fn sync_radio_errors(&mut self) {
        let faults: Vec<ErrorState> = [self.transmitter_state, self.scanner_state]
            .iter()
            .filter_map(RadioState::error_state)
            .collect();
        if faults.contains(&ErrorState::RadioUnsupported) {
            self.update_error(ErrorState::RadioUnsupported, true);
        }
        let disabled = self.radio_powered_off || faults.contains(&ErrorState::RadioDisabled);
        self.update_error(ErrorState::RadioDisabled, disabled);
        let permission_missing =
            self.location_permission_missing || faults.contains(&ErrorState::PermissionMissing);
        self.update_error(ErrorState::PermissionMissing, permission_missing);
    }

    fn update_error(&mut self, state: ErrorState, present: bool) {
        if present && state.is_fatal() {
            self.fatal = true;
        }
        if self.errors.set(state, present) {
            self.publish_errors();
        }
    }

    fn publish_errors(&mut self) {
        if self.errors.is_empty() {
            log::info!("Tracing errors cleared");
        } else {
            log::warn!("Tracing errors: {}", self.errors.joined());
        }
        self.errors_tx.send_replace(self.errors.clone());
        self.refresh_presence();
    }

    fn refresh_presence(&mut self) {
        if self.finishing || self.lifecycle != Lifecycle::Running {
            return;
        }
        let text = self.config.presence.render(&self.errors);
        self.presence.update(&text);
    }
}
