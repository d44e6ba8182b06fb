use geotrace_primitives::{DeviceLocation, DEFAULT_STALE_FIX_FACTOR};

use super::LocationProvider;

/// Turns provider fixes into materialized [`DeviceLocation`]s.
///
/// Fixes older than `stale_factor × interval` are dropped, as are repeats of
/// the fix that was sampled last.
pub struct GeoContextSampler {
    provider: Box<dyn LocationProvider>,
    interval_ms: u64,
    stale_factor: u64,
    tracking: bool,
    latest: Option<DeviceLocation>,
}

impl GeoContextSampler {
    pub fn new(provider: Box<dyn LocationProvider>, interval_ms: u64) -> Self {
        Self {
            provider,
            interval_ms,
            stale_factor: DEFAULT_STALE_FIX_FACTOR,
            tracking: false,
            latest: None,
        }
    }

    pub fn configure(&mut self, interval_ms: u64, stale_factor: u64) {
        self.interval_ms = interval_ms.max(1);
        self.stale_factor = stale_factor.max(1);
    }

    pub fn max_fix_age_ms(&self) -> u64 {
        self.interval_ms.saturating_mul(self.stale_factor)
    }

    pub fn permission_granted(&self) -> bool {
        self.provider.permission_granted()
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// (Re)starts tracking. Returns false without permission.
    pub fn start(&mut self) -> bool {
        self.stop();
        if !self.provider.permission_granted() {
            return false;
        }
        if !self.provider.start_updates() {
            log::warn!("Location provider did not start updates, sampling last known fix only");
        }
        self.tracking = true;
        true
    }

    /// No-op when tracking never started.
    pub fn stop(&mut self) {
        if self.tracking {
            self.provider.stop_updates();
            self.tracking = false;
        }
    }

    /// Samples the provider at `now_ms`.
    pub fn sample(&mut self, now_ms: u64) -> Option<DeviceLocation> {
        if !self.tracking {
            return None;
        }
        let fix = self.provider.last_known_fix()?;

        let age = now_ms.saturating_sub(fix.time_ms);
        if age > self.max_fix_age_ms() {
            log::debug!("Dropping stale fix from {} ({} ms old)", fix.time_ms, age);
            return None;
        }
        if self
            .latest
            .as_ref()
            .is_some_and(|latest| latest.time_ms() == fix.time_ms)
        {
            return None;
        }

        let location =
            DeviceLocation::with_interval(fix.time_ms, fix.latitude, fix.longitude, self.interval_ms)
                .materialized();
        self.latest = Some(location.clone());
        Some(location)
    }

    /// Latest sampled location when it is fresh at `time_ms`.
    pub fn context_for(&self, time_ms: u64) -> Option<DeviceLocation> {
        self.latest
            .as_ref()
            .filter(|latest| time_ms.saturating_sub(latest.time_ms()) <= self.max_fix_age_ms())
            .cloned()
    }
}
