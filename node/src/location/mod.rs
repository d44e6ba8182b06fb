//! Device location providers and the geo-context sampler.

pub mod mock;
pub mod sampler;

pub use mock::{MockLocationConfig, MockLocationProvider};
pub use sampler::GeoContextSampler;

use std::sync::Arc;

use crate::clock::Clock;

/// A raw position fix as reported by the platform.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fix {
    pub time_ms: u64,
    pub latitude: f64,
    pub longitude: f64,
}

pub trait LocationProvider: Send {
    fn permission_granted(&self) -> bool;

    /// Requests continuous updates; returns whether updates are running.
    fn start_updates(&mut self) -> bool;

    fn stop_updates(&mut self);

    fn last_known_fix(&mut self) -> Option<Fix>;
}

/// Fixed coordinates, reported with the current time on every request.
pub struct StaticLocationProvider {
    clock: Arc<dyn Clock>,
    latitude: f64,
    longitude: f64,
    running: bool,
}

impl StaticLocationProvider {
    pub fn new(clock: Arc<dyn Clock>, latitude: f64, longitude: f64) -> Self {
        Self {
            clock,
            latitude,
            longitude,
            running: false,
        }
    }
}

impl LocationProvider for StaticLocationProvider {
    fn permission_granted(&self) -> bool {
        true
    }

    fn start_updates(&mut self) -> bool {
        self.running = true;
        true
    }

    fn stop_updates(&mut self) {
        self.running = false;
    }

    fn last_known_fix(&mut self) -> Option<Fix> {
        self.running.then(|| Fix {
            time_ms: self.clock.now_ms(),
            latitude: self.latitude,
            longitude: self.longitude,
        })
    }
}

/// Provider for hosts without positioning; never yields a fix.
#[derive(Default)]
pub struct UnavailableLocationProvider;

impl LocationProvider for UnavailableLocationProvider {
    fn permission_granted(&self) -> bool {
        false
    }

    fn start_updates(&mut self) -> bool {
        false
    }

    fn stop_updates(&mut self) {}

    fn last_known_fix(&mut self) -> Option<Fix> {
        None
    }
}
