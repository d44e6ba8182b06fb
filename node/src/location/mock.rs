use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{Fix, LocationProvider};
use crate::clock::Clock;

#[derive(Clone, Debug)]
pub struct MockLocationConfig {
    pub latitude: f64,
    pub longitude: f64,
    /// Largest per-fix step in degrees.
    pub max_step: f64,
    pub seed: u64,
}

impl Default for MockLocationConfig {
    fn default() -> Self {
        Self {
            latitude: 47.3769,
            longitude: 8.5417,
            max_step: 0.00005,
            seed: 42,
        }
    }
}

/// Seeded random walk around a starting point.
pub struct MockLocationProvider {
    clock: Arc<dyn Clock>,
    rng: ChaCha8Rng,
    config: MockLocationConfig,
    position: (f64, f64),
    running: bool,
}

impl MockLocationProvider {
    pub fn new(clock: Arc<dyn Clock>, config: MockLocationConfig) -> Self {
        Self {
            clock,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            position: (config.latitude, config.longitude),
            config,
            running: false,
        }
    }

    fn step(&mut self) {
        let step = self.config.max_step.abs();
        if step == 0.0 {
            return;
        }
        let dlat = self.rng.gen_range(-step..=step);
        let dlon = self.rng.gen_range(-step..=step);
        self.position.0 = (self.position.0 + dlat).clamp(-90.0, 90.0);
        self.position.1 = (self.position.1 + dlon).clamp(-180.0, 180.0);
    }
}

impl LocationProvider for MockLocationProvider {
    fn permission_granted(&self) -> bool {
        true
    }

    fn start_updates(&mut self) -> bool {
        self.running = true;
        log::info!(
            "Mock location started at ({:.5}, {:.5})",
            self.position.0,
            self.position.1
        );
        true
    }

    fn stop_updates(&mut self) {
        self.running = false;
    }

    fn last_known_fix(&mut self) -> Option<Fix> {
        if !self.running {
            return None;
        }
        self.step();
        Some(Fix {
            time_ms: self.clock.now_ms(),
            latitude: self.position.0,
            longitude: self.position.1,
        })
    }
}
