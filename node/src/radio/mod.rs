//! Beacon transmitter and scanner capabilities.

pub mod bluetooth;
pub mod mock;

pub use bluetooth::BluetoothRadio;
pub use mock::{MockConfig, MockRadio};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use geotrace_primitives::{EphId, RadioState};

/// A single beacon sighting reported by a scanner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observation {
    pub ephid: EphId,
    pub rssi: i8,
    pub time_ms: u64,
}

/// Where a scanner reports its sightings.
#[derive(Clone)]
pub struct ObservationSink(Arc<dyn Fn(Observation) -> bool + Send + Sync>);

impl ObservationSink {
    pub fn new(report: impl Fn(Observation) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(report))
    }

    /// Returns false once the receiving side is gone.
    pub fn report(&self, observation: Observation) -> bool {
        (self.0)(observation)
    }
}

impl fmt::Debug for ObservationSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ObservationSink")
    }
}

#[async_trait]
pub trait Transmitter: Send {
    /// Starts advertising `ephid`.
    async fn start(&mut self, ephid: EphId) -> RadioState;

    async fn stop(&mut self);
}

#[async_trait]
pub trait Scanner: Send {
    async fn start(&mut self) -> RadioState;

    /// Ends the current scan window; the instance stays usable.
    async fn stop_scan(&mut self);

    async fn stop(&mut self);
}

/// Factory for fresh transmitter and scanner instances.
pub trait Radio: Send + Sync {
    fn name(&self) -> &'static str;

    fn transmitter(&self) -> Box<dyn Transmitter>;

    fn scanner(&self, sink: ObservationSink) -> Box<dyn Scanner>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RadioMode {
    #[default]
    Real,
    Mock,
    Disabled,
}

impl std::str::FromStr for RadioMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "real" | "bluetooth" | "ble" => Ok(Self::Real),
            "mock" => Ok(Self::Mock),
            "disabled" | "off" | "none" => Ok(Self::Disabled),
            _ => Err(format!("Unknown scanner mode: {}", s)),
        }
    }
}

/// Radio for hosts without a usable adapter; every start reports
/// `Unsupported`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullRadio;

struct NullDevice;

#[async_trait]
impl Transmitter for NullDevice {
    async fn start(&mut self, _ephid: EphId) -> RadioState {
        RadioState::Unsupported
    }

    async fn stop(&mut self) {}
}

#[async_trait]
impl Scanner for NullDevice {
    async fn start(&mut self) -> RadioState {
        RadioState::Unsupported
    }

    async fn stop_scan(&mut self) {}

    async fn stop(&mut self) {}
}

impl Radio for NullRadio {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn transmitter(&self) -> Box<dyn Transmitter> {
        Box::new(NullDevice)
    }

    fn scanner(&self, _sink: ObservationSink) -> Box<dyn Scanner> {
        Box::new(NullDevice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotrace_primitives::EPHID_LENGTH;

    #[test]
    fn radio_mode_parses_aliases() {
        assert_eq!("Mock".parse::<RadioMode>(), Ok(RadioMode::Mock));
        assert_eq!("off".parse::<RadioMode>(), Ok(RadioMode::Disabled));
        assert_eq!("ble".parse::<RadioMode>(), Ok(RadioMode::Real));
        assert!("wifi".parse::<RadioMode>().is_err());
    }

    #[tokio::test]
    async fn null_radio_is_unsupported() {
        let radio = NullRadio;
        let mut transmitter = radio.transmitter();
        assert_eq!(
            transmitter.start(EphId::from_raw([0u8; EPHID_LENGTH])).await,
            RadioState::Unsupported
        );
        let mut scanner = radio.scanner(ObservationSink::new(|_| true));
        assert_eq!(scanner.start().await, RadioState::Unsupported);
    }
}
