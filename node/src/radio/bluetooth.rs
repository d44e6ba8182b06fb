use std::sync::Arc;

use async_trait::async_trait;
use geotrace_primitives::{EphId, RadioState};
use thiserror::Error;

use super::{ObservationSink, Radio, Scanner, Transmitter};
use crate::clock::Clock;

#[cfg(feature = "bluetooth")]
use super::Observation;
#[cfg(feature = "bluetooth")]
use btleplug::api::{bleuuid::uuid_from_u16, Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
#[cfg(feature = "bluetooth")]
use btleplug::platform::{Adapter, Manager};
#[cfg(feature = "bluetooth")]
use futures::StreamExt;
#[cfg(feature = "bluetooth")]
use geotrace_primitives::DP3T_SERVICE_UUID16;
#[cfg(feature = "bluetooth")]
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("bluetooth error: {0}")]
    Bluetooth(String),
    #[error("no bluetooth adapter found")]
    AdapterNotFound,
}

/// BLE radio backed by the host adapter.
///
/// Only the central role is available, so the scanner is real while the
/// transmitter reports `Unsupported`.
pub struct BluetoothRadio {
    #[cfg_attr(not(feature = "bluetooth"), allow(dead_code))]
    clock: Arc<dyn Clock>,
    #[cfg(feature = "bluetooth")]
    adapter: Adapter,
}

impl BluetoothRadio {
    pub async fn new(clock: Arc<dyn Clock>) -> Result<Self, RadioError> {
        #[cfg(feature = "bluetooth")]
        {
            let manager = Manager::new()
                .await
                .map_err(|e| RadioError::Bluetooth(e.to_string()))?;
            let adapter = manager
                .adapters()
                .await
                .map_err(|e| RadioError::Bluetooth(e.to_string()))?
                .into_iter()
                .next()
                .ok_or(RadioError::AdapterNotFound)?;
            Ok(Self { clock, adapter })
        }

        #[cfg(not(feature = "bluetooth"))]
        {
            log::warn!("Bluetooth radio unavailable - btleplug feature not enabled");
            Ok(Self { clock })
        }
    }
}

impl Radio for BluetoothRadio {
    fn name(&self) -> &'static str {
        "bluetooth"
    }

    fn transmitter(&self) -> Box<dyn Transmitter> {
        Box::new(CentralOnlyTransmitter)
    }

    fn scanner(&self, sink: ObservationSink) -> Box<dyn Scanner> {
        #[cfg(feature = "bluetooth")]
        {
            Box::new(BluetoothScanner {
                adapter: self.adapter.clone(),
                clock: self.clock.clone(),
                sink,
                task: None,
            })
        }

        #[cfg(not(feature = "bluetooth"))]
        {
            let _ = sink;
            Box::new(UnavailableScanner)
        }
    }
}

struct CentralOnlyTransmitter;

#[async_trait]
impl Transmitter for CentralOnlyTransmitter {
    async fn start(&mut self, _ephid: EphId) -> RadioState {
        log::warn!("Advertising not supported by this adapter");
        RadioState::Unsupported
    }

    async fn stop(&mut self) {}
}

#[cfg(not(feature = "bluetooth"))]
struct UnavailableScanner;

#[cfg(not(feature = "bluetooth"))]
#[async_trait]
impl Scanner for UnavailableScanner {
    async fn start(&mut self) -> RadioState {
        RadioState::Unsupported
    }

    async fn stop_scan(&mut self) {}

    async fn stop(&mut self) {}
}

#[cfg(feature = "bluetooth")]
fn radio_state_of(error: &btleplug::Error) -> RadioState {
    match error {
        btleplug::Error::PermissionDenied => RadioState::PermissionDenied,
        btleplug::Error::NotSupported(_) => RadioState::Unsupported,
        _ => RadioState::Disabled,
    }
}

#[cfg(feature = "bluetooth")]
struct BluetoothScanner {
    adapter: Adapter,
    clock: Arc<dyn Clock>,
    sink: ObservationSink,
    task: Option<JoinHandle<()>>,
}

#[cfg(feature = "bluetooth")]
impl BluetoothScanner {
    fn halt(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(feature = "bluetooth")]
#[async_trait]
impl Scanner for BluetoothScanner {
    async fn start(&mut self) -> RadioState {
        self.halt();
        let service = uuid_from_u16(DP3T_SERVICE_UUID16);

        let mut events = match self.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                log::warn!("Bluetooth event stream unavailable: {}", e);
                return radio_state_of(&e);
            }
        };
        let filter = ScanFilter {
            services: vec![service],
        };
        if let Err(e) = self.adapter.start_scan(filter).await {
            log::warn!("Bluetooth scan failed to start: {}", e);
            return radio_state_of(&e);
        }

        let adapter = self.adapter.clone();
        let clock = self.clock.clone();
        let sink = self.sink.clone();
        self.task = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let CentralEvent::ServiceDataAdvertisement { id, service_data } = event else {
                    continue;
                };
                let Some(ephid) = service_data.get(&service).and_then(|data| EphId::from_slice(data)) else {
                    continue;
                };
                let rssi = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral
                        .properties()
                        .await
                        .ok()
                        .flatten()
                        .and_then(|props| props.rssi)
                        .unwrap_or(-127),
                    Err(_) => -127,
                };
                let observation = Observation {
                    ephid,
                    rssi: rssi.clamp(i8::MIN as i16, i8::MAX as i16) as i8,
                    time_ms: clock.now_ms(),
                };
                if !sink.report(observation) {
                    break;
                }
            }
        }));
        RadioState::Ok
    }

    async fn stop_scan(&mut self) {
        self.halt();
        if let Err(e) = self.adapter.stop_scan().await {
            log::warn!("Bluetooth scan failed to stop: {}", e);
        }
    }

    async fn stop(&mut self) {
        self.stop_scan().await;
    }
}

#[cfg(feature = "bluetooth")]
impl Drop for BluetoothScanner {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotrace_primitives::EPHID_LENGTH;

    #[tokio::test]
    async fn transmitter_is_unsupported() {
        let mut transmitter = CentralOnlyTransmitter;
        assert_eq!(
            transmitter.start(EphId::from_raw([0u8; EPHID_LENGTH])).await,
            RadioState::Unsupported
        );
    }

    #[cfg(not(feature = "bluetooth"))]
    #[tokio::test]
    async fn scanner_unsupported_without_feature() {
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let radio = BluetoothRadio::new(clock).await.unwrap();
        let mut scanner = radio.scanner(ObservationSink::new(|_| true));
        assert_eq!(scanner.start().await, RadioState::Unsupported);
    }
}
