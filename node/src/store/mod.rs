//! Append-only persistence of device locations, outbound tokens and
//! handshakes.

pub mod file;
pub mod memory;
pub mod writer;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use writer::StoreWriter;

use std::io;
use std::sync::Arc;

use geotrace_primitives::{BtLocToken, DeviceLocation, Handshake, TokenRow};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt record in {table}: {reason}")]
    Codec { table: &'static str, reason: String },
    #[error("store writer has shut down")]
    WriterClosed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub device_locations: usize,
    pub token_rows: usize,
    pub handshakes: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub device_locations: usize,
    pub token_rows: usize,
    pub handshakes: usize,
}

impl PurgeStats {
    pub fn total(&self) -> usize {
        self.device_locations + self.token_rows + self.handshakes
    }
}

/// Storage back-end. Called only from the writer thread and under the
/// shared lock.
pub trait Persistence: Send {
    fn save_device_location(&mut self, location: &DeviceLocation) -> Result<(), StoreError>;

    /// Persists the token's rows, skipping rows already stored. Returns the
    /// number of rows written.
    fn save_bt_loc_token(&mut self, token: &BtLocToken) -> Result<usize, StoreError>;

    fn save_handshake(&mut self, handshake: &Handshake) -> Result<(), StoreError>;

    /// Removes everything bound to a time before `cutoff_ms`.
    fn purge_older_than(&mut self, cutoff_ms: u64) -> Result<PurgeStats, StoreError>;

    fn flush(&mut self) -> Result<(), StoreError>;

    fn device_locations(&self) -> Vec<DeviceLocation>;

    fn token_rows(&self) -> Vec<TokenRow>;

    fn handshakes(&self) -> Vec<Handshake>;

    fn counts(&self) -> StoreCounts;
}

pub type SharedStore = Arc<Mutex<Box<dyn Persistence>>>;

pub fn shared(store: impl Persistence + 'static) -> SharedStore {
    Arc::new(Mutex::new(Box::new(store)))
}
