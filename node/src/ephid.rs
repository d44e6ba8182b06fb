//! Ephemeral-identifier source.

use std::fs;
use std::io;
use std::path::Path;

use geotrace_primitives::{derive_ephid, EphId, Epoch, MILLISECONDS_PER_EPOCH};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

pub const SECRET_KEY_LENGTH: usize = 32;

#[derive(Debug, Error)]
pub enum EphidError {
    #[error("secret key I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("secret key has {0} bytes, expected {SECRET_KEY_LENGTH}")]
    InvalidKeyLength(usize),
    #[error("no ephid available for time {0}")]
    Unavailable(u64),
}

/// Gives the ephid valid at an instant and the epoch an instant belongs to.
pub trait EphidSource: Send + Sync {
    fn epoch_at(&self, time_ms: u64) -> Epoch;

    fn ephid_at(&self, time_ms: u64) -> Result<EphId, EphidError>;
}

/// Ephids derived from a device secret, one per epoch.
pub struct DerivedEphidSource {
    secret: Zeroizing<[u8; SECRET_KEY_LENGTH]>,
    epoch_ms: u64,
}

impl DerivedEphidSource {
    pub fn new(secret: [u8; SECRET_KEY_LENGTH]) -> Self {
        Self::with_epoch(secret, MILLISECONDS_PER_EPOCH)
    }

    pub fn with_epoch(secret: [u8; SECRET_KEY_LENGTH], epoch_ms: u64) -> Self {
        Self {
            secret: Zeroizing::new(secret),
            epoch_ms: epoch_ms.max(1),
        }
    }

    pub fn generate() -> Self {
        let mut secret = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
        OsRng.fill_bytes(&mut secret[..]);
        Self::new(*secret)
    }

    /// Loads the secret from `path`, creating and persisting a fresh one when
    /// the file does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self, EphidError> {
        match fs::read(path) {
            Ok(bytes) => {
                let bytes = Zeroizing::new(bytes);
                let secret: [u8; SECRET_KEY_LENGTH] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| EphidError::InvalidKeyLength(bytes.len()))?;
                log::info!("Loaded ephid secret from {}", path.display());
                Ok(Self::new(secret))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let source = Self::generate();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, &source.secret[..])?;
                log::info!("Generated new ephid secret at {}", path.display());
                Ok(source)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl EphidSource for DerivedEphidSource {
    fn epoch_at(&self, time_ms: u64) -> Epoch {
        Epoch::containing(time_ms, self.epoch_ms)
    }

    fn ephid_at(&self, time_ms: u64) -> Result<EphId, EphidError> {
        Ok(derive_ephid(&self.secret, self.epoch_at(time_ms).index()))
    }
}
