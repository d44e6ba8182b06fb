//! Core domain types for ephemeral identifiers and spatio-temporal context.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parity_scale_codec::{Decode, Encode, MaxEncodedLen};

use crate::constants::{DEFAULT_LOCATION_INTERVAL_MS, EPHID_LENGTH};
use crate::crypto::token_digest;
use crate::errors::ErrorState;
use crate::geohash::GeohashNeighborhood;
use crate::traits::RetentionBound;

// =============================================================================
// Identity Types
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, MaxEncodedLen, Default)]
pub struct EphId(pub [u8; EPHID_LENGTH]);

impl EphId {
    pub const fn from_raw(bytes: [u8; EPHID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Takes the leading `EPHID_LENGTH` bytes; `None` when the slice is shorter.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let head = bytes.get(..EPHID_LENGTH)?;
        let mut raw = [0u8; EPHID_LENGTH];
        raw.copy_from_slice(head);
        Some(Self(raw))
    }

    pub const fn as_bytes(&self) -> &[u8; EPHID_LENGTH] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl From<[u8; EPHID_LENGTH]> for EphId {
    fn from(bytes: [u8; EPHID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for EphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EphId({})", self.to_base64())
    }
}

impl fmt::Display for EphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

// =============================================================================
// Epoch
// =============================================================================

/// Fixed-duration slice of absolute time during which one ephid is valid.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Encode, Decode, MaxEncodedLen)]
pub struct Epoch {
    pub start_ms: u64,
    pub duration_ms: u64,
}

impl Epoch {
    /// Epoch on the absolute grid of `duration_ms` that contains `time_ms`.
    pub const fn containing(time_ms: u64, duration_ms: u64) -> Self {
        let start_ms = if duration_ms == 0 {
            time_ms
        } else {
            time_ms / duration_ms * duration_ms
        };
        Self {
            start_ms,
            duration_ms,
        }
    }

    pub const fn index(&self) -> u64 {
        if self.duration_ms == 0 {
            return self.start_ms;
        }
        self.start_ms / self.duration_ms
    }

    /// Exclusive end, which is also the start of the next epoch.
    pub const fn end_ms(&self) -> u64 {
        self.start_ms.saturating_add(self.duration_ms)
    }

    pub const fn contains(&self, time_ms: u64) -> bool {
        time_ms >= self.start_ms && time_ms < self.end_ms()
    }

    pub const fn next(&self) -> Self {
        Self {
            start_ms: self.end_ms(),
            duration_ms: self.duration_ms,
        }
    }
}

// =============================================================================
// Time Window
// =============================================================================

/// Pair of interval-aligned time buckets a fix is bound to.
///
/// `early = floor((t - i/2) / i) * i`, `late = floor((t + i/2) / i) * i`.
/// A fix near a slot boundary lands in both neighboring slots, which absorbs
/// clock skew between devices. The fix always lies in
/// `[early, late + interval)`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Encode, Decode, MaxEncodedLen)]
pub struct TimeWindow {
    pub early: u64,
    pub late: u64,
}

impl TimeWindow {
    pub const fn of(time_ms: u64, interval_ms: u64) -> Self {
        if interval_ms == 0 {
            return Self {
                early: time_ms,
                late: time_ms,
            };
        }
        let half = interval_ms / 2;
        Self {
            early: time_ms.saturating_sub(half) / interval_ms * interval_ms,
            late: time_ms.saturating_add(half) / interval_ms * interval_ms,
        }
    }

    /// Distinct bucket starts, early first.
    pub fn buckets(&self) -> Vec<u64> {
        if self.early == self.late {
            alloc::vec![self.early]
        } else {
            alloc::vec![self.early, self.late]
        }
    }
}

// =============================================================================
// Device Location
// =============================================================================

/// A timestamped device fix, immutable once constructed.
#[derive(Clone, PartialEq, Debug)]
pub struct DeviceLocation {
    time_ms: u64,
    latitude: f64,
    longitude: f64,
    interval_ms: u64,
    hashes: Option<String>,
}

impl DeviceLocation {
    pub fn new(time_ms: u64, latitude: f64, longitude: f64) -> Self {
        Self::with_interval(time_ms, latitude, longitude, DEFAULT_LOCATION_INTERVAL_MS)
    }

    pub fn with_interval(time_ms: u64, latitude: f64, longitude: f64, interval_ms: u64) -> Self {
        Self {
            time_ms,
            latitude,
            longitude,
            interval_ms,
            hashes: None,
        }
    }

    /// Returns a copy carrying the joined neighborhood in `hashes`.
    pub fn materialized(mut self) -> Self {
        self.hashes = Some(self.location_hashes().joined());
        self
    }

    pub const fn time_ms(&self) -> u64 {
        self.time_ms
    }

    pub const fn latitude(&self) -> f64 {
        self.latitude
    }

    pub const fn longitude(&self) -> f64 {
        self.longitude
    }

    pub const fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn hashes(&self) -> Option<&str> {
        self.hashes.as_deref()
    }

    pub const fn time_window(&self) -> TimeWindow {
        TimeWindow::of(self.time_ms, self.interval_ms)
    }

    /// Recomputes the neighborhood from the coordinates.
    pub fn location_hashes(&self) -> GeohashNeighborhood {
        GeohashNeighborhood::around(self.latitude, self.longitude)
    }

    pub fn to_record(&self) -> StoredLocation {
        StoredLocation {
            time_ms: self.time_ms,
            latitude_bits: self.latitude.to_bits(),
            longitude_bits: self.longitude.to_bits(),
            interval_ms: self.interval_ms,
            hashes: self.hashes.clone(),
        }
    }

    pub fn from_record(record: StoredLocation) -> Self {
        Self {
            time_ms: record.time_ms,
            latitude: f64::from_bits(record.latitude_bits),
            longitude: f64::from_bits(record.longitude_bits),
            interval_ms: record.interval_ms,
            hashes: record.hashes,
        }
    }
}

impl RetentionBound for DeviceLocation {
    fn bound_time_ms(&self) -> u64 {
        self.time_ms
    }
}

impl fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "time={} lat={} lon={} hashes={}",
            self.time_ms,
            self.latitude,
            self.longitude,
            self.hashes.as_deref().unwrap_or("-")
        )
    }
}

// =============================================================================
// Outbound / Inbound Tokens
// =============================================================================

/// Own ephid bound to the device context it was broadcast in.
#[derive(Clone, PartialEq, Debug)]
pub struct BtLocToken {
    pub ephid: EphId,
    pub location: DeviceLocation,
}

impl BtLocToken {
    pub const fn new(ephid: EphId, location: DeviceLocation) -> Self {
        Self { ephid, location }
    }

    /// Persisted form: every neighborhood geohash crossed with both buckets.
    pub fn rows(&self) -> Vec<TokenRow> {
        let buckets = self.location.time_window().buckets();
        let hood = self.location.location_hashes();
        let mut rows = Vec::with_capacity(buckets.len() * hood.len());
        for bucket in &buckets {
            for geohash in hood.iter() {
                rows.push(TokenRow {
                    ephid: self.ephid,
                    time_bucket: *bucket,
                    geohash: String::from(geohash),
                });
            }
        }
        rows
    }
}


/// One `(ephid, time bucket, geohash)` triple of an outbound token.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Encode, Decode)]
pub struct TokenRow {
    pub ephid: EphId,
    pub time_bucket: u64,
    pub geohash: String,
}

impl TokenRow {
    /// String form compared against published exposed-hash sets.
    pub fn digest(&self) -> String {
        token_digest(&self.ephid, self.time_bucket, &self.geohash)
    }
}

impl RetentionBound for TokenRow {
    fn bound_time_ms(&self) -> u64 {
        self.time_bucket
    }
}

/// A received beacon observation.
#[derive(Clone, PartialEq, Debug)]
pub struct Handshake {
    pub ephid: EphId,
    pub rssi: i8,
    pub time_ms: u64,
    pub location: Option<DeviceLocation>,
}

impl Handshake {
    pub fn to_record(&self) -> StoredHandshake {
        StoredHandshake {
            ephid: self.ephid,
            rssi: self.rssi,
            time_ms: self.time_ms,
            location: self.location.as_ref().map(DeviceLocation::to_record),
        }
    }

    pub fn from_record(record: StoredHandshake) -> Self {
        Self {
            ephid: record.ephid,
            rssi: record.rssi,
            time_ms: record.time_ms,
            location: record.location.map(DeviceLocation::from_record),
        }
    }
}

impl RetentionBound for Handshake {
    fn bound_time_ms(&self) -> u64 {
        self.time_ms
    }
}

// =============================================================================
// Persisted Records
// =============================================================================

/// SCALE form of a [`DeviceLocation`]; coordinates keep their exact bits.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct StoredLocation {
    pub time_ms: u64,
    pub latitude_bits: u64,
    pub longitude_bits: u64,
    pub interval_ms: u64,
    pub hashes: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct StoredHandshake {
    pub ephid: EphId,
    pub rssi: i8,
    pub time_ms: u64,
    pub location: Option<StoredLocation>,
}

// =============================================================================
// Radio State
// =============================================================================

/// Outcome of starting a transmitter or scanner.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Encode, Decode, Default)]
pub enum RadioState {
    #[default]
    Ok,
    Disabled,
    Unsupported,
    PermissionDenied,
}

impl RadioState {
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub const fn error_state(&self) -> Option<ErrorState> {
        match self {
            Self::Ok => None,
            Self::Disabled => Some(ErrorState::RadioDisabled),
            Self::Unsupported => Some(ErrorState::RadioUnsupported),
            Self::PermissionDenied => Some(ErrorState::PermissionMissing),
        }
    }
}
