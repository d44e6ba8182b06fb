//! Geohash encoding and the rosette neighborhood around a fix.
//!
//! A single geohash is a rectangular cell, so two devices a few metres apart
//! on opposite sides of a cell edge would never share a hash. The
//! neighborhood encodes the fix plus eight compass points ~11 m away and
//! keeps the distinct cells, which makes `(time bucket, geohash)` equality
//! tolerant to cell boundaries.

use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec::Vec;

use crate::constants::{GEOHASH_LENGTH, HASHES_DELIMITER, ROSETTE};

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Encodes `(latitude, longitude)` as a base32 geohash of `precision` characters.
///
/// Coordinates outside the valid range are clamped to it.
pub fn encode(latitude: f64, longitude: f64, precision: usize) -> String {
    let latitude = latitude.clamp(-90.0, 90.0);
    let longitude = longitude.clamp(-180.0, 180.0);

    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision);
    let mut even_bit = true;
    let mut bits = 0u8;
    let mut index = 0usize;

    while hash.len() < precision {
        let (range, value) = if even_bit {
            (&mut lon_range, longitude)
        } else {
            (&mut lat_range, latitude)
        };
        let mid = (range.0 + range.1) / 2.0;
        index <<= 1;
        if value >= mid {
            index |= 1;
            range.0 = mid;
        } else {
            range.1 = mid;
        }
        even_bit = !even_bit;

        bits += 1;
        if bits == 5 {
            hash.push(BASE32[index] as char);
            bits = 0;
            index = 0;
        }
    }

    hash
}

/// Distinct geohashes covering a fix and its rosette.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct GeohashNeighborhood(BTreeSet<String>);

impl GeohashNeighborhood {
    pub fn around(latitude: f64, longitude: f64) -> Self {
        Self::around_with_precision(latitude, longitude, GEOHASH_LENGTH)
    }

    pub fn around_with_precision(latitude: f64, longitude: f64, precision: usize) -> Self {
        Self(
            ROSETTE
                .iter()
                .map(|(dlat, dlon)| encode(latitude + dlat, longitude + dlon, precision))
                .collect(),
        )
    }

    /// Parses the persisted form produced by [`Self::joined`].
    pub fn parse(joined: &str) -> Self {
        Self(
            joined
                .split(HASHES_DELIMITER)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect(),
        )
    }

    /// Lexicographically ordered, comma-joined persisted form.
    pub fn joined(&self) -> String {
        let hashes: Vec<&str> = self.0.iter().map(String::as_str).collect();
        let mut delimiter = [0u8; 4];
        hashes.join(&*HASHES_DELIMITER.encode_utf8(&mut delimiter))
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.0.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.iter().map(String::as_str)
    }
}
