//! Domain-separated hashing for ephid derivation and exposure-token digests.

use alloc::string::String;
use alloc::vec::Vec;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use sha2::Sha256;

use crate::constants::EPHID_LENGTH;
use crate::types::EphId;

type Blake2b256 = Blake2b<U32>;

// Domain separators for hash functions
pub const DOMAIN_EPHID: &[u8] = b"geotrace:ephid:v1";

/// Hash with domain separation.
#[inline]
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> [u8; 32] {
    let mut input = Vec::with_capacity(domain.len() + data.len());
    input.extend_from_slice(domain);
    input.extend_from_slice(data);
    Blake2b256::digest(&input).into()
}

/// Ephemeral identifier for `epoch_index` under `secret`.
///
/// Stand-in for the SDK crypto module: the first 16 bytes of
/// `H(domain || secret || epoch_index)`.
pub fn derive_ephid(secret: &[u8; 32], epoch_index: u64) -> EphId {
    let mut data = [0u8; 40];
    data[..32].copy_from_slice(secret);
    data[32..].copy_from_slice(&epoch_index.to_le_bytes());
    let digest = hash_with_domain(DOMAIN_EPHID, &data);

    let mut raw = [0u8; EPHID_LENGTH];
    raw.copy_from_slice(&digest[..EPHID_LENGTH]);
    EphId::from_raw(raw)
}

/// Base64 SHA-256 of `ephid || time_bucket (BE) || geohash`.
///
/// This is the string form compared against published exposed-hash sets.
pub fn token_digest(ephid: &EphId, time_bucket: u64, geohash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ephid.as_bytes());
    hasher.update(time_bucket.to_be_bytes());
    hasher.update(geohash.as_bytes());
    STANDARD.encode(hasher.finalize())
}
