//! Wire formats of the exposed-identifier feed.
//!
//! Only request paths and response decoding live here; fetching is left to
//! the host's HTTP client.

use std::collections::BTreeSet;

use prost::Message;
use thiserror::Error;

pub const ACCEPT_PROTOBUF: &str = "application/x-protobuf";
pub const ACCEPT_JSON: &str = "application/json";

/// Grid on which the backend releases batches.
pub const BATCH_LENGTH_MS: u64 = 2 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("protobuf decode failed: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("json decode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("batch release time {0} is not on the batch grid")]
    UnalignedBatch(u64),
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoExposedList {
    #[prost(int64, tag = "1")]
    pub batch_release_time: i64,
    #[prost(message, repeated, tag = "2")]
    pub exposed: Vec<ProtoExposee>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoExposee {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(int64, tag = "2")]
    pub key_date: i64,
}

pub fn is_batch_aligned(batch_release_time: u64) -> bool {
    batch_release_time % BATCH_LENGTH_MS == 0
}

fn aligned(batch_release_time: u64) -> Result<u64, FeedError> {
    if is_batch_aligned(batch_release_time) {
        Ok(batch_release_time)
    } else {
        Err(FeedError::UnalignedBatch(batch_release_time))
    }
}

/// `GET` path of the binary exposee list; expects [`ACCEPT_PROTOBUF`].
pub fn exposed_path(batch_release_time: u64) -> Result<String, FeedError> {
    Ok(format!("/v1/exposed/{}", aligned(batch_release_time)?))
}

/// `GET` path of the exposed hash set; expects [`ACCEPT_JSON`].
pub fn exposed_hashes_path(batch_release_time: u64) -> Result<String, FeedError> {
    Ok(format!("/v1/exposedHashes/{}", aligned(batch_release_time)?))
}

pub fn test_exposed_hashes_path(count: u32) -> String {
    format!("/v1/testExposedHashes/{count}")
}

pub fn decode_exposed_list(body: &[u8]) -> Result<ProtoExposedList, FeedError> {
    Ok(ProtoExposedList::decode(body)?)
}

/// Decodes a JSON string array with set semantics.
pub fn decode_hash_set(body: &[u8]) -> Result<BTreeSet<String>, FeedError> {
    Ok(serde_json::from_slice(body)?)
}
