//! Local matching of stored records against a downloaded exposure batch.
//!
//! A batch carries either or both of the published token digests
//! (`/v1/exposedHashes/...`) and the exposee day keys (`/v1/exposed/...`).
//! Token rows match by digest; handshakes match when their ephid is derived
//! from an exposee key for an epoch of that key's day.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use geotrace_primitives::{
    derive_ephid, EphId, Epoch, Handshake, TokenRow, MILLISECONDS_PER_DAY,
};
use thiserror::Error;

use crate::ephid::SECRET_KEY_LENGTH;
use crate::feed::{self, FeedError, ProtoExposedList};
use crate::store::Persistence;

#[derive(Debug, Error)]
pub enum ExposureError {
    #[error("cannot read {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("exposee key has {0} bytes, expected {SECRET_KEY_LENGTH}")]
    KeyLength(usize),
    #[error("exposee key date {0} is negative")]
    KeyDate(i64),
}

/// Exposed identifiers of one release, in matchable form.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExposureBatch {
    pub token_digests: BTreeSet<String>,
    pub ephids: BTreeSet<EphId>,
}

#[derive(Debug, Default, PartialEq)]
pub struct ExposureReport {
    pub matched_tokens: Vec<TokenRow>,
    pub matched_handshakes: Vec<Handshake>,
}

impl ExposureReport {
    pub fn is_exposed(&self) -> bool {
        !self.matched_tokens.is_empty() || !self.matched_handshakes.is_empty()
    }
}

impl ExposureBatch {
    /// Reads the response bodies saved at `hashes` (JSON) and `list`
    /// (protobuf).
    pub fn load(
        hashes: Option<&Path>,
        list: Option<&Path>,
        epoch_ms: u64,
    ) -> Result<Self, ExposureError> {
        let mut batch = Self::default();
        if let Some(path) = hashes {
            batch.token_digests = feed::decode_hash_set(&read(path)?)?;
        }
        if let Some(path) = list {
            let list = feed::decode_exposed_list(&read(path)?)?;
            batch.ephids = exposed_ephids(&list, epoch_ms)?;
        }
        log::debug!(
            "Exposure batch: {} token digests, {} ephids",
            batch.token_digests.len(),
            batch.ephids.len()
        );
        Ok(batch)
    }

    pub fn check(&self, store: &dyn Persistence) -> ExposureReport {
        ExposureReport {
            matched_tokens: matching_tokens(&store.token_rows(), &self.token_digests),
            matched_handshakes: matching_handshakes(&store.handshakes(), &self.ephids),
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>, ExposureError> {
    fs::read(path).map_err(|source| ExposureError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Every ephid an exposee broadcast on its key date.
pub fn exposed_ephids(
    list: &ProtoExposedList,
    epoch_ms: u64,
) -> Result<BTreeSet<EphId>, ExposureError> {
    let mut ephids = BTreeSet::new();
    for exposee in &list.exposed {
        let key: [u8; SECRET_KEY_LENGTH] = exposee
            .key
            .as_slice()
            .try_into()
            .map_err(|_| ExposureError::KeyLength(exposee.key.len()))?;
        let day_start = u64::try_from(exposee.key_date)
            .map_err(|_| ExposureError::KeyDate(exposee.key_date))?;
        let day_end = day_start.saturating_add(MILLISECONDS_PER_DAY);

        let mut epoch = Epoch::containing(day_start, epoch_ms.max(1));
        while epoch.start_ms < day_end {
            ephids.insert(derive_ephid(&key, epoch.index()));
            epoch = epoch.next();
        }
    }
    Ok(ephids)
}

pub fn matching_tokens(rows: &[TokenRow], exposed: &BTreeSet<String>) -> Vec<TokenRow> {
    if exposed.is_empty() {
        return Vec::new();
    }
    rows.iter()
        .filter(|row| exposed.contains(&row.digest()))
        .cloned()
        .collect()
}

pub fn matching_handshakes(handshakes: &[Handshake], exposed: &BTreeSet<EphId>) -> Vec<Handshake> {
    handshakes
        .iter()
        .filter(|handshake| exposed.contains(&handshake.ephid))
        .cloned()
        .collect()
}
