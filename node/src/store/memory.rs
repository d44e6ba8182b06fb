use std::collections::HashSet;

use geotrace_primitives::{BtLocToken, DeviceLocation, Handshake, RetentionBound, TokenRow};

use super::{Persistence, PurgeStats, StoreCounts, StoreError};

/// In-memory tables; also the read index behind [`super::FileStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    locations: Vec<DeviceLocation>,
    tokens: Vec<TokenRow>,
    token_index: HashSet<TokenRow>,
    handshakes: Vec<Handshake>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_location(&mut self, location: DeviceLocation) {
        self.locations.push(location);
    }

    /// Returns false for a duplicate row.
    pub(crate) fn push_token_row(&mut self, row: TokenRow) -> bool {
        if !self.token_index.insert(row.clone()) {
            return false;
        }
        self.tokens.push(row);
        true
    }

    pub(crate) fn push_handshake(&mut self, handshake: Handshake) {
        self.handshakes.push(handshake);
    }

    /// Rows of `token` not stored yet, in insertion order.
    pub(crate) fn new_rows(&self, token: &BtLocToken) -> Vec<TokenRow> {
        let mut seen = HashSet::new();
        token
            .rows()
            .into_iter()
            .filter(|row| !self.token_index.contains(row) && seen.insert(row.clone()))
            .collect()
    }

    pub(crate) fn locations_ref(&self) -> &[DeviceLocation] {
        &self.locations
    }

    pub(crate) fn tokens_ref(&self) -> &[TokenRow] {
        &self.tokens
    }

    pub(crate) fn handshakes_ref(&self) -> &[Handshake] {
        &self.handshakes
    }

    pub(crate) fn purge(&mut self, cutoff_ms: u64) -> PurgeStats {
        let before = self.counts();

        self.locations.retain(|l| l.retained_at(cutoff_ms));
        self.tokens.retain(|row| row.retained_at(cutoff_ms));
        self.token_index.retain(|row| row.retained_at(cutoff_ms));
        self.handshakes.retain(|h| h.retained_at(cutoff_ms));

        let after = self.counts();
        PurgeStats {
            device_locations: before.device_locations - after.device_locations,
            token_rows: before.token_rows - after.token_rows,
            handshakes: before.handshakes - after.handshakes,
        }
    }
}

impl Persistence for MemoryStore {
    fn save_device_location(&mut self, location: &DeviceLocation) -> Result<(), StoreError> {
        self.push_location(location.clone());
        Ok(())
    }

    fn save_bt_loc_token(&mut self, token: &BtLocToken) -> Result<usize, StoreError> {
        Ok(token
            .rows()
            .into_iter()
            .filter(|row| self.push_token_row(row.clone()))
            .count())
    }

    fn save_handshake(&mut self, handshake: &Handshake) -> Result<(), StoreError> {
        self.push_handshake(handshake.clone());
        Ok(())
    }

    fn purge_older_than(&mut self, cutoff_ms: u64) -> Result<PurgeStats, StoreError> {
        Ok(self.purge(cutoff_ms))
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn device_locations(&self) -> Vec<DeviceLocation> {
        self.locations.clone()
    }

    fn token_rows(&self) -> Vec<TokenRow> {
        self.tokens.clone()
    }

    fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.clone()
    }

    fn counts(&self) -> StoreCounts {
        StoreCounts {
            device_locations: self.locations.len(),
            token_rows: self.tokens.len(),
            handshakes: self.handshakes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotrace_primitives::{EphId, EPHID_LENGTH};

    fn token(time_ms: u64) -> BtLocToken {
        BtLocToken::new(
            EphId::from_raw([1u8; EPHID_LENGTH]),
            DeviceLocation::new(time_ms, 47.3769, 8.5417),
        )
    }

    #[test]
    fn duplicate_token_rows_skipped() {
        let mut store = MemoryStore::new();
        assert_eq!(store.save_bt_loc_token(&token(1_600_000_012_345)).unwrap(), 6);
        // Same slots, same hashes: nothing new.
        assert_eq!(store.save_bt_loc_token(&token(1_600_000_013_000)).unwrap(), 0);
        // Next slot: only the later bucket is new.
        assert_eq!(store.save_bt_loc_token(&token(1_600_000_022_345)).unwrap(), 3);
        assert_eq!(store.counts().token_rows, 9);
    }

    #[test]
    fn purge_drops_old_rows() {
        let mut store = MemoryStore::new();
        store.save_device_location(&DeviceLocation::new(1_000, 0.0, 0.0)).unwrap();
        store.save_device_location(&DeviceLocation::new(90_000, 0.0, 0.0)).unwrap();
        store.save_bt_loc_token(&token(90_000)).unwrap();
        store
            .save_handshake(&Handshake {
                ephid: EphId::from_raw([2u8; EPHID_LENGTH]),
                rssi: -60,
                time_ms: 2_000,
                location: None,
            })
            .unwrap();

        let stats = store.purge_older_than(50_000).unwrap();
        assert_eq!(stats.device_locations, 1);
        assert_eq!(stats.handshakes, 1);
        assert_eq!(stats.token_rows, 0);
        assert_eq!(store.counts().device_locations, 1);
        assert_eq!(store.counts().token_rows, 6);
    }
}
