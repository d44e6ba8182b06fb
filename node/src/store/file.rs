//! File-backed store: one append-only log per table.
//!
//! Each record is a little-endian `u32` length followed by the SCALE body.
//! Logs are replayed into a [`MemoryStore`] on open; a purge rewrites every
//! log from the retained rows.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use geotrace_primitives::{
    BtLocToken, DeviceLocation, Handshake, StoredHandshake, StoredLocation, TokenRow,
};
use parity_scale_codec::{Decode, Encode};

use super::memory::MemoryStore;
use super::{Persistence, PurgeStats, StoreCounts, StoreError};

pub const DEVICE_LOCATIONS_LOG: &str = "device_locations.log";
pub const BT_LOC_TOKENS_LOG: &str = "bt_loc_tokens.log";
pub const HANDSHAKES_LOG: &str = "handshakes.log";

struct Table {
    name: &'static str,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Table {
    fn open(dir: &Path, name: &'static str) -> Result<Self, StoreError> {
        let path = dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            name,
            path,
            writer: BufWriter::new(file),
        })
    }

    fn append<T: Encode>(&mut self, record: &T) -> Result<(), StoreError> {
        write_record(&mut self.writer, record)
    }

    /// Replaces the log with `records`.
    fn rewrite<T: Encode>(&mut self, records: impl Iterator<Item = T>) -> Result<(), StoreError> {
        self.writer.flush()?;
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for record in records {
                write_record(&mut out, &record)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    fn replay<T: Decode>(&self) -> Result<Vec<T>, StoreError> {
        let bytes = fs::read(&self.path)?;
        let mut records = Vec::new();
        let mut cursor = 0usize;
        while cursor < bytes.len() {
            let Some(header) = bytes.get(cursor..cursor + 4) else {
                log::warn!("{}: ignoring torn record header at offset {}", self.name, cursor);
                break;
            };
            let mut len = [0u8; 4];
            len.copy_from_slice(header);
            let len = u32::from_le_bytes(len) as usize;
            let start = cursor + 4;
            let Some(mut body) = bytes.get(start..start + len) else {
                log::warn!("{}: ignoring torn record at offset {}", self.name, cursor);
                break;
            };
            let record = T::decode(&mut body).map_err(|e| StoreError::Codec {
                table: self.name,
                reason: e.to_string(),
            })?;
            records.push(record);
            cursor = start + len;
        }
        Ok(records)
    }
}

fn write_record<T: Encode>(out: &mut impl Write, record: &T) -> Result<(), StoreError> {
    let body = record.encode();
    let len = u32::try_from(body.len()).map_err(|_| StoreError::Codec {
        table: "record",
        reason: format!("record of {} bytes too large", body.len()),
    })?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&body)?;
    Ok(())
}

pub struct FileStore {
    dir: PathBuf,
    index: MemoryStore,
    locations: Table,
    tokens: Table,
    handshakes: Table,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let locations = Table::open(&dir, DEVICE_LOCATIONS_LOG)?;
        let tokens = Table::open(&dir, BT_LOC_TOKENS_LOG)?;
        let handshakes = Table::open(&dir, HANDSHAKES_LOG)?;

        let mut index = MemoryStore::new();
        for record in locations.replay::<StoredLocation>()? {
            index.push_location(DeviceLocation::from_record(record));
        }
        for row in tokens.replay::<TokenRow>()? {
            index.push_token_row(row);
        }
        for record in handshakes.replay::<StoredHandshake>()? {
            index.push_handshake(Handshake::from_record(record));
        }

        let counts = index.counts();
        log::info!(
            "Opened store at {}: {} locations, {} token rows, {} handshakes",
            dir.display(),
            counts.device_locations,
            counts.token_rows,
            counts.handshakes
        );

        Ok(Self {
            dir,
            index,
            locations,
            tokens,
            handshakes,
        })
    }
}

impl Persistence for FileStore {
    fn save_device_location(&mut self, location: &DeviceLocation) -> Result<(), StoreError> {
        self.locations.append(&location.to_record())?;
        self.index.push_location(location.clone());
        Ok(())
    }

    fn save_bt_loc_token(&mut self, token: &BtLocToken) -> Result<usize, StoreError> {
        let rows = self.index.new_rows(token);
        for row in &rows {
            self.tokens.append(row)?;
            self.index.push_token_row(row.clone());
        }
        Ok(rows.len())
    }

    fn save_handshake(&mut self, handshake: &Handshake) -> Result<(), StoreError> {
        self.handshakes.append(&handshake.to_record())?;
        self.index.push_handshake(handshake.clone());
        Ok(())
    }

    /// The index only changes once every affected log has been rewritten.
    fn purge_older_than(&mut self, cutoff_ms: u64) -> Result<PurgeStats, StoreError> {
        let mut retained = self.index.clone();
        let stats = retained.purge(cutoff_ms);
        if stats.device_locations > 0 {
            self.locations
                .rewrite(retained.locations_ref().iter().map(DeviceLocation::to_record))?;
        }
        if stats.token_rows > 0 {
            self.tokens.rewrite(retained.tokens_ref().iter())?;
        }
        if stats.handshakes > 0 {
            self.handshakes
                .rewrite(retained.handshakes_ref().iter().map(Handshake::to_record))?;
        }
        self.index = retained;
        Ok(stats)
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.locations.writer.flush()?;
        self.tokens.writer.flush()?;
        self.handshakes.writer.flush()?;
        Ok(())
    }

    fn device_locations(&self) -> Vec<DeviceLocation> {
        self.index.device_locations()
    }

    fn token_rows(&self) -> Vec<TokenRow> {
        self.index.token_rows()
    }

    fn handshakes(&self) -> Vec<Handshake> {
        self.index.handshakes()
    }

    fn counts(&self) -> StoreCounts {
        self.index.counts()
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Err(e) = Persistence::flush(self) {
            log::warn!("Failed to flush store at {}: {}", self.dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotrace_primitives::{EphId, GeohashNeighborhood, EPHID_LENGTH};

    fn handshake(time_ms: u64, location: Option<DeviceLocation>) -> Handshake {
        Handshake {
            ephid: EphId::from_raw([9u8; EPHID_LENGTH]),
            rssi: -71,
            time_ms,
            location,
        }
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let location = DeviceLocation::new(1_600_000_012_345, 47.3769, 8.5417).materialized();
        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store.save_device_location(&location).unwrap();
            let token = BtLocToken::new(EphId::from_raw([1u8; EPHID_LENGTH]), location.clone());
            assert_eq!(store.save_bt_loc_token(&token).unwrap(), 6);
            store
                .save_handshake(&handshake(1_600_000_013_000, Some(location.clone())))
                .unwrap();
            store.flush().unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(
            store.counts(),
            StoreCounts {
                device_locations: 1,
                token_rows: 6,
                handshakes: 1
            }
        );
        let reloaded = &store.device_locations()[0];
        assert_eq!(reloaded, &location);
        assert_eq!(
            reloaded.hashes().map(GeohashNeighborhood::parse),
            Some(location.location_hashes())
        );
        assert_eq!(store.handshakes()[0].location.as_ref(), Some(&location));
    }

    #[test]
    fn dedup_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let token = BtLocToken::new(
            EphId::from_raw([1u8; EPHID_LENGTH]),
            DeviceLocation::new(1_600_000_012_345, 47.3769, 8.5417),
        );
        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store.save_bt_loc_token(&token).unwrap();
        }
        let mut store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.save_bt_loc_token(&token).unwrap(), 0);
    }

    #[test]
    fn purge_compacts_logs() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store.save_handshake(&handshake(1_000, None)).unwrap();
            store.save_handshake(&handshake(100_000, None)).unwrap();
            let stats = store.purge_older_than(50_000).unwrap();
            assert_eq!(stats.handshakes, 1);
            store.save_handshake(&handshake(120_000, None)).unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        let times: Vec<u64> = store.handshakes().iter().map(|h| h.time_ms).collect();
        assert_eq!(times, vec![100_000, 120_000]);
    }

    #[test]
    fn failed_purge_leaves_index_and_log_in_step() {
        let dir = tempfile::tempdir().unwrap();
        // A directory squatting on the temp path makes the rewrite fail.
        let blocker = dir.path().join(HANDSHAKES_LOG).with_extension("log.tmp");
        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store.save_handshake(&handshake(1_000, None)).unwrap();
            store.save_handshake(&handshake(100_000, None)).unwrap();
            fs::create_dir(&blocker).unwrap();

            assert!(store.purge_older_than(50_000).is_err());
            assert_eq!(store.counts().handshakes, 2);

            fs::remove_dir(&blocker).unwrap();
            assert_eq!(store.purge_older_than(50_000).unwrap().handshakes, 1);
            assert_eq!(store.counts().handshakes, 1);
        }

        let store = FileStore::open(dir.path()).unwrap();
        let times: Vec<u64> = store.handshakes().iter().map(|h| h.time_ms).collect();
        assert_eq!(times, vec![100_000]);
    }

    #[test]
    fn torn_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store.save_handshake(&handshake(1_000, None)).unwrap();
        }
        let path = dir.path().join(HANDSHAKES_LOG);
        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&[40, 0, 0, 0, 1, 2]);
        fs::write(&path, bytes).unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.counts().handshakes, 1);
    }
}
