//! Tracing and node configuration.
//!
//! A JSON file may provide any subset of [`NodeConfigFile`]; flags given on
//! the command line override it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use geotrace_primitives::{
    ErrorSet, DEFAULT_LOCATION_INTERVAL_MS, DEFAULT_RETENTION_DAYS, DEFAULT_SCAN_DURATION_MS,
    DEFAULT_SCAN_INTERVAL_MS, DEFAULT_STALE_FIX_FACTOR,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::RunCmd;
use crate::radio::{MockConfig, RadioMode};

const MIN_LOCATION_INTERVAL_MS: u64 = 1_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceText {
    pub text: String,
    pub errors_prefix: String,
}

impl Default for PresenceText {
    fn default() -> Self {
        Self {
            text: "Proximity tracing is active".into(),
            errors_prefix: "Proximity tracing is impaired:".into(),
        }
    }
}

impl PresenceText {
    pub fn render(&self, errors: &ErrorSet) -> String {
        if errors.is_empty() {
            self.text.clone()
        } else {
            format!("{}\n{}", self.errors_prefix, errors.joined())
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub advertise: bool,
    pub receive: bool,
    pub scan_interval_ms: u64,
    pub scan_duration_ms: u64,
    pub location_interval_ms: u64,
    /// Rotate the transmitter on a one-minute grid instead of per epoch.
    pub calibration: bool,
    pub retention_days: u32,
    pub stale_fix_factor: u64,
    pub presence: PresenceText,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            advertise: true,
            receive: true,
            scan_interval_ms: DEFAULT_SCAN_INTERVAL_MS,
            scan_duration_ms: DEFAULT_SCAN_DURATION_MS,
            location_interval_ms: DEFAULT_LOCATION_INTERVAL_MS,
            calibration: false,
            retention_days: DEFAULT_RETENTION_DAYS,
            stale_fix_factor: DEFAULT_STALE_FIX_FACTOR,
            presence: PresenceText::default(),
        }
    }
}

impl TracingConfig {
    /// Clamps timing values into the ranges the orchestrator can honor.
    pub fn normalized(mut self) -> Self {
        if self.scan_interval_ms == 0 {
            log::warn!("scan_interval_ms of 0 raised to 1");
            self.scan_interval_ms = 1;
        }
        let duration = self.scan_duration_ms.clamp(1, self.scan_interval_ms);
        if duration != self.scan_duration_ms {
            log::warn!(
                "scan_duration_ms {} clamped to {} (interval {})",
                self.scan_duration_ms,
                duration,
                self.scan_interval_ms
            );
            self.scan_duration_ms = duration;
        }
        if self.location_interval_ms < MIN_LOCATION_INTERVAL_MS {
            log::warn!(
                "location_interval_ms {} raised to {}",
                self.location_interval_ms,
                MIN_LOCATION_INTERVAL_MS
            );
            self.location_interval_ms = MIN_LOCATION_INTERVAL_MS;
        }
        if self.stale_fix_factor == 0 {
            self.stale_fix_factor = 1;
        }
        self
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

/// On-disk configuration. Every field is optional.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfigFile {
    pub tracing: TracingConfig,
    pub scanner_mode: Option<String>,
    pub mock_peers: Option<u32>,
    pub mock_seed: Option<u64>,
    pub data_dir: Option<PathBuf>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl NodeConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Fully resolved node configuration.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub tracing: TracingConfig,
    pub radio_mode: RadioMode,
    pub mock: MockConfig,
    pub data_dir: Option<PathBuf>,
    pub position: Option<(f64, f64)>,
}

impl NodeConfig {
    pub fn resolve(cmd: &RunCmd) -> Result<Self, ConfigError> {
        let file = match &cmd.config {
            Some(path) => NodeConfigFile::load(path)?,
            None => NodeConfigFile::default(),
        };
        Self::merge(file, cmd)
    }

    fn merge(file: NodeConfigFile, cmd: &RunCmd) -> Result<Self, ConfigError> {
        let mut tracing = file.tracing;
        if let Some(interval) = cmd.scan_interval {
            tracing.scan_interval_ms = interval;
        }
        if let Some(duration) = cmd.scan_duration {
            tracing.scan_duration_ms = duration;
        }
        if let Some(interval) = cmd.location_interval {
            tracing.location_interval_ms = interval;
        }
        if let Some(days) = cmd.retention_days {
            tracing.retention_days = days;
        }
        if cmd.no_advertise {
            tracing.advertise = false;
        }
        if cmd.no_receive {
            tracing.receive = false;
        }
        if cmd.calibration {
            tracing.calibration = true;
        }

        let mode = cmd
            .scanner_mode
            .as_deref()
            .or(file.scanner_mode.as_deref())
            .unwrap_or("real");
        let radio_mode = mode.parse::<RadioMode>().map_err(ConfigError::Invalid)?;

        let mut mock = MockConfig::default();
        if let Some(peers) = cmd.mock_peers.or(file.mock_peers) {
            mock.peer_count = peers;
        }
        if let Some(seed) = cmd.mock_seed.or(file.mock_seed) {
            mock.seed = seed;
        }

        let latitude = cmd.lat.or(file.latitude);
        let longitude = cmd.lon.or(file.longitude);
        let position = match (latitude, longitude) {
            (Some(lat), Some(lon)) => {
                if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                    return Err(ConfigError::Invalid(format!(
                        "position ({lat}, {lon}) is out of range"
                    )));
                }
                Some((lat, lon))
            }
            (None, None) => None,
            _ => {
                return Err(ConfigError::Invalid(
                    "latitude and longitude must be given together".into(),
                ))
            }
        };

        Ok(Self {
            tracing: tracing.normalized(),
            radio_mode,
            mock,
            data_dir: cmd.data_dir.clone().or(file.data_dir),
            position,
        })
    }
}
