//! Protocol constants for epochs, geo-context sampling and beacon timing.

// Ephemeral identifiers
pub const MILLISECONDS_PER_EPOCH: u64 = 3_600_000;
pub const EPHID_LENGTH: usize = 16;

// Geo-context
pub const DEFAULT_LOCATION_INTERVAL_MS: u64 = 10_000;
pub const GEOHASH_LENGTH: usize = 8;
pub const HASHES_DELIMITER: char = ',';

/// Axis offset of the rosette, in degrees (~11 m).
pub const ROSETTE_AXIS: f64 = 0.0001;
/// Diagonal offset of the rosette, in degrees.
pub const ROSETTE_DIAGONAL: f64 = 0.00007;

/// Center plus eight compass offsets `(Δlat, Δlon)`.
pub const ROSETTE: [(f64, f64); 9] = [
    (0.0, 0.0),
    (ROSETTE_AXIS, 0.0),
    (ROSETTE_DIAGONAL, ROSETTE_DIAGONAL),
    (0.0, ROSETTE_AXIS),
    (-ROSETTE_DIAGONAL, ROSETTE_DIAGONAL),
    (-ROSETTE_AXIS, 0.0),
    (-ROSETTE_DIAGONAL, -ROSETTE_DIAGONAL),
    (0.0, -ROSETTE_AXIS),
    (ROSETTE_DIAGONAL, -ROSETTE_DIAGONAL),
];

// Beacon timing
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_SCAN_DURATION_MS: u64 = 20_000;
pub const CALIBRATION_GRID_MS: u64 = 60_000;

/// 16-bit service UUID carried in DP3T beacon advertisements.
pub const DP3T_SERVICE_UUID16: u16 = 0xFD68;

// Retention
pub const MILLISECONDS_PER_DAY: u64 = 86_400_000;
pub const DEFAULT_RETENTION_DAYS: u32 = 14;
pub const DEFAULT_STALE_FIX_FACTOR: u64 = 2;

/// Start of the grid slot containing `time_ms`.
#[inline]
pub const fn floor_to_grid(time_ms: u64, grid_ms: u64) -> u64 {
    if grid_ms == 0 {
        return time_ms;
    }
    time_ms / grid_ms * grid_ms
}

/// First grid instant strictly after `time_ms`.
#[inline]
pub const fn next_grid_after(time_ms: u64, grid_ms: u64) -> u64 {
    if grid_ms == 0 {
        return time_ms;
    }
    floor_to_grid(time_ms, grid_ms).saturating_add(grid_ms)
}

/// Oldest timestamp still inside the retention horizon.
#[inline]
pub const fn retention_cutoff(now_ms: u64, retention_days: u32) -> u64 {
    now_ms.saturating_sub(MILLISECONDS_PER_DAY.saturating_mul(retention_days as u64))
}
