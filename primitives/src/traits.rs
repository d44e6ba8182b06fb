//! Shared trait abstractions for time-bound records.

/// A stored record that expires with the retention window.
pub trait RetentionBound {
    /// Timestamp that decides when the record expires.
    fn bound_time_ms(&self) -> u64;

    /// Whether a purge with `cutoff_ms` keeps this record.
    fn retained_at(&self, cutoff_ms: u64) -> bool {
        self.bound_time_ms() >= cutoff_ms
    }
}
