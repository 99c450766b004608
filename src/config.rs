//! Runtime configuration for the trace/aggregate/persist/analyze pipeline.
//!
//! Replaces the fixed compile-time constants of a single-purpose build with a
//! single object so the `netwatchd` binary can override any tunable from the
//! command line while library consumers still get sane defaults via
//! `MonitorConfig::default()`.

use std::time::Duration;

/// Tunables for one running `Monitor`.
///
/// Field names mirror the vocabulary of the analysis/persistence layer
/// (`peak_window`, `peak_threshold_bytes`, ...) rather than generic names,
/// so a caller building one by hand reads like documentation.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Size of the sliding window, in seconds, over which `find_peaks`
    /// groups traffic into minute buckets. Default: 3600 (one hour).
    pub peak_window_secs: u64,

    /// Minimum total bytes in a single (minute bucket, app) group for
    /// `find_peaks` to report it. Default: 1 MiB.
    pub peak_threshold_bytes: u64,

    /// How often the persister drains the aggregator into the store.
    /// Default: 1 second.
    pub flush_interval: Duration,

    /// Minimum spacing between outbound GeoIP lookups. Default: 1500ms.
    pub geo_throttle: Duration,

    /// Capacity of the raw-event debug ring kept by `TraceDiagnostics`.
    /// Default: 10.
    pub debug_ring_size: usize,

    /// Path to the SQLite database file. Default: `netwatch.db` in the
    /// current directory.
    pub db_path: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            peak_window_secs: 3600,
            peak_threshold_bytes: 1024 * 1024,
            flush_interval: Duration::from_secs(1),
            geo_throttle: Duration::from_millis(1500),
            debug_ring_size: 10,
            db_path: "netwatch.db".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_documented_values() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.peak_window_secs, 3600);
        assert_eq!(cfg.peak_threshold_bytes, 1024 * 1024);
        assert_eq!(cfg.flush_interval, Duration::from_secs(1));
        assert_eq!(cfg.geo_throttle, Duration::from_millis(1500));
        assert_eq!(cfg.debug_ring_size, 10);
    }

    #[test]
    fn test_all_intervals_positive() {
        let cfg = MonitorConfig::default();
        assert!(cfg.peak_window_secs > 0);
        assert!(cfg.peak_threshold_bytes > 0);
        assert!(cfg.flush_interval.as_millis() > 0);
        assert!(cfg.geo_throttle.as_millis() > 0);
        assert!(cfg.debug_ring_size > 0);
        assert!(!cfg.db_path.is_empty());
    }

    #[test]
    fn test_config_is_overridable() {
        let mut cfg = MonitorConfig::default();
        cfg.peak_threshold_bytes = 2048;
        assert_eq!(cfg.peak_threshold_bytes, 2048);
    }
}
