//! Headless entry point: starts the monitor, runs until interrupted, then
//! shuts down cleanly. Must be launched with privileges sufficient to open
//! a kernel trace session (an elevated/administrator context on Windows).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use netwatch::analysis;
use netwatch::config::MonitorConfig;
use netwatch::Monitor;

/// Per-process network traffic monitor with kernel-trace ingestion and
/// peak correlation.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the SQLite database file.
    #[arg(long, default_value = "netwatch.db")]
    db_path: String,

    /// Sliding window, in seconds, that peak detection groups into minute
    /// buckets.
    #[arg(long, default_value_t = 3600)]
    peak_window_secs: u64,

    /// Minimum bytes in a (minute, app) group to report as a peak.
    #[arg(long, default_value_t = 1024 * 1024)]
    peak_threshold_bytes: u64,

    /// Milliseconds between aggregator flushes to the store.
    #[arg(long, default_value_t = 1000)]
    flush_interval_ms: u64,

    /// Minimum milliseconds between outbound GeoIP lookups.
    #[arg(long, default_value_t = 1500)]
    geo_throttle_ms: u64,

    /// Run the peak/correlation/conclusion report once on exit instead of
    /// only ingesting.
    #[arg(long)]
    report_on_exit: bool,
}

impl From<Cli> for MonitorConfig {
    fn from(cli: Cli) -> Self {
        Self {
            peak_window_secs: cli.peak_window_secs,
            peak_threshold_bytes: cli.peak_threshold_bytes,
            flush_interval: Duration::from_millis(cli.flush_interval_ms),
            geo_throttle: Duration::from_millis(cli.geo_throttle_ms),
            db_path: cli.db_path,
            ..MonitorConfig::default()
        }
    }
}

fn main() {
    netwatch::init_logging();
    let cli = Cli::parse();
    let report_on_exit = cli.report_on_exit;
    let peak_window_secs = cli.peak_window_secs;
    let peak_threshold_bytes = cli.peak_threshold_bytes;
    let config = MonitorConfig::from(cli);

    let mut monitor = match Monitor::start(&config) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("failed to start monitor: {e}");
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || {
        running_for_handler.store(false, Ordering::Relaxed);
    }) {
        tracing::warn!("failed to install Ctrl+C handler: {e}");
    }

    tracing::info!("netwatch running (db: {})", config.db_path);
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("shutting down");
    monitor.stop();

    if report_on_exit {
        #[cfg(windows)]
        {
            let source = netwatch::analysis::eventlog::WindowsEventLogSource::new();
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            match analysis::analyze(
                monitor.store(),
                &source,
                now - peak_window_secs as i64,
                now,
                peak_threshold_bytes,
            ) {
                Ok(conclusions) => {
                    for c in conclusions {
                        tracing::info!(
                            "peak: {} at {} — {} ({:.0}% confidence)",
                            c.peak.app_name,
                            c.peak.bucket,
                            c.cause,
                            c.confidence * 100.0
                        );
                    }
                }
                Err(e) => tracing::warn!("analysis failed: {e}"),
            }
        }
        #[cfg(not(windows))]
        tracing::warn!("--report-on-exit requires the Windows event log source");
    }
}
