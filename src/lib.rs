//! Library entry point: wires the trace session, aggregator, persister,
//! and GeoIP worker into one `Monitor`, and exposes the analysis pipeline
//! for a caller to run against the store whenever it wants a retrospective
//! report. `netwatchd` is the thin binary that drives this for a
//! headless, long-lived run.

pub mod aggregator;
pub mod analysis;
pub mod config;
pub mod db;
pub mod dns_cache;
pub mod error;
pub mod geo;
pub mod persist;
pub mod process_cache;
pub mod trace;

use std::sync::Arc;

use aggregator::{Aggregator, StatsKey};
use config::MonitorConfig;
use db::Store;
use dns_cache::DnsReverseCache;
use error::NetwatchError;
use geo::GeoLookup;
use persist::Persister;
use process_cache::ProcessNameCache;
use trace::diagnostics::TraceDiagnostics;
use trace::parser::ParsedEvent;
use trace::TraceSession;

/// Installs a `tracing_subscriber` reading `RUST_LOG` (default
/// `"netwatch=info"`) and a panic hook that logs before the default hook
/// runs. Call once, from `netwatchd::main` or an embedding application's
/// own startup.
pub fn init_logging() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("panic in netwatch: {info}");
        default_hook(info);
    }));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netwatch=info".into()),
        )
        .init();
}

/// Owns every subsystem of the ingestion pipeline. Construct with
/// `Monitor::start`, shut down with `Monitor::stop` (also run on `Drop`),
/// in the documented order: trace session, then persister, then GeoIP
/// worker, joining each before moving to the next, followed by closing the
/// store.
pub struct Monitor {
    store: Store,
    aggregator: Arc<Aggregator>,
    process_cache: Arc<ProcessNameCache>,
    dns_cache: Arc<DnsReverseCache>,
    geo: Arc<GeoLookup>,
    diagnostics: Arc<TraceDiagnostics>,
    trace: Option<TraceSession>,
    persister: Option<Persister>,
}

impl Monitor {
    /// Open the store and start every background subsystem. The kernel
    /// trace session is the only piece that can fail here in a way that
    /// should abort startup (spec.md's Fatal-at-startup class); GeoIP and
    /// the persister always start.
    pub fn start(config: &MonitorConfig) -> Result<Self, NetwatchError> {
        let store = Store::open(&config.db_path)?;
        let aggregator = Arc::new(Aggregator::new());
        let process_cache = Arc::new(ProcessNameCache::new());
        let dns_cache = Arc::new(DnsReverseCache::new());
        let geo = Arc::new(GeoLookup::start(config.geo_throttle));
        let diagnostics = Arc::new(TraceDiagnostics::new(config.debug_ring_size));

        let agg_for_trace = Arc::clone(&aggregator);
        let dns_for_trace = Arc::clone(&dns_cache);
        let diagnostics_for_monitor = Arc::clone(&diagnostics);
        let trace = TraceSession::start(diagnostics, move |event| match event {
            ParsedEvent::Traffic(t) => {
                let key = StatsKey {
                    process_id: t.process_id,
                    remote_addr: t.remote_addr,
                };
                agg_for_trace.record(key, t.direction, t.bytes);
            }
            ParsedEvent::Dns(d) => dns_for_trace.observe(d.resolved_addr, d.domain),
            ParsedEvent::Ignored => {}
        })?;

        let persister = Persister::start(
            Arc::clone(&aggregator),
            store.clone(),
            Arc::clone(&process_cache),
            Arc::clone(&dns_cache),
            Arc::clone(&geo),
            config.flush_interval,
            unix_now,
        );

        Ok(Self {
            store,
            aggregator,
            process_cache,
            dns_cache,
            geo,
            diagnostics: diagnostics_for_monitor,
            trace: Some(trace),
            persister: Some(persister),
        })
    }

    /// Shut every background subsystem down in order, joining each before
    /// proceeding to the next. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(mut trace) = self.trace.take() {
            trace.stop();
        }
        if let Some(mut persister) = self.persister.take() {
            persister.stop();
        }
        Arc::get_mut(&mut self.geo).map(GeoLookup::stop);
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn process_cache(&self) -> &Arc<ProcessNameCache> {
        &self.process_cache
    }

    pub fn dns_cache(&self) -> &Arc<DnsReverseCache> {
        &self.dns_cache
    }

    pub fn geo(&self) -> &Arc<GeoLookup> {
        &self.geo
    }

    /// Raw events, per-provider counters, and start/parse errors collected
    /// off the trace's worker thread (SPEC_FULL.md's debug surface).
    pub fn trace_diagnostics(&self) -> &Arc<TraceDiagnostics> {
        &self.diagnostics
    }

    /// Lifetime per-(process, remote) totals, joined with process name,
    /// reverse-DNS domain, and country — what a live dashboard reads to
    /// derive its own per-second deltas (spec.md §4.6).
    pub fn snapshot_cumulative_enriched(&self) -> Vec<aggregator::EnrichedStats> {
        self.aggregator
            .snapshot_cumulative_enriched(&self.process_cache, &self.dns_cache, &self.geo)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_now_is_positive_and_monotonic_enough() {
        let a = unix_now();
        let b = unix_now();
        assert!(a > 0);
        assert!(b >= a);
    }
}
