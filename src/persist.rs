//! Flushes the aggregator's deltaboard into the store on a fixed tick,
//! building each row's app display name from the process name cache, the
//! DNS reverse cache, and (for routable remote addresses) the GeoIP
//! lookup.
//!
//! Display name is `"<process> -> <domain-or-ip>"`, with `" [<country>]"`
//! appended when a country code is available. Two events for the same
//! process and IP that resolve to different country codes over time
//! (a CDN re-routing, or a lookup finishing between flushes) deliberately
//! produce two different app ids — spec.md keeps this as-is rather than
//! rewriting history when a late-arriving answer changes the label.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::aggregator::{AccumulatedStats, Aggregator, StatsKey};
use crate::db::{Store, TrafficLogRow};
use crate::dns_cache::DnsReverseCache;
use crate::geo::GeoLookup;
use crate::process_cache::ProcessNameCache;

/// Build the unique display name for one stats key, following spec.md
/// §4.7's three steps: process name; then `" -> " + domain-or-ip` only if
/// there is a remote label at all; then `" [" + country + "]"` only if a
/// usable country code is available. `remote_label` is `None` when the
/// event carried no remote address (process-only attribution) — no arrow
/// is appended in that case, and `country` is ignored.
pub fn build_display_name(process_name: &str, remote_label: Option<&str>, country: Option<&str>) -> String {
    let mut name = process_name.to_string();
    let Some(remote_label) = remote_label else {
        return name;
    };
    name.push_str(" -> ");
    name.push_str(remote_label);
    if let Some(code) = country {
        name.push_str(" [");
        name.push_str(code);
        name.push(']');
    }
    name
}

/// Resolve the label used in place of a bare IP for a stats key's remote
/// address: the reverse-DNS domain if one has been observed, otherwise the
/// address's textual form.
pub fn remote_label(dns_cache: &DnsReverseCache, addr: std::net::IpAddr) -> String {
    dns_cache.domain_for(&addr).unwrap_or_else(|| addr.to_string())
}

/// Only a *resolved* country code earns a `" [XX]"` suffix — the pending
/// (`".."`) and local-address (`"Local"`) sentinels are filtered out per
/// spec.md §4.7 step 3. A `"??"` failed-lookup sentinel is not filtered:
/// the reference treats it as a legitimate (if uninformative) label.
fn country_suffix(country: String) -> Option<String> {
    if country.is_empty() || country == crate::geo::PENDING_SENTINEL || country == crate::geo::LOCAL_SENTINEL {
        None
    } else {
        Some(country)
    }
}

pub struct Persister {
    shutdown: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Persister {
    pub fn start(
        aggregator: Arc<Aggregator>,
        store: Store,
        process_cache: Arc<ProcessNameCache>,
        dns_cache: Arc<DnsReverseCache>,
        geo: Arc<GeoLookup>,
        flush_interval: Duration,
        now_fn: impl Fn() -> i64 + Send + 'static,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = Arc::clone(&shutdown);

        let worker = std::thread::Builder::new()
            .name("netwatch-persist".into())
            .spawn(move || {
                while !shutdown_for_thread.load(Ordering::Relaxed) {
                    std::thread::sleep(flush_interval);
                    if shutdown_for_thread.load(Ordering::Relaxed) {
                        break;
                    }
                    flush_once(
                        &aggregator,
                        &store,
                        &process_cache,
                        &dns_cache,
                        &geo,
                        now_fn(),
                    );
                }
            })
            .expect("failed to spawn persister thread");

        Self {
            shutdown,
            worker: Some(worker),
        }
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        self.stop();
    }
}

fn flush_once(
    aggregator: &Aggregator,
    store: &Store,
    process_cache: &ProcessNameCache,
    dns_cache: &DnsReverseCache,
    geo: &GeoLookup,
    timestamp: i64,
) {
    for (key, stats) in aggregator.drain() {
        if let Err(e) = persist_one(store, process_cache, dns_cache, geo, key, stats, timestamp) {
            tracing::warn!("failed to persist traffic row for pid {}: {e}", key.process_id);
        }
    }
}

fn persist_one(
    store: &Store,
    process_cache: &ProcessNameCache,
    dns_cache: &DnsReverseCache,
    geo: &GeoLookup,
    key: StatsKey,
    stats: AccumulatedStats,
    timestamp: i64,
) -> Result<(), crate::error::NetwatchError> {
    let process_name = process_cache.resolve(key.process_id);

    let (label, country) = match key.remote_addr {
        Some(addr) => {
            let label = remote_label(dns_cache, addr);
            let country = geo.country_for(addr);
            (Some(label), country_suffix(country))
        }
        None => (None, None),
    };

    let display_name = build_display_name(&process_name, label.as_deref(), country.as_deref());
    let app_id = store.get_or_add_app(&display_name)?;
    store.log_traffic(&TrafficLogRow {
        timestamp,
        app_id,
        bytes_up: stats.bytes_up,
        bytes_down: stats.bytes_down,
    })?;
    Ok(())
}
