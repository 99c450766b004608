//! In-memory traffic aggregation keyed by (process, remote endpoint).
//!
//! Two maps share one mutex: `deltaboard` accumulates bytes since the last
//! drain (what the persister flushes every tick) and `cumulative` tracks
//! totals for the lifetime of the process (what a live dashboard would
//! read). spec.md rejects splitting these across separate locks — the
//! critical section is a handful of integer additions, far cheaper than
//! the contention two locks would add.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use crate::dns_cache::DnsReverseCache;
use crate::geo::GeoLookup;
use crate::process_cache::ProcessNameCache;
use crate::trace::parser::Direction;

/// Identifies one flow: the process that owns the socket and the remote
/// endpoint it's talking to. `None` remote address means the event's
/// schema didn't carry one — still attributed to the process, just not to
/// a specific peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatsKey {
    pub process_id: u32,
    pub remote_addr: Option<IpAddr>,
}

/// Running totals for one `StatsKey`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccumulatedStats {
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl AccumulatedStats {
    fn add(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Upload => self.bytes_up += bytes,
            Direction::Download => self.bytes_down += bytes,
        }
    }
}

#[derive(Default)]
struct Maps {
    deltaboard: HashMap<StatsKey, AccumulatedStats>,
    cumulative: HashMap<StatsKey, AccumulatedStats>,
}

#[derive(Default)]
pub struct Aggregator {
    maps: Mutex<Maps>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one classified traffic event. O(1): two hashmap lookups
    /// under a single short-held lock.
    pub fn record(&self, key: StatsKey, direction: Direction, bytes: u64) {
        let mut maps = self.maps.lock().unwrap();
        maps.deltaboard.entry(key).or_default().add(direction, bytes);
        maps.cumulative.entry(key).or_default().add(direction, bytes);
    }

    /// Drain and return everything accumulated since the last drain,
    /// resetting the deltaboard to empty. This is what the persister calls
    /// once per flush tick.
    pub fn drain(&self) -> Vec<(StatsKey, AccumulatedStats)> {
        let mut maps = self.maps.lock().unwrap();
        maps.deltaboard.drain().collect()
    }

    /// Read-only snapshot of lifetime totals, for diagnostics or a future
    /// live view. Does not affect the deltaboard.
    pub fn snapshot_cumulative(&self) -> Vec<(StatsKey, AccumulatedStats)> {
        let maps = self.maps.lock().unwrap();
        maps.cumulative.iter().map(|(k, v)| (*k, *v)).collect()
    }

    /// `snapshot_cumulative`, joined with process name, reverse-DNS domain,
    /// and country the same way `Persister::persist_one` enriches a row —
    /// what a live dashboard reads to derive its own per-second deltas
    /// (spec.md §4.6; §9 "UI-derived deltas vs in-core deltas" is why this
    /// sits alongside the plain deltaboard rather than replacing it).
    pub fn snapshot_cumulative_enriched(
        &self,
        process_cache: &ProcessNameCache,
        dns_cache: &DnsReverseCache,
        geo: &GeoLookup,
    ) -> Vec<EnrichedStats> {
        self.snapshot_cumulative()
            .into_iter()
            .map(|(key, stats)| {
                let process_name = process_cache.resolve(key.process_id);
                let (domain, country) = match key.remote_addr {
                    Some(addr) => (dns_cache.domain_for(&addr), Some(geo.country_for(addr))),
                    None => (None, None),
                };
                EnrichedStats {
                    process_id: key.process_id,
                    process_name,
                    remote_addr: key.remote_addr,
                    domain,
                    country,
                    bytes_up: stats.bytes_up,
                    bytes_down: stats.bytes_down,
                }
            })
            .collect()
    }
}

/// One cumulative-map entry joined with the labels a caller needs to
/// display it, rather than just the raw `(pid, ip)` key.
#[derive(Debug, Clone)]
pub struct EnrichedStats {
    pub process_id: u32,
    pub process_name: String,
    pub remote_addr: Option<IpAddr>,
    pub domain: Option<String>,
    pub country: Option<String>,
    pub bytes_up: u64,
    pub bytes_down: u64,
}
