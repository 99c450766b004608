//! Small diagnostics surface for the trace ingestion path: last-N raw events,
//! per-provider counters, and the last errors seen at each stage of session
//! setup. None of this is on the hot path's critical section — every field
//! is either an atomic or guarded by its own short-lived mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use super::parser::RawEvent;

/// Last-observed error code from each stage of starting a trace session.
/// Zero means "no error recorded yet". Read without locking; each field is
/// written exactly once per session attempt.
#[derive(Default)]
pub struct TraceStartErrors {
    pub start_trace: AtomicU32,
    pub enable_trace: AtomicU32,
    pub open_trace: AtomicU32,
    pub process_trace: AtomicU32,
}

/// Ring buffer of the most recent raw events plus running per-provider
/// counters, mirroring the debug surface a caller uses to confirm the
/// pipeline is actually receiving events before trusting aggregated numbers.
pub struct TraceDiagnostics {
    capacity: usize,
    ring: Mutex<VecDeque<RawEvent>>,
    counters: dashmap::DashMap<u32, u64>,
    events_seen: AtomicU64,
    last_parse_error: Mutex<Option<String>>,
    pub start_errors: TraceStartErrors,
}

impl TraceDiagnostics {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            counters: dashmap::DashMap::new(),
            events_seen: AtomicU64::new(0),
            last_parse_error: Mutex::new(None),
            start_errors: TraceStartErrors::default(),
        }
    }

    /// Record a raw event into the debug ring and bump its provider counter.
    pub fn record(&self, event: &RawEvent) {
        self.events_seen.fetch_add(1, Ordering::Relaxed);
        *self.counters.entry(event.provider_key).or_insert(0) += 1;

        let mut ring = self.ring.lock().unwrap();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(event.clone());
    }

    pub fn set_last_parse_error(&self, message: String) {
        *self.last_parse_error.lock().unwrap() = Some(message);
    }

    pub fn last_parse_error(&self) -> Option<String> {
        self.last_parse_error.lock().unwrap().clone()
    }

    pub fn last_events(&self) -> Vec<RawEvent> {
        self.ring.lock().unwrap().iter().cloned().collect()
    }

    pub fn event_count(&self, provider_key: u32) -> u64 {
        self.counters.get(&provider_key).map(|v| *v).unwrap_or(0)
    }

    pub fn total_events_seen(&self) -> u64 {
        self.events_seen.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::parser::RawEvent;

    fn raw(provider_key: u32, event_id: u16) -> RawEvent {
        RawEvent {
            provider_key,
            event_id,
            process_id: 100,
            timestamp: 1_000,
            properties: Default::default(),
        }
    }

    #[test]
    fn test_ring_evicts_oldest_past_capacity() {
        let diag = TraceDiagnostics::new(2);
        diag.record(&raw(1, 1));
        diag.record(&raw(1, 2));
        diag.record(&raw(1, 3));

        let events = diag.last_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, 2);
        assert_eq!(events[1].event_id, 3);
    }

    #[test]
    fn test_counters_track_per_provider() {
        let diag = TraceDiagnostics::new(10);
        diag.record(&raw(1, 1));
        diag.record(&raw(1, 2));
        diag.record(&raw(2, 1));

        assert_eq!(diag.event_count(1), 2);
        assert_eq!(diag.event_count(2), 1);
        assert_eq!(diag.event_count(3), 0);
        assert_eq!(diag.total_events_seen(), 3);
    }

    #[test]
    fn test_last_parse_error_roundtrip() {
        let diag = TraceDiagnostics::new(10);
        assert!(diag.last_parse_error().is_none());
        diag.set_last_parse_error("bad property".into());
        assert_eq!(diag.last_parse_error().as_deref(), Some("bad property"));
    }
}
