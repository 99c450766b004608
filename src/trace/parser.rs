//! Schema-discovery event parser.
//!
//! The three providers this pipeline subscribes to emit events whose
//! property layout is only knowable by asking the tracing subsystem for the
//! event's schema the first time a given `(provider, event id)` pair is
//! seen. After that the layout never changes for the lifetime of the
//! process, so it is cached and every subsequent event of that kind takes
//! the fast path: look up the cached field names, pull them out, done.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;

use dashmap::DashMap;

/// Microsoft-Windows-TCPIP
pub const PROVIDER_TCPIP: u32 = 0x2f07e2ee;
/// Microsoft-Windows-DNS-Client
pub const PROVIDER_DNS_CLIENT: u32 = 0x1c95126e;
/// Microsoft-Windows-Kernel-Network
pub const PROVIDER_KERNEL_NETWORK: u32 = 0x7dd42a49;

/// DNS response events we care about fall in this id range.
pub const DNS_EVENT_ID_RANGE: std::ops::RangeInclusive<u16> = 3000..=3020;

/// A single raw event as delivered by the tracing subsystem, reduced to the
/// fields the parser needs. `properties` is a flat string bag — exactly
/// what a schema locator hands back before any typed interpretation.
#[derive(Debug, Clone, Default)]
pub struct RawEvent {
    /// High 32 bits of the provider GUID (`Data1`).
    pub provider_key: u32,
    pub event_id: u16,
    pub process_id: u32,
    pub timestamp: i64,
    pub properties: BTreeMap<String, String>,
}

impl RawEvent {
    /// The cache key under which this event's schema is stored:
    /// `(provider << 16) | event_id`.
    pub fn schema_key(&self) -> u64 {
        schema_key(self.provider_key, self.event_id)
    }
}

pub fn schema_key(provider_key: u32, event_id: u16) -> u64 {
    ((provider_key as u64) << 16) | event_id as u64
}

/// What kind of traffic an event represents, decided once per schema and
/// then reused for every event sharing that schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Upload,
    Download,
    Dns,
    Unknown,
}

/// The discovered shape of one `(provider, event id)` pair: which field (if
/// any) holds byte counts, which holds a remote address, and what kind of
/// traffic the event represents.
#[derive(Debug, Clone)]
pub struct EventSchema {
    pub kind: EventKind,
    pub size_field: Option<String>,
    pub address_field: Option<String>,
}

const SIZE_FIELD_CANDIDATES: [&str; 3] = ["size", "Size", "datalen"];
const ADDRESS_FIELD_EXACT: [&str; 2] = ["daddr", "RemoteAddress"];

/// Direction of a classified traffic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// A classified send/receive event ready for the aggregator.
#[derive(Debug, Clone)]
pub struct TrafficEvent {
    pub process_id: u32,
    pub timestamp: i64,
    pub direction: Direction,
    pub bytes: u64,
    pub remote_addr: Option<IpAddr>,
}

/// A DNS query resolution observed on the wire, feeding the reverse cache.
#[derive(Debug, Clone)]
pub struct DnsObservation {
    pub timestamp: i64,
    pub domain: String,
    pub resolved_addr: IpAddr,
}

/// Outcome of parsing one raw event.
#[derive(Debug, Clone)]
pub enum ParsedEvent {
    Traffic(TrafficEvent),
    Dns(DnsObservation),
    Ignored,
}

/// Derive an `EventSchema` from an event's task/opcode name and the set of
/// property names the schema locator reports for it. Pure function — no
/// I/O, so it is exercised directly in tests without a live trace session.
pub fn classify_schema(
    provider_key: u32,
    event_id: u16,
    task_opcode_name: &str,
    property_names: &[String],
) -> EventSchema {
    if provider_key == PROVIDER_DNS_CLIENT && DNS_EVENT_ID_RANGE.contains(&event_id) {
        return EventSchema {
            kind: EventKind::Dns,
            size_field: None,
            address_field: None,
        };
    }

    let kind = classify_direction(task_opcode_name);
    let size_field = property_names
        .iter()
        .find(|name| {
            SIZE_FIELD_CANDIDATES.contains(&name.as_str()) || name.contains("Bytes")
        })
        .cloned();
    let address_field = property_names
        .iter()
        .find(|name| ADDRESS_FIELD_EXACT.contains(&name.as_str()) || name.contains("Addr"))
        .cloned();

    EventSchema {
        kind,
        size_field,
        address_field,
    }
}

/// Render a raw 4-byte address exactly as `TdhGetProperty` hands it back —
/// a plain memory copy, not a byte-swapped "network order" read — as a
/// dotted quad.
pub fn ipv4_to_string(bytes: [u8; 4]) -> String {
    format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
}

/// Render a raw 16-byte address as eight colon-separated 16-bit hex groups,
/// lowercase, always zero-padded to four digits (39 characters total).
pub fn ipv6_to_string(bytes: [u8; 16]) -> String {
    bytes
        .chunks_exact(2)
        .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
        .collect::<Vec<_>>()
        .join(":")
}

fn classify_direction(task_opcode_name: &str) -> EventKind {
    if task_opcode_name.contains("Send") || task_opcode_name.contains("Tx") {
        EventKind::Upload
    } else if task_opcode_name.contains("Recv")
        || task_opcode_name.contains("Receive")
        || task_opcode_name.contains("Rx")
    {
        EventKind::Download
    } else {
        EventKind::Unknown
    }
}

/// Schema-discovery cache plus the two locks the underlying schema-locator
/// API requires: the cache itself may be read/written from any trace
/// thread, while the locator's own metadata lookup is documented
/// non-reentrant and therefore serialized behind `locator_mutex`.
pub struct EventParser {
    schema_cache: DashMap<u64, EventSchema>,
    locator_mutex: Mutex<()>,
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventParser {
    pub fn new() -> Self {
        Self {
            schema_cache: DashMap::new(),
            locator_mutex: Mutex::new(()),
        }
    }

    /// Look up a cached schema, or run `discover` (which is expected to take
    /// `locator_mutex` internally or call into a non-reentrant API) to build
    /// one and cache it. `discover` only runs the first time a given
    /// `(provider, event id)` pair is observed.
    pub fn schema_for(
        &self,
        provider_key: u32,
        event_id: u16,
        discover: impl FnOnce() -> EventSchema,
    ) -> EventSchema {
        let key = schema_key(provider_key, event_id);
        if let Some(existing) = self.schema_cache.get(&key) {
            return existing.clone();
        }
        let _guard = self.locator_mutex.lock().unwrap();
        // Re-check after acquiring the lock: another thread may have raced us.
        if let Some(existing) = self.schema_cache.get(&key) {
            return existing.clone();
        }
        let schema = discover();
        self.schema_cache.insert(key, schema.clone());
        schema
    }

    pub fn cached_schema_count(&self) -> usize {
        self.schema_cache.len()
    }

    /// Parse one raw event into a `ParsedEvent`, given its already-known
    /// schema. Returns `Ignored` for anything that isn't classified traffic
    /// or a DNS resolution — the fast path spec.md describes.
    pub fn parse(&self, event: &RawEvent, schema: &EventSchema) -> ParsedEvent {
        match schema.kind {
            EventKind::Dns => self.parse_dns(event),
            EventKind::Upload => self.parse_traffic(event, schema, Direction::Upload),
            EventKind::Download => self.parse_traffic(event, schema, Direction::Download),
            EventKind::Unknown => ParsedEvent::Ignored,
        }
    }

    fn parse_dns(&self, event: &RawEvent) -> ParsedEvent {
        let domain = match event.properties.get("QueryName") {
            Some(d) => d.clone(),
            None => return ParsedEvent::Ignored,
        };
        let addr_text = event
            .properties
            .get("QueryResults")
            .or_else(|| event.properties.get("Address"));
        let addr_text = match addr_text {
            Some(a) => a,
            None => return ParsedEvent::Ignored,
        };
        // QueryResults can be a `;`-separated list; take the first address.
        let first = addr_text.split(';').next().unwrap_or(addr_text).trim();
        match first.parse::<IpAddr>() {
            Ok(resolved_addr) => ParsedEvent::Dns(DnsObservation {
                timestamp: event.timestamp,
                domain,
                resolved_addr,
            }),
            Err(_) => ParsedEvent::Ignored,
        }
    }

    fn parse_traffic(&self, event: &RawEvent, schema: &EventSchema, direction: Direction) -> ParsedEvent {
        let bytes = match schema
            .size_field
            .as_ref()
            .and_then(|f| event.properties.get(f))
            .and_then(|v| v.parse::<u64>().ok())
        {
            // A zero-byte event carries no traffic worth attributing; treat
            // it the same as a missing size field.
            Some(0) | None => return ParsedEvent::Ignored,
            Some(b) => b,
        };
        let remote_addr = schema
            .address_field
            .as_ref()
            .and_then(|f| event.properties.get(f))
            .and_then(|v| v.parse::<IpAddr>().ok());

        ParsedEvent::Traffic(TrafficEvent {
            process_id: event.process_id,
            timestamp: event.timestamp,
            direction,
            bytes,
            remote_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_classify_schema_dns_range() {
        let schema = classify_schema(PROVIDER_DNS_CLIENT, 3008, "DnsQueryCompleted", &[]);
        assert_eq!(schema.kind, EventKind::Dns);
    }

    #[test]
    fn test_classify_schema_dns_guid_outside_range_is_not_dns() {
        let schema = classify_schema(PROVIDER_DNS_CLIENT, 4000, "Send", &["size".into()]);
        assert_eq!(schema.kind, EventKind::Upload);
    }

    #[test]
    fn test_classify_direction_send_and_tx() {
        assert_eq!(classify_direction("KERNEL_NETWORK_TASK_TCPIP/Send"), EventKind::Upload);
        assert_eq!(classify_direction("DatagramTx"), EventKind::Upload);
    }

    #[test]
    fn test_classify_direction_recv_variants() {
        assert_eq!(classify_direction("Recv"), EventKind::Download);
        assert_eq!(classify_direction("Receive"), EventKind::Download);
        assert_eq!(classify_direction("DatagramRx"), EventKind::Download);
    }

    #[test]
    fn test_classify_direction_unrecognized_is_unknown() {
        assert_eq!(classify_direction("Connect"), EventKind::Unknown);
    }

    #[test]
    fn test_classify_schema_finds_size_and_address_fields() {
        let names = vec!["PID".to_string(), "size".to_string(), "daddr".to_string()];
        let schema = classify_schema(PROVIDER_TCPIP, 10, "Send", &names);
        assert_eq!(schema.kind, EventKind::Upload);
        assert_eq!(schema.size_field.as_deref(), Some("size"));
        assert_eq!(schema.address_field.as_deref(), Some("daddr"));
    }

    #[test]
    fn test_classify_schema_bytes_suffix_matches_size_field() {
        let names = vec!["NumBytes".to_string()];
        let schema = classify_schema(PROVIDER_KERNEL_NETWORK, 10, "Recv", &names);
        assert_eq!(schema.size_field.as_deref(), Some("NumBytes"));
    }

    #[test]
    fn test_schema_for_caches_after_first_discovery() {
        let parser = EventParser::new();
        let mut calls = 0;
        for _ in 0..5 {
            parser.schema_for(PROVIDER_TCPIP, 42, || {
                calls += 1;
                EventSchema {
                    kind: EventKind::Upload,
                    size_field: Some("size".into()),
                    address_field: None,
                }
            });
        }
        assert_eq!(calls, 1, "discover() should only run once per schema key");
        assert_eq!(parser.cached_schema_count(), 1);
    }

    #[test]
    fn test_parse_traffic_event_extracts_bytes_and_address() {
        let parser = EventParser::new();
        let schema = EventSchema {
            kind: EventKind::Upload,
            size_field: Some("size".into()),
            address_field: Some("daddr".into()),
        };
        let event = RawEvent {
            provider_key: PROVIDER_TCPIP,
            event_id: 10,
            process_id: 1234,
            timestamp: 9000,
            properties: prop(&[("size", "4096"), ("daddr", "93.184.216.34")]),
        };
        match parser.parse(&event, &schema) {
            ParsedEvent::Traffic(t) => {
                assert_eq!(t.process_id, 1234);
                assert_eq!(t.direction, Direction::Upload);
                assert_eq!(t.bytes, 4096);
                assert_eq!(t.remote_addr, Some("93.184.216.34".parse().unwrap()));
            }
            other => panic!("expected Traffic, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_traffic_event_missing_size_field_is_ignored() {
        let parser = EventParser::new();
        let schema = EventSchema {
            kind: EventKind::Download,
            size_field: None,
            address_field: None,
        };
        let event = RawEvent {
            provider_key: PROVIDER_TCPIP,
            event_id: 11,
            process_id: 1,
            timestamp: 1,
            properties: Default::default(),
        };
        assert!(matches!(parser.parse(&event, &schema), ParsedEvent::Ignored));
    }

    #[test]
    fn test_parse_traffic_event_with_zero_bytes_is_ignored() {
        let parser = EventParser::new();
        let schema = EventSchema {
            kind: EventKind::Upload,
            size_field: Some("size".into()),
            address_field: None,
        };
        let event = RawEvent {
            provider_key: PROVIDER_TCPIP,
            event_id: 10,
            process_id: 1,
            timestamp: 1,
            properties: prop(&[("size", "0")]),
        };
        assert!(matches!(parser.parse(&event, &schema), ParsedEvent::Ignored));
    }

    #[test]
    fn test_ipv4_to_string_round_trips_octet_wise() {
        let bytes = [93u8, 184, 216, 34];
        let rendered = ipv4_to_string(bytes);
        let parsed: std::net::Ipv4Addr = rendered.parse().expect("valid dotted quad");
        assert_eq!(parsed.octets(), bytes);
    }

    #[test]
    fn test_ipv6_to_string_is_39_chars_lowercase_zero_padded() {
        let bytes: [u8; 16] = [
            0x26, 0x06, 0x28, 0x00, 0x02, 0x20, 0x00, 0x01, 0x02, 0x48, 0x18, 0x93, 0x25, 0xc8,
            0x19, 0x46,
        ];
        let rendered = ipv6_to_string(bytes);
        assert_eq!(rendered.len(), 39);
        assert_eq!(rendered, "2606:2800:0220:0001:0248:1893:25c8:1946");
        assert!(rendered.chars().all(|c| c == ':' || (c.is_ascii_hexdigit() && !c.is_ascii_uppercase())));
    }

    #[test]
    fn test_parse_dns_observation_takes_first_address() {
        let parser = EventParser::new();
        let schema = EventSchema {
            kind: EventKind::Dns,
            size_field: None,
            address_field: None,
        };
        let event = RawEvent {
            provider_key: PROVIDER_DNS_CLIENT,
            event_id: 3008,
            process_id: 42,
            timestamp: 500,
            properties: prop(&[
                ("QueryName", "example.com"),
                ("QueryResults", "93.184.216.34;2606:2800:220:1:248:1893:25c8:1946"),
            ]),
        };
        match parser.parse(&event, &schema) {
            ParsedEvent::Dns(d) => {
                assert_eq!(d.domain, "example.com");
                assert_eq!(d.resolved_addr, "93.184.216.34".parse::<IpAddr>().unwrap());
            }
            other => panic!("expected Dns, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_dns_missing_query_name_is_ignored() {
        let parser = EventParser::new();
        let schema = EventSchema {
            kind: EventKind::Dns,
            size_field: None,
            address_field: None,
        };
        let event = RawEvent {
            provider_key: PROVIDER_DNS_CLIENT,
            event_id: 3001,
            process_id: 1,
            timestamp: 1,
            properties: prop(&[("Address", "10.0.0.1")]),
        };
        assert!(matches!(parser.parse(&event, &schema), ParsedEvent::Ignored));
    }
}
