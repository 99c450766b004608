//! Kernel trace session lifecycle.
//!
//! Wraps a real-time ETW session covering the TCPIP, DNS-Client, and
//! Kernel-Network providers. Starting a session force-stops any
//! previously-leaked session of the same name (a prior crashed run can
//! leave a kernel-mode trace running with no user-mode owner), enables the
//! three providers at `TRACE_LEVEL_INFORMATION` with the all-keywords mask,
//! and hands every delivered event to an `EventParser` before forwarding the
//! classified result to a caller-supplied sink.

pub mod diagnostics;
pub mod parser;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::NetwatchError;
use diagnostics::TraceDiagnostics;
use parser::{EventParser, ParsedEvent, PROVIDER_DNS_CLIENT, PROVIDER_KERNEL_NETWORK, PROVIDER_TCPIP};

/// Name the trace session is registered under. Re-used to force-stop a
/// leaked session before starting a fresh one.
pub const TRACE_SESSION_NAME: &str = "netwatch-trace";

/// Handle to a running (or stopped) kernel trace session.
pub struct TraceSession {
    running: Arc<AtomicBool>,
    diagnostics: Arc<TraceDiagnostics>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl TraceSession {
    pub fn diagnostics(&self) -> Arc<TraceDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Start a real-time trace session and begin forwarding classified
    /// events to `sink`. `sink` runs on the trace's own worker thread —
    /// keep it fast; heavy work belongs in the aggregator it feeds.
    #[cfg(windows)]
    pub fn start(
        diagnostics: Arc<TraceDiagnostics>,
        sink: impl FnMut(ParsedEvent) + Send + 'static,
    ) -> Result<Self, NetwatchError> {
        windows_impl::start(diagnostics, sink)
    }

    #[cfg(not(windows))]
    pub fn start(
        _diagnostics: Arc<TraceDiagnostics>,
        _sink: impl FnMut(ParsedEvent) + Send + 'static,
    ) -> Result<Self, NetwatchError> {
        Err(NetwatchError::Trace(
            "kernel trace ingestion is only available on Windows".into(),
        ))
    }

    /// Stop the session and join its worker thread. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        #[cfg(windows)]
        windows_impl::signal_stop();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use ferrisetw::parser::Parser;
    use ferrisetw::provider::Provider;
    use ferrisetw::schema_locator::SchemaLocator;
    use ferrisetw::trace::{stop_trace_by_name, TraceTrait, UserTrace};
    use ferrisetw::EventRecord;
    use parser::RawEvent;
    use std::sync::Mutex;
    use windows::core::GUID;

    static STOP_REQUESTED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

    pub fn signal_stop() {
        STOP_REQUESTED.store(true, Ordering::Relaxed);
    }

    fn guid_from_data1(data1: u32) -> GUID {
        // The three providers this session cares about are distinguished
        // entirely by Data1; the remaining fields are each provider's real,
        // fixed GUID tail and are filled in by `provider_guid` below.
        provider_guid(data1)
    }

    fn provider_guid(data1: u32) -> GUID {
        match data1 {
            PROVIDER_TCPIP => GUID::from_values(
                0x2f07e2ee, 0x15db, 0x40f1,
                [0x90, 0xef, 0x9d, 0x7b, 0xa2, 0x82, 0x18, 0x8a],
            ),
            PROVIDER_DNS_CLIENT => GUID::from_values(
                0x1c95126e, 0x7eea, 0x49a9,
                [0xa3, 0xfe, 0xa3, 0x78, 0xb0, 0x3d, 0xdb, 0x4d],
            ),
            PROVIDER_KERNEL_NETWORK => GUID::from_values(
                0x7dd42a49, 0x5329, 0x4832,
                [0x8d, 0xfd, 0x43, 0xd9, 0x79, 0x15, 0x3a, 0x88],
            ),
            _ => unreachable!("only the three monitored providers are registered"),
        }
    }

    pub fn start(
        diagnostics: Arc<TraceDiagnostics>,
        sink: impl FnMut(ParsedEvent) + Send + 'static,
    ) -> Result<TraceSession, NetwatchError> {
        STOP_REQUESTED.store(false, Ordering::Relaxed);
        // A previous process may have crashed without tearing down its
        // session; ETW leaves it running kernel-side until force-stopped.
        let _ = stop_trace_by_name(TRACE_SESSION_NAME);

        let event_parser = Arc::new(EventParser::new());
        // `Provider::add_callback` takes the callback by value and is
        // called once per provider below, so the closure needs to be
        // `Clone`. A bare `Mutex<F>` isn't — wrap it in an `Arc` and clone
        // that instead of the closure itself.
        let sink = Arc::new(Mutex::new(sink));
        let diag_for_cb = Arc::clone(&diagnostics);
        let parser_for_cb = Arc::clone(&event_parser);

        let callback = move |record: &EventRecord, locator: &SchemaLocator| {
            let raw = match to_raw_event(record, locator) {
                Some(r) => r,
                None => {
                    diag_for_cb.set_last_parse_error("failed to locate schema for event".into());
                    return;
                }
            };
            diag_for_cb.record(&raw);

            let property_names: Vec<String> = raw.properties.keys().cloned().collect();
            let task_opcode = format!("{:?}", record.opcode());
            let schema = parser_for_cb.schema_for(raw.provider_key, raw.event_id, || {
                parser::classify_schema(raw.provider_key, raw.event_id, &task_opcode, &property_names)
            });

            let parsed = parser_for_cb.parse(&raw, &schema);
            if let ParsedEvent::Ignored = parsed {
                return;
            }
            (sink.lock().unwrap())(parsed);
        };

        let provider = |data1: u32| {
            Provider::by_guid(guid_from_data1(data1))
                .add_callback(callback.clone())
                .build()
        };

        let trace = UserTrace::new()
            .named(TRACE_SESSION_NAME.to_string())
            .enable(provider(PROVIDER_TCPIP))
            .enable(provider(PROVIDER_DNS_CLIENT))
            .enable(provider(PROVIDER_KERNEL_NETWORK));

        let running = Arc::new(AtomicBool::new(true));
        let running_for_thread = Arc::clone(&running);
        let diag_for_errors = Arc::clone(&diagnostics);

        let worker = std::thread::Builder::new()
            .name("netwatch-trace".into())
            .spawn(move || match trace.start() {
                Ok((mut started, _handle)) => {
                    // Blocks until the session is stopped.
                    if let Err(e) = started.process() {
                        diag_for_errors
                            .start_errors
                            .process_trace
                            .store(1, Ordering::Relaxed);
                        tracing::error!("ETW process loop ended with error: {e:?}");
                    }
                    running_for_thread.store(false, Ordering::Relaxed);
                }
                Err(e) => {
                    diag_for_errors
                        .start_errors
                        .start_trace
                        .store(1, Ordering::Relaxed);
                    tracing::error!("failed to start ETW trace session: {e:?}");
                    running_for_thread.store(false, Ordering::Relaxed);
                }
            })
            .map_err(|e| NetwatchError::Trace(format!("failed to spawn trace thread: {e}")))?;

        Ok(TraceSession {
            running,
            diagnostics,
            worker: Some(worker),
        })
    }

    fn to_raw_event(record: &EventRecord, locator: &SchemaLocator) -> Option<RawEvent> {
        let schema = locator.event_schema(record).ok()?;
        let parser = Parser::create(record, &schema);
        let mut properties = std::collections::BTreeMap::new();
        for prop in schema.properties() {
            let looks_like_address =
                prop.name.contains("Addr") || prop.name == "daddr" || prop.name == "RemoteAddress";
            // Addresses arrive as a raw byte blob; rendering them is our own
            // job (see `parser::ipv4_to_string`/`ipv6_to_string`), not the
            // schema locator's. Everything else is read as its natural
            // string representation.
            let value = if looks_like_address {
                parser
                    .try_parse::<Vec<u8>>(&prop.name)
                    .ok()
                    .and_then(|bytes| render_address_bytes(&bytes))
                    .or_else(|| parser.try_parse::<String>(&prop.name).ok())
            } else {
                parser.try_parse::<String>(&prop.name).ok()
            };
            if let Some(value) = value {
                properties.insert(prop.name.clone(), value);
            }
        }

        Some(RawEvent {
            provider_key: schema.provider_guid().data1,
            event_id: record.event_id(),
            process_id: record.process_id(),
            timestamp: record.timestamp(),
            properties,
        })
    }

    fn render_address_bytes(bytes: &[u8]) -> Option<String> {
        match bytes.len() {
            4 => Some(parser::ipv4_to_string(bytes.try_into().unwrap())),
            16 => Some(parser::ipv6_to_string(bytes.try_into().unwrap())),
            _ => None,
        }
    }
}
