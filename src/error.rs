//! Unified error type for every fallible public operation in the pipeline.
//!
//! `NetwatchError` is the single error type returned across module boundaries.
//! It serializes as `{ "kind": "...", "message": "..." }` so a future caller
//! (a diagnostics endpoint, a log line) can distinguish error categories
//! without string-matching on the message.

use serde::ser::SerializeStruct;

/// Top-level error for the trace/aggregate/persist/analyze pipeline.
///
/// Each variant maps to a distinct failure domain from spec.md §7: fatal
/// startup errors surface as `Trace`/`Database`, transient per-event failures
/// are generally swallowed and logged rather than propagated this way.
#[derive(Debug, thiserror::Error)]
pub enum NetwatchError {
    /// Errors originating from SQLite / the persistent store.
    #[error("{0}")]
    Database(String),

    /// Errors from the kernel trace session (start/enable/open/process).
    #[error("{0}")]
    Trace(String),

    /// Errors from the GeoIP lookup worker (HTTP, rate limiting).
    #[error("{0}")]
    Geo(String),

    /// I/O and OS-level errors.
    #[error("{0}")]
    Io(String),

    /// Invalid or missing configuration / input.
    #[error("{0}")]
    InvalidInput(String),
}

impl NetwatchError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            NetwatchError::Database(_) => "Database",
            NetwatchError::Trace(_) => "Trace",
            NetwatchError::Geo(_) => "Geo",
            NetwatchError::Io(_) => "Io",
            NetwatchError::InvalidInput(_) => "InvalidInput",
        }
    }
}

impl serde::Serialize for NetwatchError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("NetwatchError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<anyhow::Error> for NetwatchError {
    fn from(err: anyhow::Error) -> Self {
        NetwatchError::Trace(err.to_string())
    }
}

impl From<std::io::Error> for NetwatchError {
    fn from(err: std::io::Error) -> Self {
        NetwatchError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for NetwatchError {
    fn from(err: rusqlite::Error) -> Self {
        NetwatchError::Database(err.to_string())
    }
}
