//! Process id → display name resolution, memoized forever.
//!
//! Pids are never reused meaningfully within the lifetime a cache entry
//! matters for here (a stale name for a recycled pid is a cosmetic issue,
//! not a correctness one — spec.md accepts this), so entries are never
//! evicted. Two well-known pids are special-cased the way every Windows
//! process tool does: 0 is the idle "process" and 4 is the kernel.

use dashmap::DashMap;
use sysinfo::{Pid, System};

const PID_SYSTEM_IDLE: u32 = 0;
const PID_SYSTEM: u32 = 4;

/// Memoized pid → process name table, backed by a point query against the
/// OS with a full-snapshot fallback for processes that raced the point
/// query (newly spawned, or the direct query's access was denied).
pub struct ProcessNameCache {
    names: DashMap<u32, String>,
}

impl Default for ProcessNameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessNameCache {
    pub fn new() -> Self {
        Self {
            names: DashMap::new(),
        }
    }

    /// Resolve `pid` to a display name, querying the OS and caching the
    /// result on first lookup. Never returns `None` — an unresolvable pid
    /// still gets a `"[PID:<n>]"` placeholder so callers never need an
    /// `Option`.
    pub fn resolve(&self, pid: u32) -> String {
        if let Some(name) = self.names.get(&pid) {
            return name.clone();
        }

        let name = match pid {
            PID_SYSTEM_IDLE => "System Idle".to_string(),
            PID_SYSTEM => "System".to_string(),
            _ => self
                .query_os(pid)
                .unwrap_or_else(|| format!("[PID:{pid}]")),
        };

        self.names.insert(pid, name.clone());
        name
    }

    /// Pre-seed the cache for a pid whose name is already known (e.g. from
    /// a batched snapshot refresh) without going through `resolve`'s
    /// per-pid OS query.
    pub fn seed(&self, pid: u32, name: String) {
        self.names.entry(pid).or_insert(name);
    }

    fn query_os(&self, pid: u32) -> Option<String> {
        let mut system = System::new();
        let sys_pid = Pid::from_u32(pid);
        if system.refresh_process(sys_pid) {
            return system
                .process(sys_pid)
                .map(|p| p.name().to_string_lossy().into_owned());
        }

        // The point query missed (process spawned since our last refresh, or
        // access denied to a single-pid query); fall back to a full snapshot
        // and seed every process it found, not just the one we were asked
        // for, so the next miss for a sibling pid is already warm.
        system.refresh_all();
        for (sys_pid, process) in system.processes() {
            self.seed(sys_pid.as_u32(), process.name().to_string_lossy().into_owned());
        }
        self.names.get(&pid).map(|name| name.clone())
    }
}
