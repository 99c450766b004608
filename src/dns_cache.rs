//! Reverse DNS observation cache: remote IP → last-seen domain name.
//!
//! Populated from passively observed DNS-Client resolution events (never an
//! active query of our own), so a given IP can legitimately flip domains
//! over time as CDNs rotate endpoints — last writer wins, matching
//! spec.md's explicit choice over keeping history.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

#[derive(Default)]
pub struct DnsReverseCache {
    map: Mutex<HashMap<IpAddr, String>>,
}

impl DnsReverseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `addr` resolved from `domain`. Overwrites any prior
    /// mapping for the same address.
    pub fn observe(&self, addr: IpAddr, domain: String) {
        self.map.lock().unwrap().insert(addr, domain);
    }

    /// Look up the most recently observed domain for `addr`, if any.
    pub fn domain_for(&self, addr: &IpAddr) -> Option<String> {
        self.map.lock().unwrap().get(addr).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
