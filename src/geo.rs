//! Country-code lookup for remote addresses, via a rate-limited background
//! worker so the hot ingestion path never blocks on a network round trip.
//!
//! Four states per address: unknown (never looked up), pending (queued,
//! answer not back yet), resolved (have a country code), failed (the
//! lookup ran and didn't get a usable answer — spec.md's `"??"`). Local
//! addresses short-circuit to `"Local"` without ever touching the queue.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use governor::{Quota, RateLimiter};

pub const LOCAL_SENTINEL: &str = "Local";
pub const PENDING_SENTINEL: &str = "..";
pub const FAILED_SENTINEL: &str = "??";

#[derive(Debug, Clone, PartialEq, Eq)]
enum GeoState {
    Pending,
    Resolved(String),
    Failed,
}

fn is_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.octets()[0..2] == [169, 254] // link-local
        }
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Background GeoIP resolver. Cheap to query (`country_for`), cheap to
/// clone the handle (`Arc`-shared internally), one worker thread per
/// instance.
pub struct GeoLookup {
    cache: Arc<DashMap<IpAddr, GeoState>>,
    queue: Arc<(Mutex<VecDeque<IpAddr>>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl GeoLookup {
    /// Start the background worker. `throttle` is the minimum spacing
    /// between outbound requests (spec.md's geo throttle, default 1500ms).
    pub fn start(throttle: Duration) -> Self {
        let cache: Arc<DashMap<IpAddr, GeoState>> = Arc::new(DashMap::new());
        let queue = Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let cache_for_worker = Arc::clone(&cache);
        let queue_for_worker = Arc::clone(&queue);
        let shutdown_for_worker = Arc::clone(&shutdown);

        let worker = std::thread::Builder::new()
            .name("netwatch-geo".into())
            .spawn(move || worker_loop(cache_for_worker, queue_for_worker, shutdown_for_worker, throttle))
            .expect("failed to spawn geo lookup worker thread");

        Self {
            cache,
            queue,
            shutdown,
            worker: Some(worker),
        }
    }

    /// Return the best currently-known country code sentinel for `addr`,
    /// enqueueing a background lookup if one hasn't been started yet.
    /// Never blocks.
    pub fn country_for(&self, addr: IpAddr) -> String {
        if is_local(&addr) {
            return LOCAL_SENTINEL.to_string();
        }

        if let Some(state) = self.cache.get(&addr) {
            return match state.value() {
                GeoState::Resolved(code) => code.clone(),
                GeoState::Pending => PENDING_SENTINEL.to_string(),
                GeoState::Failed => FAILED_SENTINEL.to_string(),
            };
        }

        self.cache.insert(addr, GeoState::Pending);
        let (lock, cvar) = &*self.queue;
        lock.lock().unwrap().push_back(addr);
        cvar.notify_one();
        PENDING_SENTINEL.to_string()
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.queue.1.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GeoLookup {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    cache: Arc<DashMap<IpAddr, GeoState>>,
    queue: Arc<(Mutex<VecDeque<IpAddr>>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    throttle: Duration,
) {
    let quota = Quota::with_period(throttle).expect("geo throttle must be nonzero");
    let limiter = RateLimiter::direct(quota);
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("failed to build geo lookup http client");

    let (lock, cvar) = &*queue;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }

        let addr = {
            let mut q = lock.lock().unwrap();
            while q.is_empty() && !shutdown.load(Ordering::Relaxed) {
                q = cvar.wait(q).unwrap();
            }
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            q.pop_front()
        };

        let Some(addr) = addr else { continue };

        block_until_ready(&limiter);
        let result = fetch_country_code(&client, addr);
        let state = match result {
            Some(code) => GeoState::Resolved(code),
            None => GeoState::Failed,
        };
        cache.insert(addr, state);
    }
}

fn block_until_ready(limiter: &RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>) {
    loop {
        match limiter.check() {
            Ok(()) => return,
            Err(not_until) => {
                let wait = not_until.wait_time_from(governor::clock::DefaultClock::default().now());
                std::thread::sleep(wait);
            }
        }
    }
}

fn fetch_country_code(client: &reqwest::blocking::Client, addr: IpAddr) -> Option<String> {
    let url = format!("http://ip-api.com/line/{addr}?fields=countryCode");
    let response = client.get(&url).send().ok()?;
    if !response.status().is_success() {
        return None;
    }
    let body = response.text().ok()?;
    let code = body.trim();
    if code.is_empty() || code.eq_ignore_ascii_case("fail") {
        None
    } else {
        Some(code.to_string())
    }
}
