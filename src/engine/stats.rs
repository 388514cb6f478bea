// Interception statistics: cache hits, forwarded misses, bytes served offline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

struct StatsSample {
    at: Instant,
    serve_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub full_hits: u64,
    pub partial_hits: u64,
    pub not_satisfiable: u64,
    pub misses: u64,
    pub ignored: u64,
    pub served_bytes: u64,
    pub serve_bps: u64,
    pub cache_hit_rate: f64,
}

pub struct InterceptStats {
    full_hits: AtomicU64,
    partial_hits: AtomicU64,
    not_satisfiable: AtomicU64,
    misses: AtomicU64,
    ignored: AtomicU64,
    served_bytes: AtomicU64,
    last_sample: Mutex<StatsSample>,
}

impl InterceptStats {
    pub fn new() -> Self {
        Self {
            full_hits: AtomicU64::new(0),
            partial_hits: AtomicU64::new(0),
            not_satisfiable: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            served_bytes: AtomicU64::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                serve_bytes: 0,
            }),
        }
    }

    pub fn record_full_hit(&self, bytes: u64) {
        self.full_hits.fetch_add(1, Ordering::Relaxed);
        self.served_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_partial_hit(&self, bytes: u64) {
        self.partial_hits.fetch_add(1, Ordering::Relaxed);
        self.served_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_not_satisfiable(&self) {
        self.not_satisfiable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        let current_serve = self.served_bytes.load(Ordering::Relaxed);

        let serve_bps = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();
            // A concurrent snapshot may have stored a newer count than ours.
            let delta = current_serve.saturating_sub(sample.serve_bytes);
            let bps = if elapsed > 0.1 {
                (delta as f64 / elapsed) as u64
            } else {
                0
            };
            if current_serve >= sample.serve_bytes {
                sample.at = now;
                sample.serve_bytes = current_serve;
            }
            bps
        };

        let full_hits = self.full_hits.load(Ordering::Relaxed);
        let partial_hits = self.partial_hits.load(Ordering::Relaxed);
        let not_satisfiable = self.not_satisfiable.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        let hits = full_hits + partial_hits + not_satisfiable;
        let tile_requests = hits + misses;
        let cache_hit_rate = if tile_requests > 0 {
            hits as f64 / tile_requests as f64
        } else {
            0.0
        };

        StatsSnapshot {
            full_hits,
            partial_hits,
            not_satisfiable,
            misses,
            ignored: self.ignored.load(Ordering::Relaxed),
            served_bytes: current_serve,
            serve_bps,
            cache_hit_rate,
        }
    }
}

impl Default for InterceptStats {
    fn default() -> Self {
        Self::new()
    }
}
