//! Per-host rolling health metrics.
//!
//! A dashboard owns the host identity (keyed `addr:port`) and a ring of 15
//! karma-period buckets. Host descriptors and mirror groups refer to the
//! dashboard through its key, never the other way around, so the ownership
//! graph stays acyclic.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use super::pool::ConnPool;

/// Health metrics aggregation window.
pub const KARMA_PERIOD_SECS: u64 = 60;

/// Ring depth: how many karma periods of history a dashboard keeps.
pub const KARMA_BUCKETS: usize = 15;

/// Wall-clock seconds since the epoch.
pub fn wall_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Raw outcome counters accumulated per bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub timeouts_query: u64,
    pub timeouts_connect: u64,
    pub connect_failures: u64,
    pub network_errors: u64,
    pub wrong_replies: u64,
    pub unexpected_close: u64,
    pub critical_warnings: u64,
    pub clean_successes: u64,
}

impl Counters {
    pub fn add(&mut self, o: &Counters) {
        self.timeouts_query += o.timeouts_query;
        self.timeouts_connect += o.timeouts_connect;
        self.connect_failures += o.connect_failures;
        self.network_errors += o.network_errors;
        self.wrong_replies += o.wrong_replies;
        self.unexpected_close += o.unexpected_close;
        self.critical_warnings += o.critical_warnings;
        self.clean_successes += o.clean_successes;
    }

    /// Sum of every failure counter.
    pub fn failures(&self) -> u64 {
        self.timeouts_query
            + self.timeouts_connect
            + self.connect_failures
            + self.network_errors
            + self.wrong_replies
            + self.unexpected_close
            + self.critical_warnings
    }

    pub fn total(&self) -> u64 {
        self.failures() + self.clean_successes
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    stamp: u64,
    counters: Counters,
    total_us: u64,
    conn_attempts: u64,
    total_connect_ms: u64,
    max_connect_ms: u64,
}

/// Coalesced view over the last N buckets.
#[derive(Debug, Clone, Copy, Default)]
pub struct DashSnapshot {
    pub counters: Counters,
    pub total_us: u64,
    pub conn_attempts: u64,
    pub total_connect_ms: u64,
    pub avg_connect_ms: u64,
    pub max_connect_ms: u64,
    pub errors_in_a_row: u64,
}

impl DashSnapshot {
    /// Mean per-query latency over the window, microseconds.
    pub fn avg_query_us(&self) -> u64 {
        let n = self.counters.total();
        if n == 0 { 0 } else { self.total_us / n }
    }
}

/// Rolling per-host health dashboard.
pub struct HostDashboard {
    key: String,
    ring: RwLock<[Bucket; KARMA_BUCKETS]>,
    errors_in_a_row: AtomicU64,
    last_query: AtomicU64,
    last_answer: AtomicU64,
    // Contention-hot monotonic totals, read lock-free by status handlers.
    total_queries: AtomicU64,
    total_conn_attempts: AtomicU64,
    pool: Option<ConnPool>,
}

impl HostDashboard {
    pub fn new(key: String, pool: Option<ConnPool>) -> Self {
        Self {
            key,
            ring: RwLock::new([Bucket::default(); KARMA_BUCKETS]),
            errors_in_a_row: AtomicU64::new(0),
            last_query: AtomicU64::new(0),
            last_answer: AtomicU64::new(0),
            total_queries: AtomicU64::new(0),
            total_conn_attempts: AtomicU64::new(0),
            pool,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pool(&self) -> Option<&ConnPool> {
        self.pool.as_ref()
    }

    /// Record a completed request outcome.
    pub fn record(&self, delta: &Counters, latency_us: u64, conn_attempts: u64, connect_ms: u64) {
        self.record_at(wall_secs(), delta, latency_us, conn_attempts, connect_ms);
    }

    fn record_at(
        &self,
        now_secs: u64,
        delta: &Counters,
        latency_us: u64,
        conn_attempts: u64,
        connect_ms: u64,
    ) {
        let stamp = now_secs / KARMA_PERIOD_SECS;
        {
            let mut ring = self.ring.write();
            let bucket = &mut ring[(stamp as usize) % KARMA_BUCKETS];
            if bucket.stamp != stamp {
                *bucket = Bucket {
                    stamp,
                    ..Bucket::default()
                };
            }
            bucket.counters.add(delta);
            bucket.total_us += latency_us;
            bucket.conn_attempts += conn_attempts;
            bucket.total_connect_ms += connect_ms;
            bucket.max_connect_ms = bucket.max_connect_ms.max(connect_ms);
        }

        self.total_queries
            .fetch_add(delta.total(), Ordering::Relaxed);
        self.total_conn_attempts
            .fetch_add(conn_attempts, Ordering::Relaxed);
        self.last_query.store(now_secs, Ordering::Relaxed);

        if delta.clean_successes > 0 {
            self.errors_in_a_row.store(0, Ordering::Relaxed);
            self.last_answer.store(now_secs, Ordering::Relaxed);
        } else if delta.failures() > 0 {
            self.errors_in_a_row
                .fetch_add(delta.failures(), Ordering::Relaxed);
        }
    }

    /// Coalesce the freshest `periods` buckets.
    pub fn snapshot(&self, periods: usize) -> DashSnapshot {
        self.snapshot_at(wall_secs(), periods)
    }

    fn snapshot_at(&self, now_secs: u64, periods: usize) -> DashSnapshot {
        let now_stamp = now_secs / KARMA_PERIOD_SECS;
        let periods = periods.min(KARMA_BUCKETS) as u64;
        let mut snap = DashSnapshot {
            errors_in_a_row: self.errors_in_a_row.load(Ordering::Relaxed),
            ..DashSnapshot::default()
        };
        let ring = self.ring.read();
        for bucket in ring.iter() {
            if bucket.stamp + periods > now_stamp && bucket.stamp <= now_stamp {
                snap.counters.add(&bucket.counters);
                snap.total_us += bucket.total_us;
                snap.conn_attempts += bucket.conn_attempts;
                snap.total_connect_ms += bucket.total_connect_ms;
                snap.max_connect_ms = snap.max_connect_ms.max(bucket.max_connect_ms);
            }
        }
        if snap.conn_attempts > 0 {
            snap.avg_connect_ms = snap.total_connect_ms / snap.conn_attempts;
        }
        snap
    }

    pub fn errors_in_a_row(&self) -> u64 {
        self.errors_in_a_row.load(Ordering::Relaxed)
    }

    /// A host with a live failure streak is treated as in retry state.
    pub fn in_retry_state(&self) -> bool {
        self.errors_in_a_row() > 0
    }

    pub fn total_queries(&self) -> u64 {
        self.total_queries.load(Ordering::Relaxed)
    }

    pub fn total_conn_attempts(&self) -> u64 {
        self.total_conn_attempts.load(Ordering::Relaxed)
    }

    pub fn last_query_secs(&self) -> u64 {
        self.last_query.load(Ordering::Relaxed)
    }

    pub fn last_answer_secs(&self) -> u64 {
        self.last_answer.load(Ordering::Relaxed)
    }
}

/// Process-wide dashboard registry, keyed by `addr:port` (or unix path).
///
/// The registry is the canonical owner of host identity; descriptors and
/// groups hold `Arc`s obtained here.
#[derive(Default)]
pub struct DashboardRegistry {
    map: RwLock<HashMap<String, Arc<HostDashboard>>>,
}

impl DashboardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the dashboard for a host key, creating it on first sight.
    /// `pool_capacity` > 0 attaches a persistent pool on creation.
    pub fn get_or_create(&self, key: &str, pool_capacity: usize) -> Arc<HostDashboard> {
        if let Some(dash) = self.map.read().get(key) {
            return Arc::clone(dash);
        }
        let mut map = self.map.write();
        Arc::clone(map.entry(key.to_string()).or_insert_with(|| {
            let pool = (pool_capacity > 0).then(|| ConnPool::new(pool_capacity));
            Arc::new(HostDashboard::new(key.to_string(), pool))
        }))
    }

    pub fn get(&self, key: &str) -> Option<Arc<HostDashboard>> {
        self.map.read().get(key).cloned()
    }

    pub fn all(&self) -> Vec<Arc<HostDashboard>> {
        self.map.read().values().cloned().collect()
    }

    /// Shut down every persistent pool. Part of daemon teardown.
    pub fn shutdown_pools(&self) {
        for dash in self.map.read().values() {
            if let Some(pool) = dash.pool() {
                pool.shutdown();
            }
        }
    }
}
