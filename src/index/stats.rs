//! Per-index rolling query statistics.
//!
//! Recent history is kept as 100 ms buckets pruned past 15 minutes; the
//! full history additionally feeds a pair of histogram sketches so status
//! can answer 95/99th-percentile questions cheaply.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use hdrhistogram::Histogram;
use parking_lot::Mutex;

/// Bucket granularity for the rolling window.
pub const STATS_BUCKET_MS: u64 = 100;

/// Records older than this are pruned.
pub const STATS_WINDOW_MS: u64 = 15 * 60 * 1000;

fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
struct StatRecord {
    stamp_ms: u64,
    count: u64,
    rows_min: u64,
    rows_max: u64,
    rows_sum: u64,
    time_min: u64,
    time_max: u64,
    time_sum: u64,
}

struct StatsInner {
    records: VecDeque<StatRecord>,
    rows_hist: Histogram<u64>,
    time_hist: Histogram<u64>,
}

/// Rolling per-index query stats container.
pub struct QueryStats {
    inner: Mutex<StatsInner>,
}

impl QueryStats {
    pub fn new() -> QueryStats {
        QueryStats {
            inner: Mutex::new(StatsInner {
                records: VecDeque::new(),
                rows_hist: Histogram::new(3).expect("3 significant digits is valid"),
                time_hist: Histogram::new(3).expect("3 significant digits is valid"),
            }),
        }
    }

    /// Record one completed query: rows found and elapsed microseconds.
    pub fn record(&self, rows: u64, micros: u64) {
        self.record_at(wall_ms(), rows, micros);
    }

    fn record_at(&self, now_ms: u64, rows: u64, micros: u64) {
        let stamp = now_ms / STATS_BUCKET_MS;
        let mut inner = self.inner.lock();

        let cutoff = now_ms.saturating_sub(STATS_WINDOW_MS) / STATS_BUCKET_MS;
        while let Some(front) = inner.records.front() {
            if front.stamp_ms >= cutoff {
                break;
            }
            inner.records.pop_front();
        }

        let merged = match inner.records.back_mut() {
            Some(last) if last.stamp_ms == stamp => {
                last.count += 1;
                last.rows_min = last.rows_min.min(rows);
                last.rows_max = last.rows_max.max(rows);
                last.rows_sum += rows;
                last.time_min = last.time_min.min(micros);
                last.time_max = last.time_max.max(micros);
                last.time_sum += micros;
                true
            }
            _ => false,
        };
        if !merged {
            inner.records.push_back(StatRecord {
                stamp_ms: stamp,
                count: 1,
                rows_min: rows,
                rows_max: rows,
                rows_sum: rows,
                time_min: micros,
                time_max: micros,
                time_sum: micros,
            });
        }

        inner.rows_hist.saturating_record(rows);
        inner.time_hist.saturating_record(micros);
    }

    /// Coalesced view of the rolling window plus full-history percentiles.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(wall_ms())
    }

    fn snapshot_at(&self, now_ms: u64) -> StatsSnapshot {
        let inner = self.inner.lock();
        let cutoff = now_ms.saturating_sub(STATS_WINDOW_MS) / STATS_BUCKET_MS;

        let mut snap = StatsSnapshot::default();
        for rec in inner.records.iter().filter(|r| r.stamp_ms >= cutoff) {
            if snap.count == 0 {
                snap.rows_min = rec.rows_min;
                snap.time_min = rec.time_min;
            } else {
                snap.rows_min = snap.rows_min.min(rec.rows_min);
                snap.time_min = snap.time_min.min(rec.time_min);
            }
            snap.count += rec.count;
            snap.rows_max = snap.rows_max.max(rec.rows_max);
            snap.rows_sum += rec.rows_sum;
            snap.time_max = snap.time_max.max(rec.time_max);
            snap.time_sum += rec.time_sum;
        }
        snap.time_p95 = inner.time_hist.value_at_quantile(0.95);
        snap.time_p99 = inner.time_hist.value_at_quantile(0.99);
        snap.rows_p95 = inner.rows_hist.value_at_quantile(0.95);
        snap.rows_p99 = inner.rows_hist.value_at_quantile(0.99);
        snap
    }
}

impl Default for QueryStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregated stats over the 15-minute window, percentiles over the full
/// history.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub count: u64,
    pub rows_min: u64,
    pub rows_max: u64,
    pub rows_sum: u64,
    pub time_min: u64,
    pub time_max: u64,
    pub time_sum: u64,
    pub time_p95: u64,
    pub time_p99: u64,
    pub rows_p95: u64,
    pub rows_p99: u64,
}

impl StatsSnapshot {
    pub fn avg_time_us(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.time_sum / self.count
        }
    }

    pub fn avg_rows(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.rows_sum / self.count
        }
    }
}
