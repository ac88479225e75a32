//! Latency recording and export.
//!
//! Every latency distribution lives in a log-compressed HdrHistogram (three
//! significant figures, 1 ns .. 10 s). Counters on the hot path are plain
//! atomics; the histograms do their own locking so recording from several
//! threads stays safe without an outer mutex order to think about.

use crate::time::{ns_to_us, Timestamp};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const HIGHEST_TRACKABLE_NS: u64 = 10_000_000_000;
const SIGNIFICANT_FIGURES: u8 = 3;

/// Maximum workers a collector partitions latencies across.
pub const MAX_WORKERS: usize = 16;

/// Thread-safe wrapper around one HdrHistogram of nanosecond latencies.
pub struct LatencyHistogram {
    hist: Mutex<Histogram<u64>>,
}

impl LatencyHistogram {
    pub fn new() -> LatencyHistogram {
        let hist = Histogram::new_with_bounds(1, HIGHEST_TRACKABLE_NS, SIGNIFICANT_FIGURES)
            .expect("histogram bounds are static");
        LatencyHistogram {
            hist: Mutex::new(hist),
        }
    }

    /// Record one latency. Values are clamped into the trackable range; the
    /// lower bound of HdrHistogram is 1, so zero becomes 1 ns.
    pub fn record(&self, value_ns: u64) {
        let clamped = value_ns.clamp(1, HIGHEST_TRACKABLE_NS);
        self.hist.lock().record(clamped).ok();
    }

    /// Value at percentile `p` in [0, 100], in nanoseconds.
    pub fn percentile(&self, p: f64) -> u64 {
        self.hist.lock().value_at_quantile(p / 100.0)
    }

    pub fn count(&self) -> u64 {
        self.hist.lock().len()
    }

    pub fn mean_ns(&self) -> f64 {
        self.hist.lock().mean()
    }

    pub fn max_ns(&self) -> u64 {
        self.hist.lock().max()
    }

    pub fn merge_from(&self, other: &LatencyHistogram) {
        let other = other.hist.lock().clone();
        self.hist.lock().add(other).ok();
    }

    pub fn reset(&self) {
        self.hist.lock().reset();
    }

    /// One-line summary in microseconds, mirroring what gets logged at
    /// shutdown.
    pub fn summary_line(&self, name: &str) -> String {
        format!(
            "[{}] count={} mean={:.2}us p50={:.2}us p99={:.2}us p99.9={:.2}us p99.99={:.2}us max={:.2}us",
            name,
            self.count(),
            self.mean_ns() / 1_000.0,
            ns_to_us(self.percentile(50.0)),
            ns_to_us(self.percentile(99.0)),
            ns_to_us(self.percentile(99.9)),
            ns_to_us(self.percentile(99.99)),
            ns_to_us(self.max_ns()),
        )
    }

    /// CDF as CSV: `percentile,latency_ns,latency_us`.
    pub fn export_cdf(&self, path: &Path, points: usize) -> std::io::Result<()> {
        let mut out = fs::File::create(path)?;
        writeln!(out, "percentile,latency_ns,latency_us")?;
        let hist = self.hist.lock();
        for i in 0..=points {
            let p = i as f64 / points as f64;
            let v = hist.value_at_quantile(p);
            writeln!(out, "{},{},{}", p * 100.0, v, v as f64 / 1_000.0)?;
        }
        Ok(())
    }

    /// Raw recorded-value snapshot: `value_ns,count,cumulative_percent`.
    pub fn export_snapshot(&self, path: &Path) -> std::io::Result<()> {
        let mut out = fs::File::create(path)?;
        writeln!(out, "value_ns,count,cumulative_percent")?;
        let hist = self.hist.lock();
        let total = hist.len().max(1);
        let mut cumulative = 0u64;
        for v in hist.iter_recorded() {
            cumulative += v.count_at_value();
            writeln!(
                out,
                "{},{},{:.4}",
                v.value_iterated_to(),
                v.count_at_value(),
                100.0 * cumulative as f64 / total as f64
            )?;
        }
        Ok(())
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Shutdown summary serialised next to the plain-text report.
#[derive(Debug, Serialize)]
pub struct Summary {
    pub total_requests: u64,
    pub deadline_misses: u64,
    pub miss_rate: f64,
    pub p50_us: f64,
    pub p99_us: f64,
    pub p999_us: f64,
    pub p9999_us: f64,
    pub mean_us: f64,
}

/// Per-component metrics: end-to-end latency (client domain), dispatch
/// decision time (LB), local service time (worker), partitioned per-worker
/// distributions, and the global hit/miss counters.
pub struct MetricsCollector {
    e2e: LatencyHistogram,
    decision: LatencyHistogram,
    service: LatencyHistogram,
    per_worker: Vec<LatencyHistogram>,
    total_requests: AtomicU64,
    deadline_misses: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> MetricsCollector {
        MetricsCollector {
            e2e: LatencyHistogram::new(),
            decision: LatencyHistogram::new(),
            service: LatencyHistogram::new(),
            per_worker: (0..MAX_WORKERS).map(|_| LatencyHistogram::new()).collect(),
            total_requests: AtomicU64::new(0),
            deadline_misses: AtomicU64::new(0),
        }
    }

    pub fn record_e2e(&self, latency_ns: u64, worker_id: u8, deadline_missed: bool) {
        self.e2e.record(latency_ns);
        self.per_worker[worker_id as usize % MAX_WORKERS].record(latency_ns);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if deadline_missed {
            self.deadline_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a miss that never produced a latency sample (drop, timeout).
    pub fn record_lost(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.deadline_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision(&self, decision_ns: u64) {
        self.decision.record(decision_ns);
    }

    pub fn record_service(&self, service_ns: u64) {
        self.service.record(service_ns);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn deadline_misses(&self) -> u64 {
        self.deadline_misses.load(Ordering::Relaxed)
    }

    pub fn miss_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        self.deadline_misses() as f64 / total as f64
    }

    pub fn e2e(&self) -> &LatencyHistogram {
        &self.e2e
    }

    pub fn decision(&self) -> &LatencyHistogram {
        &self.decision
    }

    pub fn service(&self) -> &LatencyHistogram {
        &self.service
    }

    pub fn worker(&self, worker_id: u8) -> &LatencyHistogram {
        &self.per_worker[worker_id as usize % MAX_WORKERS]
    }

    /// Drop everything recorded so far; used at warmup end.
    pub fn reset(&self) {
        self.e2e.reset();
        self.decision.reset();
        self.service.reset();
        for h in &self.per_worker {
            h.reset();
        }
        self.total_requests.store(0, Ordering::Relaxed);
        self.deadline_misses.store(0, Ordering::Relaxed);
    }

    pub fn summary(&self) -> Summary {
        Summary {
            total_requests: self.total_requests(),
            deadline_misses: self.deadline_misses(),
            miss_rate: self.miss_rate(),
            p50_us: ns_to_us(self.e2e.percentile(50.0)),
            p99_us: ns_to_us(self.e2e.percentile(99.0)),
            p999_us: ns_to_us(self.e2e.percentile(99.9)),
            p9999_us: ns_to_us(self.e2e.percentile(99.99)),
            mean_us: self.e2e.mean_ns() / 1_000.0,
        }
    }

    /// Write the full export set into `dir`: overall and per-worker CDFs, a
    /// raw snapshot, and the plain-text plus JSON summaries.
    pub fn export_all(&self, dir: &Path) -> std::io::Result<()> {
        fs::create_dir_all(dir)?;
        self.e2e.export_cdf(&dir.join("e2e_cdf.csv"), 10_000)?;
        self.e2e.export_snapshot(&dir.join("e2e_histogram.csv"))?;
        if self.decision.count() > 0 {
            self.decision.export_cdf(&dir.join("decision_cdf.csv"), 10_000)?;
        }
        if self.service.count() > 0 {
            self.service.export_cdf(&dir.join("service_cdf.csv"), 10_000)?;
        }
        for (i, hist) in self.per_worker.iter().enumerate() {
            if hist.count() > 0 {
                hist.export_cdf(&dir.join(format!("worker_{i}_cdf.csv")), 1_000)?;
            }
        }

        let summary = self.summary();
        let mut text = fs::File::create(dir.join("summary.txt"))?;
        writeln!(text, "Total Requests: {}", summary.total_requests)?;
        writeln!(text, "Deadline Misses: {}", summary.deadline_misses)?;
        writeln!(text, "Deadline Miss Rate: {:.4}%", summary.miss_rate * 100.0)?;
        writeln!(text, "P50 Latency (us): {:.2}", summary.p50_us)?;
        writeln!(text, "P99 Latency (us): {:.2}", summary.p99_us)?;
        writeln!(text, "P99.9 Latency (us): {:.2}", summary.p999_us)?;
        writeln!(text, "P99.99 Latency (us): {:.2}", summary.p9999_us)?;

        let json = serde_json::to_string_pretty(&summary)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        fs::write(dir.join("summary.json"), json)?;
        Ok(())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

const THROUGHPUT_WINDOW: usize = 10;
const THROUGHPUT_BUCKET_NS: u64 = 100_000_000;

/// Sliding-window requests-per-second counter: ten 100 ms buckets updated
/// with atomic adds on the completion path.
pub struct ThroughputCounter {
    buckets: [AtomicU64; THROUGHPUT_WINDOW],
    last_bucket: AtomicUsize,
}

impl ThroughputCounter {
    pub fn new() -> ThroughputCounter {
        ThroughputCounter {
            buckets: Default::default(),
            last_bucket: AtomicUsize::new(0),
        }
    }

    pub fn record(&self, now: Timestamp) {
        let bucket = ((now / THROUGHPUT_BUCKET_NS) as usize) % THROUGHPUT_WINDOW;
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        if self.last_bucket.swap(bucket, Ordering::Relaxed) != bucket {
            // Entering a new bucket: clear the one that will be reused next.
            self.buckets[(bucket + 1) % THROUGHPUT_WINDOW].store(0, Ordering::Relaxed);
        }
    }

    pub fn rps(&self) -> f64 {
        let total: u64 = self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum();
        let window_sec = (THROUGHPUT_WINDOW as u64 * THROUGHPUT_BUCKET_NS) as f64 / 1e9;
        total as f64 / window_sec
    }
}

impl Default for ThroughputCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_are_monotonic() {
        let hist = LatencyHistogram::new();
        for i in 1..=10_000u64 {
            hist.record(i * 1_000);
        }
        assert!(hist.percentile(50.0) <= hist.percentile(99.0));
        assert!(hist.percentile(99.0) <= hist.percentile(99.9));
        assert_eq!(hist.count(), 10_000);
    }

    #[test]
    fn miss_rate_is_misses_over_total() {
        let m = MetricsCollector::new();
        for i in 0..100 {
            m.record_e2e(1_000, 0, i % 10 == 0);
        }
        assert_eq!(m.total_requests(), 100);
        assert_eq!(m.deadline_misses(), 10);
        assert!((m.miss_rate() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn lost_requests_count_as_misses() {
        let m = MetricsCollector::new();
        m.record_e2e(1_000, 0, false);
        m.record_lost();
        assert_eq!(m.total_requests(), 2);
        assert_eq!(m.deadline_misses(), 1);
    }

    #[test]
    fn reset_clears_everything() {
        let m = MetricsCollector::new();
        m.record_e2e(5_000, 1, true);
        m.record_decision(100);
        m.reset();
        assert_eq!(m.total_requests(), 0);
        assert_eq!(m.e2e().count(), 0);
        assert_eq!(m.decision().count(), 0);
    }

    #[test]
    fn per_worker_partitioning() {
        let m = MetricsCollector::new();
        m.record_e2e(1_000, 2, false);
        m.record_e2e(2_000, 2, false);
        m.record_e2e(3_000, 5, false);
        assert_eq!(m.worker(2).count(), 2);
        assert_eq!(m.worker(5).count(), 1);
        assert_eq!(m.worker(0).count(), 0);
    }

    #[test]
    fn throughput_counts_recent_window() {
        let t = ThroughputCounter::new();
        let now = crate::time::now_ns();
        for _ in 0..500 {
            t.record(now);
        }
        // 500 completions inside a 1 s window -> 500 rps.
        assert!((t.rps() - 500.0).abs() < 1.0);
    }

    #[test]
    fn export_writes_expected_files() {
        let dir = tempfile::tempdir().unwrap();
        let m = MetricsCollector::new();
        m.record_e2e(10_000, 0, false);
        m.record_decision(500);
        m.export_all(dir.path()).unwrap();
        assert!(dir.path().join("e2e_cdf.csv").exists());
        assert!(dir.path().join("decision_cdf.csv").exists());
        assert!(dir.path().join("worker_0_cdf.csv").exists());
        assert!(dir.path().join("summary.txt").exists());
        assert!(dir.path().join("summary.json").exists());
    }
}
