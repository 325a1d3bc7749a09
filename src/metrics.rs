use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LATENCY_SAMPLES: usize = 1000;

/// Recent transform latencies, bounded to the last `limit` measurements
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    recent: Arc<Mutex<VecDeque<u64>>>,
    limit: usize,
}

impl LatencyTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(limit))),
            limit: limit.max(1),
        }
    }

    /// Record one transform duration
    pub fn record(&self, elapsed: Duration) {
        let mut recent = self.recent.lock();
        if recent.len() == self.limit {
            recent.pop_front();
        }
        recent.push_back(elapsed.as_nanos() as u64);
    }

    /// Latency at quantile `q` (0.0..=1.0) in microseconds, 0 when empty
    pub fn quantile_us(&self, q: f64) -> f64 {
        let mut sorted: Vec<u64> = self.recent.lock().iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64 * q).ceil() as usize).clamp(1, sorted.len());
        sorted[rank - 1] as f64 / 1000.0
    }

    pub fn len(&self) -> usize {
        self.recent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.lock().is_empty()
    }
}

/// Window counters and transform latency for one stage
///
/// Clones share the same counters, so the assembler can keep a copy while
/// the stage thread records into its own.
#[derive(Debug, Clone)]
pub struct StageMetrics {
    windows_read: Arc<AtomicU64>,
    windows_emitted: Arc<AtomicU64>,
    /// Emitted while no consumer was registered
    windows_discarded: Arc<AtomicU64>,
    read_waits: Arc<AtomicU64>,
    write_waits: Arc<AtomicU64>,
    latency: LatencyTracker,
    started: Instant,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            windows_read: Arc::new(AtomicU64::new(0)),
            windows_emitted: Arc::new(AtomicU64::new(0)),
            windows_discarded: Arc::new(AtomicU64::new(0)),
            read_waits: Arc::new(AtomicU64::new(0)),
            write_waits: Arc::new(AtomicU64::new(0)),
            latency: LatencyTracker::new(LATENCY_SAMPLES),
            started: Instant::now(),
        }
    }

    pub fn record_read(&self) {
        self.windows_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.windows_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.windows_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_waits(&self, waits: u64) {
        self.read_waits.fetch_add(waits, Ordering::Relaxed);
    }

    pub fn record_write_waits(&self, waits: u64) {
        self.write_waits.fetch_add(waits, Ordering::Relaxed);
    }

    pub fn record_latency(&self, elapsed: Duration) {
        self.latency.record(elapsed);
    }

    pub fn windows_read(&self) -> u64 {
        self.windows_read.load(Ordering::Relaxed)
    }

    pub fn windows_emitted(&self) -> u64 {
        self.windows_emitted.load(Ordering::Relaxed)
    }

    pub fn windows_discarded(&self) -> u64 {
        self.windows_discarded.load(Ordering::Relaxed)
    }

    pub fn read_waits(&self) -> u64 {
        self.read_waits.load(Ordering::Relaxed)
    }

    pub fn write_waits(&self) -> u64 {
        self.write_waits.load(Ordering::Relaxed)
    }

    /// Input windows per second since the metrics were created
    pub fn throughput_wps(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.windows_read() as f64 / secs
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            windows_read: self.windows_read(),
            windows_emitted: self.windows_emitted(),
            windows_discarded: self.windows_discarded(),
            read_waits: self.read_waits(),
            write_waits: self.write_waits(),
            throughput_wps: self.throughput_wps(),
            latency_p50_us: self.latency.quantile_us(0.50),
            latency_p95_us: self.latency.quantile_us(0.95),
            latency_p99_us: self.latency.quantile_us(0.99),
            elapsed: self.started.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a stage's metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub windows_read: u64,
    pub windows_emitted: u64,
    pub windows_discarded: u64,
    pub read_waits: u64,
    pub write_waits: u64,
    pub throughput_wps: f64,
    pub latency_p50_us: f64,
    pub latency_p95_us: f64,
    pub latency_p99_us: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    pub fn format(&self) -> String {
        format!(
            "Read: {}, Emitted: {}, Discarded: {}, Waits: {} in / {} out, \
             Throughput: {:.2} win/s, Latency P50: {:.2}µs, P95: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.windows_read,
            self.windows_emitted,
            self.windows_discarded,
            self.read_waits,
            self.write_waits,
            self.throughput_wps,
            self.latency_p50_us,
            self.latency_p95_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}
