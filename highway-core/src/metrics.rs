//! Prometheus metrics for monitoring
//!
//! Lock-free counters, gauges and histograms updated from the worker hot
//! paths, rendered in Prometheus text exposition format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    /// Create a new counter
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    /// Create a new gauge
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    /// Set value
    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Upper bounds (seconds) shared by every histogram
const BUCKETS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Histogram for latency measurements
pub struct Histogram {
    buckets: [AtomicU64; 12],
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Histogram {
    /// Create with the default latency buckets
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            buckets: [ZERO; 12],
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Observe a value in seconds
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);

        for (bound, count) in BUCKETS.iter().zip(&self.buckets) {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Time a closure and record the duration
    pub fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in BUCKETS.iter().zip(&self.buckets) {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n",
            self.name,
            self.count()
        ));

        let sum_secs = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));

        output
    }
}

/// Process-wide pipeline metrics
pub mod standard {
    use super::*;

    pub static BATCHES_ENQUEUED: Counter =
        Counter::new("highway_batches_enqueued_total", "Batches written to stage channels");

    pub static BATCHES_DEQUEUED: Counter =
        Counter::new("highway_batches_dequeued_total", "Batches read from stage channels");

    pub static ACTIVE_WORKERS: Gauge =
        Gauge::new("highway_active_workers", "Stage workers currently running");

    pub static WORKER_FAILURES: Counter =
        Counter::new("highway_worker_failures_total", "Workers that exited on an unhandled error");

    pub static BYTES_SENT: Counter =
        Counter::new("highway_network_bytes_sent_total", "Payload bytes pushed by network sinks");

    pub static BYTES_RECEIVED: Counter =
        Counter::new("highway_network_bytes_received_total", "Payload bytes pulled by sources");

    pub static BATCHES_DROPPED: Counter =
        Counter::new("highway_network_batches_dropped_total", "Batches lost to failed sends");

    pub static RECORDS_WRITTEN: Counter =
        Counter::new("highway_store_records_written_total", "Sample records appended to stores");

    pub static RECORDS_READ: Counter =
        Counter::new("highway_store_records_read_total", "Sample records scanned from stores");

    pub static STORE_WRAPS: Counter =
        Counter::new("highway_store_wraparounds_total", "Store scans restarted from the start");

    pub static TRANSFORM_DURATION: Histogram =
        Histogram::new("highway_transform_duration_seconds", "Transform chain time per batch");
}

/// Render all standard metrics
pub fn gather_system_metrics() -> String {
    let mut output = String::new();

    // Counters
    output.push_str(&standard::BATCHES_ENQUEUED.to_prometheus());
    output.push_str(&standard::BATCHES_DEQUEUED.to_prometheus());
    output.push_str(&standard::WORKER_FAILURES.to_prometheus());
    output.push_str(&standard::BYTES_SENT.to_prometheus());
    output.push_str(&standard::BYTES_RECEIVED.to_prometheus());
    output.push_str(&standard::BATCHES_DROPPED.to_prometheus());
    output.push_str(&standard::RECORDS_WRITTEN.to_prometheus());
    output.push_str(&standard::RECORDS_READ.to_prometheus());
    output.push_str(&standard::STORE_WRAPS.to_prometheus());

    // Gauges
    output.push_str(&standard::ACTIVE_WORKERS.to_prometheus());

    // Histograms
    output.push_str(&standard::TRANSFORM_DURATION.to_prometheus());

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "Test counter");
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("test_gauge", "Test gauge");
        gauge.set(10);
        gauge.dec();
        assert_eq!(gauge.get(), 9);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new("test_histogram", "Test histogram");

        histogram.observe(0.001);
        histogram.observe(0.01);
        histogram.observe(20.0);

        let prometheus = histogram.to_prometheus();
        assert!(prometheus.contains("test_histogram_count 3"));
        assert!(prometheus.contains("test_histogram_bucket{le=\"0.01\"} 2"));
        assert!(prometheus.contains("test_histogram_bucket{le=\"+Inf\"} 3"));
    }

    #[test]
    fn test_gather_lists_standard_metrics() {
        let text = gather_system_metrics();
        assert!(text.contains("highway_active_workers"));
        assert!(text.contains("highway_store_records_written_total"));
    }
}
