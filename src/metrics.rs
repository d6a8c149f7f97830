//! Process-wide counters/gauges/histograms (§2, §6.1).
//!
//! Plain `AtomicU64`-backed registry, the same shape as
//! `dashflow-observability`'s `ServerMetrics` (atomics read without
//! locking, exposed through a text snapshot rather than a client library —
//! only the counter/gauge/histogram *contracts* are specified, not an
//! exposition format crate).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Coarse histogram: keeps a bounded sample buffer and reports count/sum,
/// sufficient for the retry-count / duration observability named in the
/// spec without pulling in a metrics-exposition crate.
#[derive(Default)]
pub struct Histogram {
    samples: Mutex<Vec<f64>>,
}

impl Histogram {
    pub fn observe(&self, v: f64) {
        let mut samples = self.samples.lock().unwrap();
        samples.push(v);
        if samples.len() > 10_000 {
            samples.drain(0..5_000);
        }
    }

    pub fn snapshot(&self) -> (u64, f64) {
        let samples = self.samples.lock().unwrap();
        let count = samples.len() as u64;
        let sum: f64 = samples.iter().sum();
        (count, sum)
    }
}

#[derive(Default)]
pub struct Metrics {
    pub http_fetch_success: Counter,
    pub http_fetch_retry: Counter,
    pub http_fetch_error: Counter,
    pub http_retry_count_histogram: Histogram,
    pub http_retry_after_seconds_histogram: Histogram,

    pub jobs_succeeded: Counter,
    pub jobs_failed: Counter,
    pub posts_processed: Counter,
    pub comments_processed: Counter,
    pub job_duration_seconds_histogram: Histogram,

    pub circuit_trip_count: Counter,
    pub circuit_state_gauge: Gauge,

    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_keys_added: Counter,
    pub cache_evictions: Counter,
    pub cache_size_bytes_gauge: Gauge,
    pub cache_items_gauge: Gauge,

    pub precalc_version_gauge: Gauge,
    pub precalc_duration_ms_gauge: Gauge,
}

impl Metrics {
    /// Renders a minimal Prometheus-style text exposition body.
    pub fn render(&self) -> String {
        let mut out = String::new();
        macro_rules! counter_line {
            ($name:expr, $c:expr) => {
                out.push_str(&format!("# TYPE {} counter\n{} {}\n", $name, $name, $c.get()));
            };
        }
        macro_rules! gauge_line {
            ($name:expr, $g:expr) => {
                out.push_str(&format!("# TYPE {} gauge\n{} {}\n", $name, $name, $g.get()));
            };
        }

        counter_line!("http_fetch_success_total", self.http_fetch_success);
        counter_line!("http_fetch_retry_total", self.http_fetch_retry);
        counter_line!("http_fetch_error_total", self.http_fetch_error);
        counter_line!("jobs_succeeded_total", self.jobs_succeeded);
        counter_line!("jobs_failed_total", self.jobs_failed);
        counter_line!("posts_processed_total", self.posts_processed);
        counter_line!("comments_processed_total", self.comments_processed);
        counter_line!("circuit_trip_count_total", self.circuit_trip_count);
        counter_line!("cache_hits_total", self.cache_hits);
        counter_line!("cache_misses_total", self.cache_misses);
        counter_line!("cache_keys_added_total", self.cache_keys_added);
        counter_line!("cache_evictions_total", self.cache_evictions);

        gauge_line!("circuit_state", self.circuit_state_gauge);
        gauge_line!("cache_size_bytes", self.cache_size_bytes_gauge);
        gauge_line!("cache_items", self.cache_items_gauge);
        gauge_line!("precalc_version_id", self.precalc_version_gauge);
        gauge_line!("precalc_duration_ms", self.precalc_duration_ms_gauge);

        let (count, sum) = self.http_retry_count_histogram.snapshot();
        out.push_str(&format!(
            "# TYPE http_retry_count histogram\nhttp_retry_count_count {count}\nhttp_retry_count_sum {sum}\n"
        ));
        let (count, sum) = self.job_duration_seconds_histogram.snapshot();
        out.push_str(&format!(
            "# TYPE job_duration_seconds histogram\njob_duration_seconds_count {count}\njob_duration_seconds_sum {sum}\n"
        ));

        out
    }
}
