//! # Metrics Sink
//!
//! Counters, histograms and gauges for the dispatch plane, rendered in
//! Prometheus text exposition format at `/metrics`. Label cardinality is
//! bounded: model × endpoint × status only.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Response-time bucket bounds in seconds.
pub const LATENCY_BUCKETS: [f64; 8] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];

#[derive(Debug, Clone)]
struct Histogram {
    bucket_counts: [u64; LATENCY_BUCKETS.len()],
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            bucket_counts: [0; LATENCY_BUCKETS.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, seconds: f64) {
        if !seconds.is_finite() || seconds < 0.0 {
            return;
        }
        self.count += 1;
        self.sum += seconds;
        for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.bucket_counts[i] += 1;
            }
        }
    }
}

/// BTreeMap keeps the exposition output deterministically ordered.
type LabeledCounters<K> = Mutex<BTreeMap<K, u64>>;

pub struct MetricsSink {
    /// (model, endpoint, status) → count
    requests: LabeledCounters<(String, String, String)>,
    /// (model, endpoint) → tokens
    tokens: LabeledCounters<(String, String)>,
    /// (model, endpoint) → response-time histogram
    response_time: Mutex<BTreeMap<(String, String), Histogram>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    active_conversations: AtomicU64,
    active_users: AtomicU64,
    healthy_backends: AtomicU64,
    system_memory_percent: AtomicU64,
    system_cpu_percent: AtomicU64,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(BTreeMap::new()),
            tokens: Mutex::new(BTreeMap::new()),
            response_time: Mutex::new(BTreeMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            active_conversations: AtomicU64::new(0),
            active_users: AtomicU64::new(0),
            healthy_backends: AtomicU64::new(0),
            system_memory_percent: AtomicU64::new(0),
            system_cpu_percent: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self, model: &str, endpoint: &str, status: &str) {
        let mut requests = self.requests.lock().unwrap();
        *requests
            .entry((model.to_string(), endpoint.to_string(), status.to_string()))
            .or_default() += 1;
    }

    pub fn record_tokens(&self, model: &str, endpoint: &str, tokens: u64) {
        if tokens == 0 {
            return;
        }
        let mut table = self.tokens.lock().unwrap();
        *table
            .entry((model.to_string(), endpoint.to_string()))
            .or_default() += tokens;
    }

    pub fn observe_response_time(&self, model: &str, endpoint: &str, seconds: f64) {
        let mut table = self.response_time.lock().unwrap();
        table
            .entry((model.to_string(), endpoint.to_string()))
            .or_insert_with(Histogram::new)
            .observe(seconds);
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_conversations(&self, count: u64) {
        self.active_conversations.store(count, Ordering::Relaxed);
    }

    pub fn set_active_users(&self, count: u64) {
        self.active_users.store(count, Ordering::Relaxed);
    }

    pub fn set_healthy_backends(&self, count: u64) {
        self.healthy_backends.store(count, Ordering::Relaxed);
    }

    pub fn set_system_memory_percent(&self, percent: f64) {
        self.system_memory_percent
            .store(percent.to_bits(), Ordering::Relaxed);
    }

    pub fn set_system_cpu_percent(&self, percent: f64) {
        self.system_cpu_percent
            .store(percent.to_bits(), Ordering::Relaxed);
    }

    /// Render the full exposition document.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);

        let _ = writeln!(out, "# HELP llm_requests_total Total number of LLM requests");
        let _ = writeln!(out, "# TYPE llm_requests_total counter");
        for ((model, endpoint, status), count) in self.requests.lock().unwrap().iter() {
            let _ = writeln!(
                out,
                "llm_requests_total{{model=\"{}\",endpoint=\"{}\",status=\"{}\"}} {}",
                model, endpoint, status, count
            );
        }

        let _ = writeln!(out, "# HELP llm_tokens_total Total tokens processed");
        let _ = writeln!(out, "# TYPE llm_tokens_total counter");
        for ((model, endpoint), tokens) in self.tokens.lock().unwrap().iter() {
            let _ = writeln!(
                out,
                "llm_tokens_total{{model=\"{}\",endpoint=\"{}\"}} {}",
                model, endpoint, tokens
            );
        }

        let _ = writeln!(out, "# HELP llm_response_time_seconds LLM response time in seconds");
        let _ = writeln!(out, "# TYPE llm_response_time_seconds histogram");
        for ((model, endpoint), histogram) in self.response_time.lock().unwrap().iter() {
            let labels = format!("model=\"{}\",endpoint=\"{}\"", model, endpoint);
            for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "llm_response_time_seconds_bucket{{{},le=\"{}\"}} {}",
                    labels, bound, histogram.bucket_counts[i]
                );
            }
            let _ = writeln!(
                out,
                "llm_response_time_seconds_bucket{{{},le=\"+Inf\"}} {}",
                labels, histogram.count
            );
            let _ = writeln!(
                out,
                "llm_response_time_seconds_sum{{{}}} {}",
                labels, histogram.sum
            );
            let _ = writeln!(
                out,
                "llm_response_time_seconds_count{{{}}} {}",
                labels, histogram.count
            );
        }

        let _ = writeln!(out, "# HELP cache_hits_total Total cache hits");
        let _ = writeln!(out, "# TYPE cache_hits_total counter");
        let _ = writeln!(out, "cache_hits_total {}", self.cache_hits.load(Ordering::Relaxed));

        let _ = writeln!(out, "# HELP cache_misses_total Total cache misses");
        let _ = writeln!(out, "# TYPE cache_misses_total counter");
        let _ = writeln!(
            out,
            "cache_misses_total {}",
            self.cache_misses.load(Ordering::Relaxed)
        );

        for (name, help, value) in [
            (
                "active_conversations",
                "Number of active conversations",
                self.active_conversations.load(Ordering::Relaxed) as f64,
            ),
            (
                "active_users",
                "Number of active users",
                self.active_users.load(Ordering::Relaxed) as f64,
            ),
            (
                "healthy_backends",
                "Number of healthy backends",
                self.healthy_backends.load(Ordering::Relaxed) as f64,
            ),
            (
                "system_memory_percent",
                "System memory usage percentage",
                f64::from_bits(self.system_memory_percent.load(Ordering::Relaxed)),
            ),
            (
                "system_cpu_percent",
                "System CPU usage percentage",
                f64::from_bits(self.system_cpu_percent.load(Ordering::Relaxed)),
            ),
        ] {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, value);
        }

        out
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}
