//! In-process counters and latency histograms.
//! Counters track pipeline outcomes; histograms keep the last N samples and
//! report p50/p95/p99. A timer logs the summary; nothing is exported.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

const RING_CAPACITY: usize = 1024;

/// Fixed-capacity ring of the most recent samples.
struct SampleRing {
    samples: Vec<f64>,
    next: usize,
}

impl SampleRing {
    fn new() -> Self {
        Self {
            samples: Vec::with_capacity(RING_CAPACITY),
            next: 0,
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() < RING_CAPACITY {
            self.samples.push(value);
        } else {
            self.samples[self.next] = value;
        }
        self.next = (self.next + 1) % RING_CAPACITY;
    }

    fn summarize(&self) -> LatencySummary {
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let pick = |p: f64| -> f64 {
            if sorted.is_empty() {
                return 0.0;
            }
            let idx = ((p / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        LatencySummary {
            p50_us: pick(50.0),
            p95_us: pick(95.0),
            p99_us: pick(99.0),
            count: sorted.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub latencies: BTreeMap<String, LatencySummary>,
}

#[derive(Default)]
struct Inner {
    counters: HashMap<String, u64>,
    latencies: HashMap<&'static str, SampleRing>,
}

#[derive(Default)]
pub struct MetricsRegistry {
    inner: Mutex<Inner>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str) {
        *self.inner.lock().counters.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.inner.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Record a latency sample in microseconds.
    pub fn record(&self, name: &'static str, value_us: f64) {
        self.inner
            .lock()
            .latencies
            .entry(name)
            .or_insert_with(SampleRing::new)
            .push(value_us);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();
        MetricsSnapshot {
            counters: inner
                .counters
                .iter()
                .map(|(name, count)| (name.clone(), *count))
                .collect(),
            latencies: inner
                .latencies
                .iter()
                .map(|(name, ring)| (name.to_string(), ring.summarize()))
                .collect(),
        }
    }

    /// Log the current snapshot.
    pub fn flush(&self) {
        let snapshot = self.snapshot();
        if snapshot.counters.is_empty() && snapshot.latencies.is_empty() {
            return;
        }
        match serde_json::to_string(&snapshot) {
            Ok(json) => info!(metrics = %json, "metrics_flush"),
            Err(e) => info!(error = %e, "metrics_flush encode failed"),
        }
    }
}

/// Well-known metric names.
pub mod metric_names {
    pub const MESSAGES_RECEIVED: &str = "messages_received";
    pub const REPLIES_SENT: &str = "replies_sent";
    pub const CACHE_HIT: &str = "translate_cache_hit";
    pub const CACHE_MISS: &str = "translate_cache_miss";
    pub const TRANSLATE_CALL: &str = "t_translate_call";
    pub const PIPELINE_DONE: &str = "t_pipeline_done";
    pub const TOKEN_REFRESH_OK: &str = "token_refresh_ok";
    pub const TOKEN_REFRESH_FAILED: &str = "token_refresh_failed";

    /// Counter name for a dropped message.
    pub fn dropped(reason: &str) -> String {
        format!("dropped.{reason}")
    }
}
