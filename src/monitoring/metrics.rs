/*!
 * Metrics Collection
 * Lightweight in-process counters, gauges and latency histograms
 */

use ahash::RandomState;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bucket upper bounds in seconds
const LATENCY_BUCKETS: [f64; 9] = [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0];

#[derive(Debug, Clone)]
struct Histogram {
    counts: [u64; LATENCY_BUCKETS.len()],
    sum: f64,
    count: u64,
    max: f64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            counts: [0; LATENCY_BUCKETS.len()],
            sum: 0.0,
            count: 0,
            max: 0.0,
        }
    }

    fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.max = self.max.max(value);
        for (i, &bound) in LATENCY_BUCKETS.iter().enumerate() {
            if value <= bound {
                self.counts[i] += 1;
            }
        }
    }

    /// Upper bound of the first bucket holding the `p` quantile
    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let target = ((self.count as f64 * p).ceil() as u64).max(1);
        for (i, &count) in self.counts.iter().enumerate() {
            if count >= target {
                return LATENCY_BUCKETS[i];
            }
        }
        self.max
    }
}

/// Metrics collector; clones share the same tables
#[derive(Clone)]
pub struct MetricsCollector {
    counters: Arc<DashMap<String, f64, RandomState>>,
    gauges: Arc<DashMap<String, f64, RandomState>>,
    histograms: Arc<DashMap<String, Histogram, RandomState>>,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(DashMap::with_hasher(RandomState::new())),
            gauges: Arc::new(DashMap::with_hasher(RandomState::new())),
            histograms: Arc::new(DashMap::with_hasher(RandomState::new())),
            start_time: Instant::now(),
        }
    }

    pub fn inc_counter(&self, name: &str, value: f64) {
        self.counters
            .entry(name.to_string())
            .and_modify(|v| *v += value)
            .or_insert(value);
    }

    pub fn counter(&self, name: &str) -> f64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0.0)
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.insert(name.to_string(), value);
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|v| *v)
    }

    pub fn remove_gauge(&self, name: &str) {
        self.gauges.remove(name);
    }

    pub fn observe_histogram(&self, name: &str, value: f64) {
        self.histograms
            .entry(name.to_string())
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn record_duration(&self, name: &str, duration: Duration) {
        self.observe_histogram(name, duration.as_secs_f64());
    }

    /// Start a timer that records into histogram `name` when dropped
    pub fn timer(&self, name: impl Into<String>) -> Timer {
        Timer {
            start: Instant::now(),
            name: name.into(),
            collector: self.clone(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        let gauges = self
            .gauges
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        let histograms = self
            .histograms
            .iter()
            .map(|entry| {
                let hist = entry.value();
                let stats = HistogramStats {
                    count: hist.count,
                    sum: hist.sum,
                    avg: if hist.count > 0 {
                        hist.sum / hist.count as f64
                    } else {
                        0.0
                    },
                    max: hist.max,
                    p50: hist.percentile(0.50),
                    p95: hist.percentile(0.95),
                    p99: hist.percentile(0.99),
                };
                (entry.key().clone(), stats)
            })
            .collect();

        MetricsSnapshot {
            counters,
            gauges,
            histograms,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn reset(&self) {
        self.counters.clear();
        self.gauges.clear();
        self.histograms.clear();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Point-in-time copy of every metric
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub counters: HashMap<String, f64>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub gauges: HashMap<String, f64>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub histograms: HashMap<String, HistogramStats>,
    pub uptime_secs: u64,
}

/// Records elapsed time into its collector on drop
pub struct Timer {
    start: Instant,
    name: String,
    collector: MetricsCollector,
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.collector
            .record_duration(&self.name, self.start.elapsed());
    }
}
