//! In-memory metrics recorder.
//!
//! Installs behind the `metrics` facade the engine emits into and keeps
//! everything in process memory; a snapshot can be exported as JSON at
//! the end of a run. Metrics are keyed by name (the engine emits no
//! labels).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::{Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::RwLock;

#[derive(Default)]
struct AtomicCounter(AtomicU64);

impl CounterFn for AtomicCounter {
    fn increment(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn absolute(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct AtomicGauge(AtomicU64);

impl GaugeFn for AtomicGauge {
    fn increment(&self, value: f64) {
        let mut current = f64::from_bits(self.0.load(Ordering::Relaxed));
        current += value;
        self.0.store(current.to_bits(), Ordering::Relaxed);
    }

    fn decrement(&self, value: f64) {
        self.increment(-value);
    }

    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Default)]
struct SampleHistogram(RwLock<Vec<f64>>);

impl HistogramFn for SampleHistogram {
    fn record(&self, value: f64) {
        self.0.write().push(value);
    }
}

#[derive(Default)]
struct Storage {
    counters: RwLock<BTreeMap<String, Arc<AtomicCounter>>>,
    gauges: RwLock<BTreeMap<String, Arc<AtomicGauge>>>,
    histograms: RwLock<BTreeMap<String, Arc<SampleHistogram>>>,
}

/// Summary statistics of one histogram.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// A point-in-time view of every metric recorded so far.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Recorder collecting every metric in memory.
#[derive(Clone, Default)]
pub struct InMemoryRecorder {
    storage: Arc<Storage>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        InMemoryRecorder::default()
    }

    /// Install this recorder globally. Returns false when another
    /// recorder is already installed (tests share one process).
    pub fn install(&self) -> bool {
        metrics::set_global_recorder(self.clone()).is_ok()
    }

    /// Snapshot every metric recorded so far.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .storage
            .counters
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), c.0.load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .storage
            .gauges
            .read()
            .iter()
            .map(|(name, g)| (name.clone(), f64::from_bits(g.0.load(Ordering::Relaxed))))
            .collect();
        let histograms = self
            .storage
            .histograms
            .read()
            .iter()
            .filter_map(|(name, h)| {
                let samples = h.0.read();
                if samples.is_empty() {
                    return None;
                }
                let sum: f64 = samples.iter().sum();
                let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
                let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                Some((
                    name.clone(),
                    HistogramSummary {
                        count: samples.len() as u64,
                        sum,
                        min,
                        max,
                        mean: sum / samples.len() as f64,
                    },
                ))
            })
            .collect();
        MetricsSnapshot {
            counters,
            gauges,
            histograms,
        }
    }
}

impl Recorder for InMemoryRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        let handle = self
            .storage
            .counters
            .write()
            .entry(key.name().to_string())
            .or_default()
            .clone();
        Counter::from_arc(handle)
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        let handle = self
            .storage
            .gauges
            .write()
            .entry(key.name().to_string())
            .or_default()
            .clone();
        Gauge::from_arc(handle)
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        let handle = self
            .storage
            .histograms
            .write()
            .entry(key.name().to_string())
            .or_default()
            .clone();
        Histogram::from_arc(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::with_local_recorder;

    #[test]
    fn counters_and_histograms_accumulate() {
        let recorder = InMemoryRecorder::new();
        with_local_recorder(&recorder, || {
            metrics::counter!("test.uplinks").increment(3);
            metrics::counter!("test.uplinks").increment(2);
            metrics::histogram!("test.snr").record(-4.5);
            metrics::histogram!("test.snr").record(-6.5);
        });
        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.counters["test.uplinks"], 5);
        let hist = &snapshot.histograms["test.snr"];
        assert_eq!(hist.count, 2);
        assert!((hist.mean + 5.5).abs() < 1e-12);
        assert_eq!(hist.min, -6.5);
        assert_eq!(hist.max, -4.5);
    }

    #[test]
    fn empty_snapshot_is_empty() {
        let recorder = InMemoryRecorder::new();
        let snapshot = recorder.snapshot();
        assert!(snapshot.counters.is_empty());
        assert!(snapshot.histograms.is_empty());
    }
}
