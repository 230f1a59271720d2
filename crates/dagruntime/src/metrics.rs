use dagcore::metrics::Labels;
use dagcore::{MetricsError, MetricsSink};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Engine-side handle to the optional metrics sink.
///
/// Sink failures are logged and swallowed so they never affect a workflow.
#[derive(Clone, Default)]
pub struct Metrics {
    sink: Option<Arc<dyn MetricsSink>>,
}

impl Metrics {
    pub fn new(sink: Option<Arc<dyn MetricsSink>>) -> Self {
        Self { sink }
    }

    pub fn increment(&self, name: &str, labels: Labels<'_>) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.increment_counter(name, labels) {
                tracing::warn!("Failed to emit counter {}: {}", name, e);
            }
        }
    }

    pub fn observe(&self, name: &str, value_ms: f64, labels: Labels<'_>) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record_histogram(name, value_ms, labels) {
                tracing::warn!("Failed to emit histogram {}: {}", name, e);
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Histogram {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

/// In-process metrics collector
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    histograms: Mutex<HashMap<String, Histogram>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn metric_key(name: &str, labels: Labels<'_>) -> String {
        if labels.is_empty() {
            return name.to_string();
        }

        let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        pairs.sort();
        format!("{}{{{}}}", name, pairs.join(","))
    }

    fn matches(key: &str, name: &str) -> bool {
        key == name || key.strip_prefix(name).is_some_and(|rest| rest.starts_with('{'))
    }

    /// Counter total for `name` summed across all label sets
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|counters| {
                counters
                    .iter()
                    .filter(|(key, _)| Self::matches(key, name))
                    .map(|(_, v)| *v)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Counter value for one exact label set
    pub fn counter_with(&self, name: &str, labels: Labels<'_>) -> u64 {
        let key = Self::metric_key(name, labels);
        self.counters
            .lock()
            .ok()
            .and_then(|counters| counters.get(&key).copied())
            .unwrap_or(0)
    }

    /// Number of observations recorded for `name` across all label sets
    pub fn histogram_count(&self, name: &str) -> u64 {
        self.histograms
            .lock()
            .map(|histograms| {
                histograms
                    .iter()
                    .filter(|(key, _)| Self::matches(key, name))
                    .map(|(_, h)| h.count)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Largest value observed for `name`, if any
    pub fn histogram_max(&self, name: &str) -> Option<f64> {
        self.histograms.lock().ok().and_then(|histograms| {
            histograms
                .iter()
                .filter(|(key, _)| Self::matches(key, name))
                .map(|(_, h)| h.max)
                .reduce(f64::max)
        })
    }

    pub fn histogram_mean(&self, name: &str) -> Option<f64> {
        let histograms = self.histograms.lock().ok()?;
        let (count, sum) = histograms
            .iter()
            .filter(|(key, _)| Self::matches(key, name))
            .fold((0u64, 0.0), |(c, s), (_, h)| (c + h.count, s + h.sum));
        (count > 0).then(|| sum / count as f64)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &str, labels: Labels<'_>) -> Result<(), MetricsError> {
        let key = Self::metric_key(name, labels);
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| MetricsError::Unavailable("counter lock poisoned".to_string()))?;
        *counters.entry(key).or_insert(0) += 1;
        Ok(())
    }

    fn record_histogram(&self, name: &str, value_ms: f64, labels: Labels<'_>) -> Result<(), MetricsError> {
        if !value_ms.is_finite() {
            return Err(MetricsError::Rejected(format!("non-finite value for {}", name)));
        }

        let key = Self::metric_key(name, labels);
        let mut histograms = self
            .histograms
            .lock()
            .map_err(|_| MetricsError::Unavailable("histogram lock poisoned".to_string()))?;

        histograms
            .entry(key)
            .and_modify(|h| {
                h.count += 1;
                h.sum += value_ms;
                h.min = h.min.min(value_ms);
                h.max = h.max.max(value_ms);
            })
            .or_insert_with(|| Histogram {
                count: 1,
                sum: value_ms,
                min: value_ms,
                max: value_ms,
            });
        Ok(())
    }
}
