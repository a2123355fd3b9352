//! In-memory span/metric collector with periodic flush.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

const RING_BUFFER_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Client,
    Server,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,
    pub service_name: String,
    pub operation: String,
    pub kind: SpanKind,
    pub status: SpanStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(std::sync::atomic::AtomicU64);

impl Counter {
    pub fn increment(&self, by: u64) {
        self.0.fetch_add(by, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Point-in-time value that can move up or down.
#[derive(Debug, Default)]
pub struct Gauge(std::sync::atomic::AtomicI64);

impl Gauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Distribution of observed values, used for latency-style metrics.
#[derive(Debug, Default)]
pub struct Histogram {
    samples: std::sync::Mutex<Vec<f64>>,
}

impl Histogram {
    pub fn observe(&self, value: f64) {
        self.samples.lock().expect("histogram lock poisoned").push(value);
    }

    pub fn summary(&self) -> Option<MetricSummary> {
        let samples = self.samples.lock().expect("histogram lock poisoned");
        if samples.is_empty() {
            return None;
        }
        let sum: f64 = samples.iter().sum();
        let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Some(MetricSummary { count: samples.len() as u64, sum, min, max, avg: sum / samples.len() as f64 })
    }
}

enum FlushSink {
    File(std::path::PathBuf),
    Log,
}

/// Ring buffers of the last 1000 spans and metrics, flushed periodically
/// to the configured sink.
pub struct ObservabilityCollector {
    spans: Arc<RwLock<VecDeque<SpanRecord>>>,
    metrics: Arc<RwLock<VecDeque<MetricSample>>>,
    sink: FlushSink,
    flush_task: RwLock<Option<JoinHandle<()>>>,
}

impl ObservabilityCollector {
    pub fn new(output_file: Option<std::path::PathBuf>) -> Self {
        Self {
            spans: Arc::new(RwLock::new(VecDeque::with_capacity(RING_BUFFER_CAPACITY))),
            metrics: Arc::new(RwLock::new(VecDeque::with_capacity(RING_BUFFER_CAPACITY))),
            sink: output_file.map_or(FlushSink::Log, FlushSink::File),
            flush_task: RwLock::new(None),
        }
    }

    pub async fn record_span(&self, span: SpanRecord) {
        let mut spans = self.spans.write().await;
        if spans.len() == RING_BUFFER_CAPACITY {
            spans.pop_front();
        }
        spans.push_back(span);
    }

    pub async fn record_metric(&self, sample: MetricSample) {
        let mut metrics = self.metrics.write().await;
        if metrics.len() == RING_BUFFER_CAPACITY {
            metrics.pop_front();
        }
        metrics.push_back(sample);
    }

    pub async fn recent_spans(&self, n: usize) -> Vec<SpanRecord> {
        self.spans.read().await.iter().rev().take(n).cloned().collect()
    }

    pub async fn spans_by_trace(&self, trace_id: &str) -> Vec<SpanRecord> {
        self.spans.read().await.iter().filter(|s| s.trace_id == trace_id).cloned().collect()
    }

    pub async fn spans_by_service(&self, service_name: &str) -> Vec<SpanRecord> {
        self.spans.read().await.iter().filter(|s| s.service_name == service_name).cloned().collect()
    }

    pub async fn get_metric_summary(&self, name: &str, labels: &HashMap<String, String>) -> Option<MetricSummary> {
        let metrics = self.metrics.read().await;
        let matching: Vec<f64> = metrics.iter().filter(|m| m.name == name && &m.labels == labels).map(|m| m.value).collect();
        if matching.is_empty() {
            return None;
        }
        let sum: f64 = matching.iter().sum();
        let min = matching.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = matching.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Some(MetricSummary { count: matching.len() as u64, sum, min, max, avg: sum / matching.len() as f64 })
    }

    async fn flush_once(spans: &Arc<RwLock<VecDeque<SpanRecord>>>, metrics: &Arc<RwLock<VecDeque<MetricSample>>>, sink: &FlushSink) {
        let span_count = spans.read().await.len();
        let metric_count = metrics.read().await.len();
        match sink {
            FlushSink::Log => {
                info!(span_count, metric_count, "observability flush");
            }
            FlushSink::File(path) => {
                let snapshot = serde_json::json!({
                    "spans": spans.read().await.iter().cloned().collect::<Vec<_>>(),
                    "metrics": metrics.read().await.iter().cloned().collect::<Vec<_>>(),
                });
                if let Ok(body) = serde_json::to_string(&snapshot) {
                    let _ = tokio::fs::write(path, body).await;
                }
            }
        }
    }

    /// Start the 60s periodic flush loop; responds to cancellation within
    /// one poll interval.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let spans = self.spans.clone();
        let metrics = self.metrics.clone();
        let sink = match &self.sink {
            FlushSink::File(p) => FlushSink::File(p.clone()),
            FlushSink::Log => FlushSink::Log,
        };
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                Self::flush_once(&spans, &metrics, &sink).await;
            }
        })
    }

    pub async fn stop(&self) {
        if let Some(task) = self.flush_task.write().await.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_buffer_caps_at_1000_spans() {
        let collector = ObservabilityCollector::new(None);
        for i in 0..1100 {
            collector
                .record_span(SpanRecord {
                    trace_id: "t".to_string(),
                    span_id: i.to_string(),
                    service_name: "svc".to_string(),
                    operation: "op".to_string(),
                    kind: SpanKind::Internal,
                    status: SpanStatus::Ok,
                    started_at: Utc::now(),
                    duration_ms: 1,
                })
                .await;
        }
        assert_eq!(collector.recent_spans(2000).await.len(), 1000);
    }

    #[tokio::test]
    async fn metric_summary_computes_min_max_avg() {
        let collector = ObservabilityCollector::new(None);
        let labels = HashMap::new();
        for v in [1.0, 2.0, 3.0] {
            collector.record_metric(MetricSample { name: "latency".to_string(), labels: labels.clone(), value: v, recorded_at: Utc::now() }).await;
        }
        let summary = collector.get_metric_summary("latency", &labels).await.unwrap();
        assert_eq!(summary.count, 3);
        assert!((summary.avg - 2.0).abs() < f64::EPSILON);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 3.0);
    }

    #[test]
    fn histogram_summary_none_when_empty() {
        let histogram = Histogram::default();
        assert!(histogram.summary().is_none());
        histogram.observe(5.0);
        assert_eq!(histogram.summary().unwrap().count, 1);
    }
}
