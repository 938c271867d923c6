//! Metrics recording and Prometheus exposition for the serving path.
//!
//! The classifier hands `MetricSample`s to a [`MetricsRecorder`], which fans
//! them out to every [`MetricSink`] and swallows delivery failures. The
//! built-in sink is [`MetricsRegistry`], an in-process store rendered on
//! `GET /metrics`.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

pub const REQUESTS_TOTAL: &str = "inference_requests_total";
pub const LATENCY_SECONDS: &str = "inference_latency_seconds";
pub const PREDICTIONS_TOTAL: &str = "predictions_total";
pub const MODEL_READY: &str = "model_ready";
pub const SINK_ERRORS_TOTAL: &str = "metrics_sink_errors_total";

/// Label used on prediction samples when no label was produced
pub const NO_LABEL: &str = "none";

/// Histogram bucket upper bounds in seconds
pub const LATENCY_BUCKETS: [f64; 13] = [
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// How a classify call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Outcome {
    Success,
    ClientError,
    ServerError,
}

impl Outcome {
    pub const ALL: [Outcome; 3] = [Outcome::Success, Outcome::ClientError, Outcome::ServerError];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::ClientError => "client_error",
            Outcome::ServerError => "server_error",
        }
    }
}

/// One observation destined for a metrics sink
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: &'static str,
    pub value: f64,
    pub labels: Vec<(&'static str, String)>,
}

impl MetricSample {
    pub fn new(name: &'static str, value: f64) -> Self {
        Self {
            name,
            value,
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.labels.push((key, value.into()));
        self
    }

    /// Request latency, labelled with the outcome
    pub fn latency(outcome: Outcome, elapsed: Duration) -> Self {
        Self::new(LATENCY_SECONDS, elapsed.as_secs_f64()).with_label("outcome", outcome.as_str())
    }

    /// Predicted label (or `none` on failure), labelled with the outcome
    pub fn prediction(outcome: Outcome, label: Option<&str>) -> Self {
        Self::new(PREDICTIONS_TOTAL, 1.0)
            .with_label("label", label.unwrap_or(NO_LABEL))
            .with_label("outcome", outcome.as_str())
    }
}

/// Destination for metric samples. Implementations must not block.
pub trait MetricSink: Send + Sync {
    fn record(&self, sample: &MetricSample) -> Result<()>;
}

/// Best-effort fan-out to sinks; never fails the caller.
pub struct MetricsRecorder {
    sinks: Vec<Arc<dyn MetricSink>>,
    sink_errors: AtomicU64,
}

impl MetricsRecorder {
    pub fn new(sinks: Vec<Arc<dyn MetricSink>>) -> Self {
        Self {
            sinks,
            sink_errors: AtomicU64::new(0),
        }
    }

    /// Recorder with no sinks, for callers that don't care about metrics
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    /// Deliver a sample to every sink. Failures are counted and logged only.
    pub fn record(&self, sample: MetricSample) {
        for sink in &self.sinks {
            if let Err(e) = sink.record(&sample) {
                self.sink_errors.fetch_add(1, Ordering::Relaxed);
                debug!(metric = sample.name, error = %e, "Dropped metric sample");
            }
        }
    }

    /// Number of samples a sink refused
    pub fn sink_errors(&self) -> u64 {
        self.sink_errors.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Counter,
    Gauge,
    Histogram,
}

impl Kind {
    fn as_str(&self) -> &'static str {
        match self {
            Kind::Counter => "counter",
            Kind::Gauge => "gauge",
            Kind::Histogram => "histogram",
        }
    }
}

/// f64 stored in an AtomicU64
#[derive(Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

struct HistogramSeries {
    /// Non-cumulative counts, one per bucket plus +Inf
    buckets: Vec<AtomicU64>,
    sum: AtomicF64,
    count: AtomicU64,
}

impl HistogramSeries {
    fn new() -> Self {
        Self {
            buckets: (0..=LATENCY_BUCKETS.len()).map(|_| AtomicU64::new(0)).collect(),
            sum: AtomicF64::default(),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        let idx = LATENCY_BUCKETS
            .iter()
            .position(|&le| value <= le)
            .unwrap_or(LATENCY_BUCKETS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum.add(value);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

enum Series {
    Scalar(AtomicF64),
    Histogram(HistogramSeries),
}

type LabelSet = Vec<(&'static str, String)>;

struct Family {
    help: &'static str,
    kind: Kind,
    series: RwLock<BTreeMap<LabelSet, Series>>,
}

impl Family {
    fn new(help: &'static str, kind: Kind) -> Self {
        Self {
            help,
            kind,
            series: RwLock::new(BTreeMap::new()),
        }
    }

    fn new_series(&self) -> Series {
        match self.kind {
            Kind::Histogram => Series::Histogram(HistogramSeries::new()),
            Kind::Counter | Kind::Gauge => Series::Scalar(AtomicF64::default()),
        }
    }

    fn apply(&self, series: &Series, value: f64) {
        match (self.kind, series) {
            (Kind::Counter, Series::Scalar(v)) => v.add(value),
            (Kind::Gauge, Series::Scalar(v)) => v.set(value),
            (Kind::Histogram, Series::Histogram(h)) => h.observe(value),
            _ => {}
        }
    }

    /// Apply a value to the series for `labels`, creating it on first use.
    fn update(&self, mut labels: LabelSet, value: f64) -> Result<()> {
        labels.sort();
        {
            let series = self
                .series
                .read()
                .map_err(|e| anyhow!("metrics lock poisoned: {}", e))?;
            if let Some(s) = series.get(&labels) {
                self.apply(s, value);
                return Ok(());
            }
        }

        let mut series = self
            .series
            .write()
            .map_err(|e| anyhow!("metrics lock poisoned: {}", e))?;
        let s = series.entry(labels).or_insert_with(|| self.new_series());
        self.apply(s, value);
        Ok(())
    }

    /// Create an empty series so it is exported before the first observation
    fn touch(&self, mut labels: LabelSet) {
        labels.sort();
        if let Ok(mut series) = self.series.write() {
            series.entry(labels).or_insert_with(|| self.new_series());
        }
    }

    fn render(&self, name: &str, out: &mut String) {
        let Ok(series) = self.series.read() else {
            return;
        };
        let _ = writeln!(out, "# HELP {} {}", name, self.help);
        let _ = writeln!(out, "# TYPE {} {}", name, self.kind.as_str());

        for (labels, s) in series.iter() {
            match s {
                Series::Scalar(v) => {
                    let _ = writeln!(out, "{}{} {}", name, format_labels(labels, None), v.get());
                }
                Series::Histogram(h) => {
                    let mut cumulative = 0u64;
                    for (i, bucket) in h.buckets.iter().enumerate() {
                        cumulative += bucket.load(Ordering::Relaxed);
                        let le = LATENCY_BUCKETS
                            .get(i)
                            .map(|b| b.to_string())
                            .unwrap_or_else(|| "+Inf".to_string());
                        let _ = writeln!(
                            out,
                            "{}_bucket{} {}",
                            name,
                            format_labels(labels, Some(&le)),
                            cumulative
                        );
                    }
                    let _ = writeln!(out, "{}_sum{} {}", name, format_labels(labels, None), h.sum.get());
                    let _ = writeln!(
                        out,
                        "{}_count{} {}",
                        name,
                        format_labels(labels, None),
                        h.count.load(Ordering::Relaxed)
                    );
                }
            }
        }
    }

    fn scalar(&self, labels: &LabelSet) -> Option<f64> {
        let series = self.series.read().ok()?;
        match series.get(labels)? {
            Series::Scalar(v) => Some(v.get()),
            Series::Histogram(h) => Some(h.count.load(Ordering::Relaxed) as f64),
        }
    }
}

fn format_labels(labels: &LabelSet, le: Option<&str>) -> String {
    if labels.is_empty() && le.is_none() {
        return String::new();
    }
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
        .collect();
    if let Some(le) = le {
        parts.push(format!("le=\"{}\"", le));
    }
    format!("{{{}}}", parts.join(","))
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// In-process metric store with Prometheus text exposition.
pub struct MetricsRegistry {
    families: BTreeMap<&'static str, Family>,
}

impl MetricsRegistry {
    /// Create a registry with series pre-created for every outcome and category
    pub fn new(categories: &[String]) -> Self {
        let mut families = BTreeMap::new();
        families.insert(
            REQUESTS_TOTAL,
            Family::new("Classification requests by outcome", Kind::Counter),
        );
        families.insert(
            LATENCY_SECONDS,
            Family::new("Classification latency in seconds", Kind::Histogram),
        );
        families.insert(
            PREDICTIONS_TOTAL,
            Family::new("Predictions by label and outcome", Kind::Counter),
        );
        families.insert(
            MODEL_READY,
            Family::new("1 once the model is loaded and serving", Kind::Gauge),
        );

        let registry = Self { families };

        for outcome in Outcome::ALL {
            let labels = vec![("outcome", outcome.as_str().to_string())];
            registry.families[REQUESTS_TOTAL].touch(labels.clone());
            registry.families[LATENCY_SECONDS].touch(labels);
        }
        for category in categories {
            registry.families[PREDICTIONS_TOTAL].touch(vec![
                ("label", category.clone()),
                ("outcome", Outcome::Success.as_str().to_string()),
            ]);
        }
        registry.families[MODEL_READY].touch(Vec::new());

        registry
    }

    /// Value of a counter or gauge series, or the observation count of a histogram
    pub fn value(&self, name: &str, labels: &[(&'static str, &str)]) -> Option<f64> {
        let mut key: LabelSet = labels.iter().map(|(k, v)| (*k, v.to_string())).collect();
        key.sort();
        self.families.get(name)?.scalar(&key)
    }

    /// Render every family in the Prometheus text format
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, family) in &self.families {
            family.render(name, &mut out);
        }
        out
    }

    /// Totals used by the periodic summary log
    pub fn summary(&self) -> MetricsSummary {
        let mut summary = MetricsSummary::default();

        if let Ok(series) = self.families[REQUESTS_TOTAL].series.read() {
            for (labels, s) in series.iter() {
                if let (Some((_, outcome)), Series::Scalar(v)) = (labels.first(), s) {
                    summary.requests_by_outcome.insert(outcome.clone(), v.get() as u64);
                }
            }
        }

        if let Ok(series) = self.families[PREDICTIONS_TOTAL].series.read() {
            for (labels, s) in series.iter() {
                let label = labels.iter().find(|(k, _)| *k == "label").map(|(_, v)| v);
                let success = labels
                    .iter()
                    .any(|(k, v)| *k == "outcome" && v == Outcome::Success.as_str());
                if let (Some(label), true, Series::Scalar(v)) = (label, success, s) {
                    summary.predictions_by_label.insert(label.clone(), v.get() as u64);
                }
            }
        }

        if let Ok(series) = self.families[LATENCY_SECONDS].series.read() {
            let (mut sum, mut count) = (0.0, 0u64);
            for s in series.values() {
                if let Series::Histogram(h) = s {
                    sum += h.sum.get();
                    count += h.count.load(Ordering::Relaxed);
                }
            }
            if count > 0 {
                summary.mean_latency_ms = sum / count as f64 * 1000.0;
            }
        }

        summary
    }
}

impl MetricSink for MetricsRegistry {
    fn record(&self, sample: &MetricSample) -> Result<()> {
        let family = self
            .families
            .get(sample.name)
            .ok_or_else(|| anyhow!("unknown metric '{}'", sample.name))?;
        family.update(sample.labels.clone(), sample.value)?;

        // every latency observation is one request
        if sample.name == LATENCY_SECONDS {
            self.families[REQUESTS_TOTAL].update(sample.labels.clone(), 1.0)?;
        }
        Ok(())
    }
}

/// Aggregated view for log summaries
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MetricsSummary {
    pub requests_by_outcome: BTreeMap<String, u64>,
    pub predictions_by_label: BTreeMap<String, u64>,
    pub mean_latency_ms: f64,
}

impl MetricsSummary {
    pub fn total_requests(&self) -> u64 {
        self.requests_by_outcome.values().sum()
    }
}

/// Periodic summary logger
pub struct MetricsReporter {
    registry: Arc<MetricsRegistry>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(registry: Arc<MetricsRegistry>, interval_secs: u64) -> Self {
        Self {
            registry,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        if self.interval_secs == 0 {
            return;
        }
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        // first tick fires immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let summary = self.registry.summary();
            info!(
                total_requests = summary.total_requests(),
                by_outcome = ?summary.requests_by_outcome,
                by_label = ?summary.predictions_by_label,
                mean_latency_ms = summary.mean_latency_ms,
                "Serving metrics summary"
            );
        }
    }
}
