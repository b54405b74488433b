//! # Telemetry
//!
//! Typed telemetry records and the `Telemetry` handle every component is built
//! with. The record types keep count-type telemetry and timing telemetry apart
//! by construction: a `CounterRecord` has nowhere to put a latency, and a
//! `HistogramRecord` always carries exactly one duration value.
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{info, warn};

/// Terminal status of one inbound event or outbound intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    Sent,
    Deduped,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Processed => "processed",
            Outcome::Sent => "sent",
            Outcome::Deduped => "deduped",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterLabels {
    pub connector: String,
    pub capability_id: Option<String>,
    pub outcome: String,
    pub error_code: Option<String>,
    pub upstream_status: Option<u16>,
}

impl CounterLabels {
    pub fn new(connector: &str, outcome: &str) -> Self {
        Self {
            connector: connector.to_owned(),
            capability_id: None,
            outcome: outcome.to_owned(),
            error_code: None,
            upstream_status: None,
        }
    }

    pub fn capability(mut self, capability_id: Option<&str>) -> Self {
        self.capability_id = capability_id.map(str::to_owned);
        self
    }

    pub fn error_code(mut self, error_code: Option<&str>) -> Self {
        self.error_code = error_code.map(str::to_owned);
        self
    }

    pub fn upstream_status(mut self, status: Option<u16>) -> Self {
        self.upstream_status = status;
        self
    }

    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("connector".to_owned(), self.connector.clone()),
            ("outcome".to_owned(), self.outcome.clone()),
        ];
        if let Some(capability_id) = &self.capability_id {
            pairs.push(("capability_id".to_owned(), capability_id.clone()));
        }
        if let Some(error_code) = &self.error_code {
            pairs.push(("error_code".to_owned(), error_code.clone()));
        }
        if let Some(status) = self.upstream_status {
            pairs.push(("upstream_status".to_owned(), status.to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramLabels {
    pub connector: String,
    pub capability_id: Option<String>,
    pub outcome: String,
}

impl HistogramLabels {
    pub fn new(connector: &str, capability_id: Option<&str>, outcome: &str) -> Self {
        Self {
            connector: connector.to_owned(),
            capability_id: capability_id.map(str::to_owned),
            outcome: outcome.to_owned(),
        }
    }

    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("connector".to_owned(), self.connector.clone()),
            ("outcome".to_owned(), self.outcome.clone()),
        ];
        if let Some(capability_id) = &self.capability_id {
            pairs.push(("capability_id".to_owned(), capability_id.clone()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryLabels {
    pub connector: String,
    pub capability_id: Option<String>,
    pub processed: Option<u64>,
    pub sent: Option<u64>,
    pub deduped: Option<u64>,
    pub failed: Option<u64>,
}

impl SummaryLabels {
    /// The per-outcome counts carried by the summary, in a fixed order.
    pub fn counts(&self) -> Vec<(&'static str, u64)> {
        [
            ("processed", self.processed),
            ("sent", self.sent),
            ("deduped", self.deduped),
            ("failed", self.failed),
        ]
        .into_iter()
        .filter_map(|(field, count)| count.map(|count| (field, count)))
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    Milliseconds,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CounterRecord {
    pub name: &'static str,
    pub value: u64,
    pub labels: CounterLabels,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramRecord {
    pub name: &'static str,
    pub value: f64,
    pub unit: MetricUnit,
    pub labels: HistogramLabels,
}

impl HistogramRecord {
    pub fn is_duration(&self) -> bool {
        matches!(self.unit, MetricUnit::Milliseconds)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRecord {
    pub name: &'static str,
    pub total: u64,
    pub labels: SummaryLabels,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryRecord {
    Counter(CounterRecord),
    Histogram(HistogramRecord),
    Summary(SummaryRecord),
}

/// Destination for telemetry records.
pub trait MetricsSink: Send + Sync {
    fn record(&self, record: TelemetryRecord);
}

pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record(&self, _record: TelemetryRecord) {}
}

/// Keeps every record in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<TelemetryRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_records(&self) -> MutexGuard<'_, Vec<TelemetryRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.lock_records().clone()
    }

    pub fn counters(&self) -> Vec<CounterRecord> {
        self.lock_records()
            .iter()
            .filter_map(|record| match record {
                TelemetryRecord::Counter(counter) => Some(counter.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn counters_named(&self, name: &str) -> Vec<CounterRecord> {
        self.counters()
            .into_iter()
            .filter(|counter| counter.name == name)
            .collect()
    }

    pub fn histograms(&self) -> Vec<HistogramRecord> {
        self.lock_records()
            .iter()
            .filter_map(|record| match record {
                TelemetryRecord::Histogram(histogram) => Some(histogram.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn summaries(&self) -> Vec<SummaryRecord> {
        self.lock_records()
            .iter()
            .filter_map(|record| match record {
                TelemetryRecord::Summary(summary) => Some(summary.clone()),
                _ => None,
            })
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn record(&self, record: TelemetryRecord) {
        self.lock_records().push(record);
    }
}

/// Pick the connector a single item is attributed to. Resolved per item so a
/// batch mixing connectors is attributed correctly.
pub fn resolve_connector(
    item_connector: Option<&str>,
    provider: Option<&str>,
    manifest_id: Option<&str>,
    default_connector: &str,
) -> String {
    [item_connector, provider, manifest_id]
        .into_iter()
        .flatten()
        .find(|candidate| !candidate.is_empty())
        .unwrap_or(default_connector)
        .to_owned()
}

/// One structured log line describing a single item's outcome.
#[derive(Debug, Clone, Default)]
pub struct ItemLog<'a> {
    pub connector: &'a str,
    pub capability_id: Option<&'a str>,
    pub intent_id: Option<&'a str>,
    pub dedupe_key: &'a str,
    pub correlation_id: Option<&'a str>,
    pub recipient: Option<&'a str>,
    pub outcome: &'a str,
    pub error_code: Option<&'a str>,
    pub error_message: Option<&'a str>,
    pub dedupe_annotation: Option<&'a str>,
    pub upstream_status: Option<u16>,
    pub latency_ms: f64,
}

/// Handle injected into every component that emits metrics or item logs.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn MetricsSink>,
    manifest_id: Option<String>,
    default_connector: String,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn MetricsSink>, default_connector: &str) -> Self {
        Self {
            sink,
            manifest_id: None,
            default_connector: default_connector.to_owned(),
        }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopSink), "unknown")
    }

    pub fn with_manifest_id(mut self, manifest_id: Option<&str>) -> Self {
        self.manifest_id = manifest_id.map(str::to_owned);
        self
    }

    pub fn resolve_connector(&self, item_connector: Option<&str>, provider: Option<&str>) -> String {
        resolve_connector(
            item_connector,
            provider,
            self.manifest_id.as_deref(),
            &self.default_connector,
        )
    }

    /// Connector a whole batch is attributed to: the shared connector when every
    /// item resolved to the same one, the static fallback otherwise.
    pub fn batch_connector<'a>(&self, connectors: impl IntoIterator<Item = &'a str>) -> String {
        let mut connectors = connectors.into_iter();
        match connectors.next() {
            Some(first) if connectors.all(|connector| connector == first) => first.to_owned(),
            _ => self.resolve_connector(None, None),
        }
    }

    pub fn counter(&self, name: &'static str, value: u64, labels: CounterLabels) {
        self.sink
            .record(TelemetryRecord::Counter(CounterRecord { name, value, labels }));
    }

    pub fn histogram(&self, name: &'static str, latency: Duration, labels: HistogramLabels) {
        self.sink.record(TelemetryRecord::Histogram(HistogramRecord {
            name,
            value: latency.as_secs_f64() * 1_000.0,
            unit: MetricUnit::Milliseconds,
            labels,
        }));
    }

    pub fn summary(&self, name: &'static str, total: u64, labels: SummaryLabels) {
        self.sink
            .record(TelemetryRecord::Summary(SummaryRecord { name, total, labels }));
    }

    pub fn log_item(&self, message: &'static str, item: &ItemLog<'_>) {
        if item.error_code.is_some() {
            warn!(
                connector = item.connector,
                capability_id = item.capability_id,
                intent_id = item.intent_id,
                dedupe_key = item.dedupe_key,
                correlation_id = item.correlation_id,
                recipient = item.recipient,
                outcome = item.outcome,
                error_code = item.error_code,
                error_message = item.error_message,
                dedupe_annotation = item.dedupe_annotation,
                upstream_status = item.upstream_status,
                latency_ms = item.latency_ms,
                "{}",
                message
            );
        } else {
            info!(
                connector = item.connector,
                capability_id = item.capability_id,
                intent_id = item.intent_id,
                dedupe_key = item.dedupe_key,
                correlation_id = item.correlation_id,
                recipient = item.recipient,
                outcome = item.outcome,
                dedupe_annotation = item.dedupe_annotation,
                upstream_status = item.upstream_status,
                latency_ms = item.latency_ms,
                "{}",
                message
            );
        }
    }
}
