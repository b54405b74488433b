use std::future::ready;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::telemetry::{MetricsSink, TelemetryRecord};

/// Forwards telemetry records to the global `metrics` recorder.
///
/// Summaries have no direct Prometheus counterpart, so each count they carry
/// becomes a counter increment labeled by `field`.
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn record(&self, record: TelemetryRecord) {
        match record {
            TelemetryRecord::Counter(counter) => {
                metrics::counter!(counter.name, &counter.labels.to_pairs()).increment(counter.value);
            }
            TelemetryRecord::Histogram(histogram) => {
                metrics::histogram!(histogram.name, &histogram.labels.to_pairs())
                    .record(histogram.value);
            }
            TelemetryRecord::Summary(summary) => {
                let mut base = vec![("connector".to_owned(), summary.labels.connector.clone())];
                if let Some(capability_id) = &summary.labels.capability_id {
                    base.push(("capability_id".to_owned(), capability_id.clone()));
                }

                let counts = std::iter::once(("total", summary.total))
                    .chain(summary.labels.counts());
                for (field, count) in counts {
                    let mut labels = base.clone();
                    labels.push(("field".to_owned(), field.to_owned()));
                    metrics::counter!(summary.name, &labels).increment(count);
                }
            }
        }
    }
}

/// Build a Router serving the rendered metrics of `handle` on `/metrics`.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || ready(handle.render())))
}

/// Install the Prometheus recorder globally. Latencies are recorded in milliseconds.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_MILLISECONDS: &[f64] = &[
        1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_MILLISECONDS)?
        .install_recorder()
}
