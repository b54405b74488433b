use std::sync::{Arc, Mutex};

use assert_json_diff::assert_json_eq;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use connector_common::dedupe::{FailMode, MemoryDedupeStore, MockRedisClient, RedisDedupeStore};
use connector_common::telemetry::{MemorySink, Outcome, Telemetry, TelemetryRecord};
use connector_common::types::{NormalizedEvent, ValidationError};
use connector_pipeline::handshake::HandshakeQuery;
use connector_pipeline::inbound::{
    CapabilityHandler, CapabilityRegistry, EventParser, WebhookPipeline,
};
use connector_pipeline::signature::SignatureVerifier;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

/// Parses the `entry[].changes[]` envelope, one event per change.
struct ChangesParser;

impl EventParser for ChangesParser {
    fn parse_event(&self, item: &Value) -> Result<NormalizedEvent, ValidationError> {
        let field = item["field"]
            .as_str()
            .ok_or_else(|| ValidationError::field("field", "missing"))?;
        let id = item["value"]["id"]
            .as_str()
            .ok_or_else(|| ValidationError::field("value.id", "missing"))?;

        Ok(
            NormalizedEvent::new(field, &format!("whatsapp:{field}:{id}"), item["value"].clone())
                .with_correlation_id(id),
        )
    }

    fn parse_events(&self, payload: &Value) -> Result<Vec<NormalizedEvent>, ValidationError> {
        let entries = payload["entry"]
            .as_array()
            .ok_or_else(|| ValidationError::field("entry", "must be an array"))?;

        entries
            .iter()
            .flat_map(|entry| entry["changes"].as_array().into_iter().flatten())
            .map(|change| self.parse_event(change))
            .collect()
    }
}

#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl CapabilityHandler for RecordingHandler {
    async fn handle(&self, event: &NormalizedEvent) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(event.dedupe_key.clone());
        if self.fail {
            anyhow::bail!("downstream rejected {}", event.dedupe_key);
        }
        Ok(())
    }
}

fn webhook_body(changes: &[(&str, &str)]) -> Vec<u8> {
    let changes: Vec<Value> = changes
        .iter()
        .map(|(field, id)| json!({"field": field, "value": {"id": id}}))
        .collect();

    serde_json::to_vec(&json!({
        "object": "whatsapp_business_account",
        "entry": [{"id": "waba-1", "changes": changes}]
    }))
    .unwrap()
}

struct Harness {
    pipeline: WebhookPipeline,
    sink: MemorySink,
    messages: Arc<RecordingHandler>,
    statuses: Arc<RecordingHandler>,
}

fn harness() -> Harness {
    let sink = MemorySink::new();
    let messages = Arc::new(RecordingHandler::default());
    let statuses = Arc::new(RecordingHandler {
        fail: true,
        ..Default::default()
    });
    let registry = CapabilityRegistry::new()
        .register("messages", messages.clone())
        .register("statuses", statuses.clone());

    let pipeline = WebhookPipeline::new(
        Arc::new(ChangesParser),
        registry,
        Arc::new(MemoryDedupeStore::new()),
        Telemetry::new(Arc::new(sink.clone()), "unknown").with_manifest_id(Some("whatsapp")),
    );

    Harness {
        pipeline,
        sink,
        messages,
        statuses,
    }
}

#[tokio::test]
async fn mixed_batch_is_acknowledged_with_per_item_outcomes() {
    let harness = harness();
    let body = webhook_body(&[("messages", "m1"), ("messages", "m2"), ("statuses", "s1")]);

    let response = harness.pipeline.handle(&HeaderMap::new(), &body).await;

    assert_eq!(response.status(), StatusCode::OK);
    let outcomes: Vec<Outcome> = response.outcomes().iter().map(|o| o.outcome).collect();
    assert_eq!(
        outcomes,
        vec![Outcome::Processed, Outcome::Processed, Outcome::Failed]
    );
    assert_eq!(harness.sink.counters_named("event_failed_total").len(), 1);
    assert_eq!(harness.sink.counters_named("event_processed_total").len(), 2);
    assert_eq!(*harness.statuses.seen.lock().unwrap(), vec!["whatsapp:statuses:s1"]);

    assert_json_eq!(
        response.to_json(),
        json!({"success": true, "processed": 2, "deduped": 0, "failed": 1})
    );

    let summaries = harness.sink.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].name, "webhook_batch_summary");
    assert_eq!(summaries[0].total, 3);
    assert_eq!(summaries[0].labels.failed, Some(1));
}

#[tokio::test]
async fn replayed_delivery_is_deduplicated() {
    let harness = harness();
    let body = webhook_body(&[("messages", "m1"), ("messages", "m2")]);

    let first = harness.pipeline.handle(&HeaderMap::new(), &body).await;
    let second = harness.pipeline.handle(&HeaderMap::new(), &body).await;

    assert!(first
        .outcomes()
        .iter()
        .all(|outcome| outcome.outcome == Outcome::Processed));
    assert!(second
        .outcomes()
        .iter()
        .all(|outcome| outcome.outcome == Outcome::Deduped));
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(harness.messages.seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn counters_and_histograms_stay_apart() {
    let harness = harness();
    let body = webhook_body(&[("messages", "m1"), ("statuses", "s1"), ("unknown", "u1")]);

    harness.pipeline.handle(&HeaderMap::new(), &body).await;

    let records = harness.sink.records();
    assert!(!records.is_empty());
    for record in records {
        match record {
            TelemetryRecord::Counter(counter) => {
                let keys: Vec<String> = counter
                    .labels
                    .to_pairs()
                    .into_iter()
                    .map(|(key, _)| key)
                    .collect();
                assert!(!keys.iter().any(|key| key.contains("latency")));
                assert_eq!(counter.value, 1);
            }
            TelemetryRecord::Histogram(histogram) => {
                assert!(histogram.is_duration());
                assert!(histogram.value >= 0.0);
                assert_eq!(histogram.name, "event_latency_ms");
            }
            TelemetryRecord::Summary(summary) => assert_eq!(summary.total, 3),
        }
    }
}

#[tokio::test]
async fn instances_sharing_a_store_deliver_once() {
    let backend = MockRedisClient::new();
    let handler = Arc::new(RecordingHandler::default());

    let instance = |sink: &MemorySink| {
        WebhookPipeline::new(
            Arc::new(ChangesParser),
            CapabilityRegistry::new().register("messages", handler.clone()),
            Arc::new(RedisDedupeStore::new(
                Arc::new(backend.clone()),
                "dedupe",
                FailMode::Open,
            )),
            Telemetry::new(Arc::new(sink.clone()), "whatsapp"),
        )
    };
    let sink = MemorySink::new();
    let (first, second) = (instance(&sink), instance(&sink));
    let body = webhook_body(&[("messages", "m1")]);

    let a = first.handle(&HeaderMap::new(), &body).await;
    let b = second.handle(&HeaderMap::new(), &body).await;

    assert_eq!(a.count(Outcome::Processed), 1);
    assert_eq!(b.count(Outcome::Deduped), 1);
    assert_eq!(handler.seen.lock().unwrap().len(), 1);
}

async fn receive(
    State(pipeline): State<Arc<WebhookPipeline>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    pipeline.handle(&headers, &body).await
}

async fn verify(
    State(pipeline): State<Arc<WebhookPipeline>>,
    Query(query): Query<HandshakeQuery>,
) -> impl IntoResponse {
    pipeline.handshake(&query)
}

fn router(pipeline: WebhookPipeline) -> Router {
    Router::new()
        .route("/webhook", get(verify).post(receive))
        .with_state(Arc::new(pipeline))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn signed_deliveries_through_a_router() {
    let verifier = SignatureVerifier::new("app-secret");
    let app = router(
        harness()
            .pipeline
            .signature_verifier(verifier.clone())
            .verify_token("verify-me"),
    );
    let body = webhook_body(&[("messages", "m1")]);

    let unsigned = app
        .clone()
        .oneshot(
            Request::post("/webhook")
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);
    assert_json_eq!(
        body_json(unsigned).await,
        json!({
            "success": false,
            "errorCode": "MISSING_SIGNATURE",
            "errorMessage": "request carries no signature header"
        })
    );

    let signed = app
        .clone()
        .oneshot(
            Request::post("/webhook")
                .header("X-Hub-Signature-256", verifier.sign(&body).unwrap())
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(signed.status(), StatusCode::OK);
    assert_eq!(body_json(signed).await["processed"], 1);

    let malformed = b"{\"entry\": 3}".to_vec();
    let rejected = app
        .clone()
        .oneshot(
            Request::post("/webhook")
                .header("X-Hub-Signature-256", verifier.sign(&malformed).unwrap())
                .body(Body::from(malformed))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

    let challenge = app
        .clone()
        .oneshot(
            Request::get("/webhook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=8812")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(challenge.status(), StatusCode::OK);
    let text = challenge.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&text[..], b"8812");

    let forbidden = app
        .oneshot(
            Request::get("/webhook?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
}
