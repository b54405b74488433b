//! # Inbound webhook pipeline
//!
//! verify signature -> parse -> per event: dedupe -> dispatch -> telemetry.
//!
//! A request is rejected as a whole only when its signature or its payload is
//! bad. Once parsed, events are handled strictly in order and one event's
//! failure never affects the others; the provider always gets a 200 so it does
//! not redeliver the whole payload.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use connector_common::dedupe::DedupeStore;
use connector_common::mask::mask_digits;
use connector_common::telemetry::{
    CounterLabels, HistogramLabels, ItemLog, Outcome, SummaryLabels, Telemetry,
};
use connector_common::types::{NormalizedEvent, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

use crate::api::{EventOutcome, WebhookResponse};
use crate::config::WebhookConfig;
use crate::handshake::{handshake, HandshakeOutcome, HandshakeQuery};
use crate::signature::SignatureVerifier;

const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Turns a provider payload into normalized events.
pub trait EventParser: Send + Sync {
    fn parse_event(&self, item: &Value) -> Result<NormalizedEvent, ValidationError>;

    /// Arrays are parsed item by item; anything else is a single event.
    fn parse_events(&self, payload: &Value) -> Result<Vec<NormalizedEvent>, ValidationError> {
        match payload {
            Value::Array(items) => items.iter().map(|item| self.parse_event(item)).collect(),
            item => Ok(vec![self.parse_event(item)?]),
        }
    }
}

#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn handle(&self, event: &NormalizedEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    Active,
    Planned,
    Disabled,
}

impl CapabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityStatus::Active => "active",
            CapabilityStatus::Planned => "planned",
            CapabilityStatus::Disabled => "disabled",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no handler registered for capability {0}")]
    NoHandler(String),
    #[error("capability {capability_id} is {}", .status.as_str())]
    Inactive {
        capability_id: String,
        status: CapabilityStatus,
    },
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::NoHandler(_) => "no_handler",
            DispatchError::Inactive { .. } => "capability_inactive",
        }
    }
}

struct RegisteredCapability {
    status: CapabilityStatus,
    handler: Arc<dyn CapabilityHandler>,
}

/// Handlers keyed by capability id.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, RegisteredCapability>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self, capability_id: &str, handler: Arc<dyn CapabilityHandler>) -> Self {
        self.register_with_status(capability_id, CapabilityStatus::Active, handler)
    }

    pub fn register_with_status(
        mut self,
        capability_id: &str,
        status: CapabilityStatus,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Self {
        self.capabilities.insert(
            capability_id.to_owned(),
            RegisteredCapability { status, handler },
        );
        self
    }

    pub fn status(&self, capability_id: &str) -> Option<CapabilityStatus> {
        self.capabilities
            .get(capability_id)
            .map(|capability| capability.status)
    }

    /// The handler for `capability_id`, if one is registered and active.
    pub fn resolve(&self, capability_id: &str) -> Result<Arc<dyn CapabilityHandler>, DispatchError> {
        let capability = self
            .capabilities
            .get(capability_id)
            .ok_or_else(|| DispatchError::NoHandler(capability_id.to_owned()))?;

        match capability.status {
            CapabilityStatus::Active => Ok(capability.handler.clone()),
            status => Err(DispatchError::Inactive {
                capability_id: capability_id.to_owned(),
                status,
            }),
        }
    }
}

pub struct WebhookPipeline {
    parser: Arc<dyn EventParser>,
    registry: CapabilityRegistry,
    dedupe: Arc<dyn DedupeStore>,
    dedupe_ttl: Duration,
    verifier: Option<SignatureVerifier>,
    verify_token: Option<String>,
    telemetry: Telemetry,
}

impl WebhookPipeline {
    pub fn new(
        parser: Arc<dyn EventParser>,
        registry: CapabilityRegistry,
        dedupe: Arc<dyn DedupeStore>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            parser,
            registry,
            dedupe,
            dedupe_ttl: DEFAULT_DEDUPE_TTL,
            verifier: None,
            verify_token: None,
            telemetry,
        }
    }

    pub fn from_config(
        config: &WebhookConfig,
        parser: Arc<dyn EventParser>,
        registry: CapabilityRegistry,
        dedupe: Arc<dyn DedupeStore>,
        telemetry: Telemetry,
    ) -> Self {
        let mut pipeline = Self::new(parser, registry, dedupe, telemetry)
            .dedupe_ttl(config.dedupe_ttl.0)
            .signature_verifier(config.signature_verifier());
        if let Some(token) = &config.verify_token {
            pipeline = pipeline.verify_token(token.as_str());
        }
        pipeline
    }

    pub fn signature_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn verify_token(mut self, token: &str) -> Self {
        self.verify_token = Some(token.to_owned());
        self
    }

    pub fn dedupe_ttl(mut self, ttl: Duration) -> Self {
        self.dedupe_ttl = ttl;
        self
    }

    /// Answer the provider's GET subscription challenge.
    pub fn handshake(&self, query: &HandshakeQuery) -> HandshakeOutcome {
        let outcome = handshake(query, self.verify_token.as_deref());
        if let HandshakeOutcome::Rejected(error) = &outcome {
            warn!(error_code = error.code(), "webhook handshake rejected");
        }
        outcome
    }

    /// Process one webhook delivery: `headers` and the raw, unparsed `body`.
    pub async fn handle(&self, headers: &HeaderMap, body: &[u8]) -> WebhookResponse {
        if let Some(verifier) = &self.verifier {
            let signature = headers
                .get(verifier.header_name())
                .and_then(|value| value.to_str().ok());

            if let Err(error) = verifier.verify(body, signature) {
                warn!(error_code = error.code(), "webhook signature rejected");
                return WebhookResponse::Rejected(error.into());
            }
        }

        let events = match self.parse(body) {
            Ok(events) => events,
            Err(error) => {
                warn!(error = %error, "webhook payload rejected");
                return WebhookResponse::Rejected(error.into());
            }
        };

        let mut outcomes = Vec::with_capacity(events.len());
        for event in &events {
            outcomes.push(self.process_event(event).await);
        }

        self.record_summary(&outcomes);
        WebhookResponse::Accepted(outcomes)
    }

    fn parse(&self, body: &[u8]) -> Result<Vec<NormalizedEvent>, ValidationError> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| ValidationError::field("body", &format!("not valid JSON: {e}")))?;

        self.parser.parse_events(&payload)
    }

    async fn process_event(&self, event: &NormalizedEvent) -> EventOutcome {
        let started = Instant::now();
        let connector = self
            .telemetry
            .resolve_connector(event.connector.as_deref(), None);

        let (outcome, error_code, error_message) = match self
            .dedupe
            .check_and_mark(&event.dedupe_key, self.dedupe_ttl)
            .await
        {
            Ok(true) => (Outcome::Deduped, None, None),
            Ok(false) => self.dispatch(event).await,
            Err(error) => (Outcome::Failed, Some("dedupe_failed"), Some(error.to_string())),
        };

        let result = EventOutcome {
            capability_id: event.capability_id.clone(),
            dedupe_key: event.dedupe_key.clone(),
            connector,
            outcome,
            error_code,
            error_message,
            latency: started.elapsed(),
        };
        self.record_event(event, &result);
        result
    }

    async fn dispatch(
        &self,
        event: &NormalizedEvent,
    ) -> (Outcome, Option<&'static str>, Option<String>) {
        let handler = match self.registry.resolve(&event.capability_id) {
            Ok(handler) => handler,
            Err(error) => return (Outcome::Failed, Some(error.code()), Some(error.to_string())),
        };

        match handler.handle(event).await {
            Ok(()) => (Outcome::Processed, None, None),
            Err(error) => (
                Outcome::Failed,
                Some("handler_failed"),
                Some(mask_digits(&format!("{error:#}")).into_owned()),
            ),
        }
    }

    fn record_event(&self, event: &NormalizedEvent, result: &EventOutcome) {
        let name = match result.outcome {
            Outcome::Deduped => "event_deduped_total",
            Outcome::Failed => "event_failed_total",
            Outcome::Processed | Outcome::Sent => "event_processed_total",
        };
        let capability = Some(result.capability_id.as_str());

        self.telemetry.counter(
            name,
            1,
            CounterLabels::new(&result.connector, result.outcome.as_str())
                .capability(capability)
                .error_code(result.error_code),
        );
        self.telemetry.histogram(
            "event_latency_ms",
            result.latency,
            HistogramLabels::new(&result.connector, capability, result.outcome.as_str()),
        );
        self.telemetry.log_item(
            "webhook event handled",
            &ItemLog {
                connector: &result.connector,
                capability_id: capability,
                dedupe_key: &result.dedupe_key,
                correlation_id: event.correlation_id.as_deref(),
                outcome: result.outcome.as_str(),
                error_code: result.error_code,
                error_message: result.error_message.as_deref(),
                latency_ms: result.latency.as_secs_f64() * 1_000.0,
                ..Default::default()
            },
        );
    }

    fn record_summary(&self, outcomes: &[EventOutcome]) {
        let count = |outcome: Outcome| {
            outcomes
                .iter()
                .filter(|result| result.outcome == outcome)
                .count() as u64
        };

        let connector = self
            .telemetry
            .batch_connector(outcomes.iter().map(|result| result.connector.as_str()));

        self.telemetry.summary(
            "webhook_batch_summary",
            outcomes.len() as u64,
            SummaryLabels {
                connector,
                processed: Some(count(Outcome::Processed)),
                deduped: Some(count(Outcome::Deduped)),
                failed: Some(count(Outcome::Failed)),
                ..Default::default()
            },
        );
    }
}
