//! # Outbound batch processor
//!
//! Every intent gets exactly one terminal status: `sent`, `deduped` or
//! `failed`. Intents are handled strictly in order, and an intent's dedupe key
//! is marked before the provider is called, so a marked key never reaches the
//! provider twice. Retrying a provider call is the sender's business; here a
//! send either resolves or fails.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use connector_common::dedupe::{DedupeError, DedupeStore};
use connector_common::mask::{mask_digits, mask_recipient};
use connector_common::telemetry::{
    CounterLabels, HistogramLabels, ItemLog, Outcome, SummaryLabels, Telemetry,
};
use connector_common::types::OutboundIntent;
use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

/// The store failed and the fail mode blocked the send.
pub const DEDUPE_ERROR_BLOCKED: &str = "dedupe_error_blocked";
/// The store failed and the fail mode let the send through.
pub const DEDUPE_ERROR_ALLOWED: &str = "dedupe_error_allowed";

const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    pub provider_message_id: Option<String>,
    pub status_code: Option<u16>,
}

/// Delivers one intent to its provider.
#[async_trait]
pub trait ProviderSender: Send + Sync {
    async fn send_message(&self, intent: &OutboundIntent) -> anyhow::Result<SendReceipt>;
}

/// Rewrites an intent before it is sent, e.g. uploading media and swapping
/// the url for a provider media id.
#[async_trait]
pub trait IntentPreprocessor: Send + Sync {
    async fn preprocess(&self, intent: OutboundIntent) -> anyhow::Result<OutboundIntent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Sent,
    Deduped,
    Failed,
}

impl ItemStatus {
    fn outcome(&self) -> Outcome {
        match self {
            ItemStatus::Sent => Outcome::Sent,
            ItemStatus::Deduped => Outcome::Deduped,
            ItemStatus::Failed => Outcome::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub intent_id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_annotation: Option<String>,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: u64,
    pub sent: u64,
    pub deduped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub summary: BatchSummary,
    pub results: Vec<ItemResult>,
}

impl BatchResult {
    fn new(results: Vec<ItemResult>) -> Self {
        let mut summary = BatchSummary {
            total: results.len() as u64,
            ..Default::default()
        };
        for result in &results {
            match result.status {
                ItemStatus::Sent => summary.sent += 1,
                ItemStatus::Deduped => summary.deduped += 1,
                ItemStatus::Failed => summary.failed += 1,
            }
        }

        Self { summary, results }
    }
}

struct Delivery {
    status: ItemStatus,
    receipt: SendReceipt,
    error_code: Option<&'static str>,
    error_message: Option<String>,
}

impl Delivery {
    fn deduped() -> Self {
        Self {
            status: ItemStatus::Deduped,
            receipt: SendReceipt::default(),
            error_code: None,
            error_message: None,
        }
    }

    fn sent(receipt: SendReceipt) -> Self {
        Self {
            status: ItemStatus::Sent,
            receipt,
            error_code: None,
            error_message: None,
        }
    }

    fn failed(error_code: &'static str, message: &str) -> Self {
        Self {
            status: ItemStatus::Failed,
            receipt: SendReceipt::default(),
            error_code: Some(error_code),
            error_message: Some(mask_digits(message).into_owned()),
        }
    }
}

pub struct BatchProcessor {
    dedupe: Arc<dyn DedupeStore>,
    dedupe_ttl: Duration,
    preprocessor: Option<Arc<dyn IntentPreprocessor>>,
    telemetry: Telemetry,
}

impl BatchProcessor {
    pub fn new(dedupe: Arc<dyn DedupeStore>, telemetry: Telemetry) -> Self {
        Self {
            dedupe,
            dedupe_ttl: DEFAULT_DEDUPE_TTL,
            preprocessor: None,
            telemetry,
        }
    }

    pub fn dedupe_ttl(mut self, ttl: Duration) -> Self {
        self.dedupe_ttl = ttl;
        self
    }

    pub fn preprocessor(mut self, preprocessor: Arc<dyn IntentPreprocessor>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    /// Send every intent in order and report one result per intent. Never fails as a whole.
    pub async fn process(
        &self,
        intents: Vec<OutboundIntent>,
        sender: &dyn ProviderSender,
    ) -> BatchResult {
        let mut results = Vec::with_capacity(intents.len());
        let mut connectors = Vec::with_capacity(intents.len());

        for intent in intents {
            let connector = self.telemetry.resolve_connector(None, Some(&intent.provider));
            results.push(self.process_intent(intent, &connector, sender).await);
            connectors.push(connector);
        }

        let batch = BatchResult::new(results);
        self.telemetry.summary(
            "outbound_batch_summary",
            batch.summary.total,
            SummaryLabels {
                connector: self
                    .telemetry
                    .batch_connector(connectors.iter().map(String::as_str)),
                sent: Some(batch.summary.sent),
                deduped: Some(batch.summary.deduped),
                failed: Some(batch.summary.failed),
                ..Default::default()
            },
        );
        batch
    }

    async fn process_intent(
        &self,
        intent: OutboundIntent,
        connector: &str,
        sender: &dyn ProviderSender,
    ) -> ItemResult {
        let started = Instant::now();
        let intent_id = intent.intent_id.clone();
        let dedupe_key = intent.dedupe_key.clone();
        let correlation_id = intent.correlation_id.clone();
        let recipient = mask_recipient(&intent.to);

        let (duplicate, annotation) = match self
            .dedupe
            .try_check_and_mark(&intent.dedupe_key, self.dedupe_ttl)
            .await
        {
            Ok(duplicate) => (duplicate, None),
            Err(error) => self.resolve_dedupe_error(&error, &intent, connector),
        };

        let delivery = if duplicate {
            Delivery::deduped()
        } else {
            self.deliver(intent, sender, annotation).await
        };

        let latency = started.elapsed();
        let result = ItemResult {
            intent_id,
            status: delivery.status,
            status_code: delivery.receipt.status_code,
            provider_message_id: delivery.receipt.provider_message_id,
            error_code: delivery.error_code.map(str::to_owned),
            error_message: delivery.error_message,
            dedupe_annotation: annotation.map(str::to_owned),
            latency_ms: latency.as_secs_f64() * 1_000.0,
        };

        self.record_item(
            &result,
            connector,
            &dedupe_key,
            correlation_id.as_deref(),
            &recipient,
            latency,
        );
        result
    }

    fn resolve_dedupe_error(
        &self,
        error: &DedupeError,
        intent: &OutboundIntent,
        connector: &str,
    ) -> (bool, Option<&'static str>) {
        let fail_mode = self.dedupe.fail_mode();
        let annotation = if fail_mode.treat_as_duplicate() {
            DEDUPE_ERROR_BLOCKED
        } else {
            DEDUPE_ERROR_ALLOWED
        };

        warn!(
            connector,
            intent_id = %intent.intent_id,
            dedupe_key = %intent.dedupe_key,
            fail_mode = fail_mode.as_str(),
            dedupe_annotation = annotation,
            error = %error,
            "dedupe store check failed"
        );

        (fail_mode.treat_as_duplicate(), Some(annotation))
    }

    async fn deliver(
        &self,
        intent: OutboundIntent,
        sender: &dyn ProviderSender,
        annotation: Option<&'static str>,
    ) -> Delivery {
        if let Err(error) = intent.payload.validate() {
            return Delivery::failed("validation_failed", &error.to_string());
        }

        let intent = match &self.preprocessor {
            Some(preprocessor) => match preprocessor.preprocess(intent).await {
                Ok(intent) => intent,
                Err(error) => return Delivery::failed("preprocess_failed", &format!("{error:#}")),
            },
            None => intent,
        };

        match sender.send_message(&intent).await {
            Ok(receipt) => Delivery::sent(receipt),
            Err(error) => Delivery::failed(annotation.unwrap_or("send_failed"), &format!("{error:#}")),
        }
    }

    fn record_item(
        &self,
        result: &ItemResult,
        connector: &str,
        dedupe_key: &str,
        correlation_id: Option<&str>,
        recipient: &str,
        latency: Duration,
    ) {
        let outcome = result.status.outcome();
        let name = match result.status {
            ItemStatus::Sent => "outbound_sent_total",
            ItemStatus::Deduped => "outbound_deduped_total",
            ItemStatus::Failed => "outbound_failed_total",
        };

        self.telemetry.counter(
            name,
            1,
            CounterLabels::new(connector, outcome.as_str())
                .error_code(result.error_code.as_deref())
                .upstream_status(result.status_code),
        );
        self.telemetry.histogram(
            "outbound_latency_ms",
            latency,
            HistogramLabels::new(connector, None, outcome.as_str()),
        );
        self.telemetry.log_item(
            "outbound intent handled",
            &ItemLog {
                connector,
                intent_id: Some(&result.intent_id),
                dedupe_key,
                correlation_id,
                recipient: Some(recipient),
                outcome: outcome.as_str(),
                error_code: result.error_code.as_deref(),
                error_message: result.error_message.as_deref(),
                dedupe_annotation: result.dedupe_annotation.as_deref(),
                upstream_status: result.status_code,
                latency_ms: result.latency_ms,
                ..Default::default()
            },
        );
    }
}
