use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use connector_common::telemetry::Outcome;
use connector_common::types::ValidationError;
use serde_json::{json, Value};
use thiserror::Error;

use crate::signature::SignatureError;

/// Failures that reject a whole webhook request before any event is processed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WebhookError {
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("failed to parse webhook payload: {0}")]
    Validation(#[from] ValidationError),
}

impl WebhookError {
    pub fn code(&self) -> &'static str {
        match self {
            WebhookError::Signature(error) => error.code(),
            WebhookError::Validation(_) => "VALIDATION_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            WebhookError::Signature(SignatureError::NotConfigured) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            WebhookError::Signature(_) => StatusCode::UNAUTHORIZED,
            WebhookError::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Terminal state of one normalized event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventOutcome {
    pub capability_id: String,
    pub dedupe_key: String,
    pub connector: String,
    pub outcome: Outcome,
    pub error_code: Option<&'static str>,
    pub error_message: Option<String>,
    pub latency: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookResponse {
    Accepted(Vec<EventOutcome>),
    Rejected(WebhookError),
}

impl WebhookResponse {
    pub fn status(&self) -> StatusCode {
        match self {
            WebhookResponse::Accepted(_) => StatusCode::OK,
            WebhookResponse::Rejected(error) => error.status(),
        }
    }

    pub fn outcomes(&self) -> &[EventOutcome] {
        match self {
            WebhookResponse::Accepted(outcomes) => outcomes,
            WebhookResponse::Rejected(_) => &[],
        }
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes()
            .iter()
            .filter(|event| event.outcome == outcome)
            .count()
    }

    pub fn to_json(&self) -> Value {
        match self {
            WebhookResponse::Accepted(_) => json!({
                "success": true,
                "processed": self.count(Outcome::Processed),
                "deduped": self.count(Outcome::Deduped),
                "failed": self.count(Outcome::Failed),
            }),
            WebhookResponse::Rejected(error) => json!({
                "success": false,
                "errorCode": error.code(),
                "errorMessage": error.to_string(),
            }),
        }
    }
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_json())).into_response()
    }
}
