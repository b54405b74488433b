use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Query parameters of a subscription verification request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("no verify token is configured")]
    NotConfigured,
    #[error("hub.mode must be subscribe")]
    InvalidMode,
    #[error("verify token does not match")]
    InvalidToken,
    #[error("hub.challenge is missing")]
    MissingChallenge,
}

impl HandshakeError {
    pub fn code(&self) -> &'static str {
        match self {
            HandshakeError::NotConfigured => "VERIFY_TOKEN_NOT_CONFIGURED",
            HandshakeError::InvalidMode => "INVALID_MODE",
            HandshakeError::InvalidToken => "INVALID_VERIFY_TOKEN",
            HandshakeError::MissingChallenge => "MISSING_CHALLENGE",
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "success": false,
            "errorCode": self.code(),
            "errorMessage": self.to_string(),
        })
    }

    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::FORBIDDEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Accepted { challenge: String },
    Rejected(HandshakeError),
}

impl HandshakeOutcome {
    pub fn to_json(&self) -> Value {
        match self {
            HandshakeOutcome::Accepted { challenge } => {
                json!({"success": true, "challenge": challenge})
            }
            HandshakeOutcome::Rejected(error) => error.to_json(),
        }
    }
}

impl IntoResponse for HandshakeOutcome {
    fn into_response(self) -> Response {
        match self {
            HandshakeOutcome::Accepted { challenge } => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                challenge,
            )
                .into_response(),
            HandshakeOutcome::Rejected(error) => {
                (error.status(), Json(error.to_json())).into_response()
            }
        }
    }
}

/// Answer a GET verification challenge against the configured verify token.
pub fn handshake(query: &HandshakeQuery, verify_token: Option<&str>) -> HandshakeOutcome {
    let Some(expected) = verify_token.filter(|token| !token.is_empty()) else {
        return HandshakeOutcome::Rejected(HandshakeError::NotConfigured);
    };

    if query.mode.as_deref() != Some("subscribe") {
        return HandshakeOutcome::Rejected(HandshakeError::InvalidMode);
    }

    if query.verify_token.as_deref() != Some(expected) {
        return HandshakeOutcome::Rejected(HandshakeError::InvalidToken);
    }

    match &query.challenge {
        Some(challenge) => HandshakeOutcome::Accepted {
            challenge: challenge.clone(),
        },
        None => HandshakeOutcome::Rejected(HandshakeError::MissingChallenge),
    }
}
