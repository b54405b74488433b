//! # Types
//!
//! Provider-agnostic shapes that flow through the connector runtime: inbound
//! `NormalizedEvent`s produced by a parser and outbound `OutboundIntent`s
//! produced by callers.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum length of a text message body, in characters.
pub const MAX_TEXT_BODY_CHARS: usize = 4096;

/// Malformed input. Never retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}{}", display_field(.field), .message)]
pub struct ValidationError {
    pub field: Option<String>,
    pub message: String,
}

fn display_field(field: &Option<String>) -> String {
    match field {
        Some(field) => format!("invalid {field}: "),
        None => String::new(),
    }
}

impl ValidationError {
    pub fn new(message: &str) -> Self {
        Self {
            field: None,
            message: message.to_owned(),
        }
    }

    pub fn field(field: &str, message: &str) -> Self {
        Self {
            field: Some(field.to_owned()),
            message: message.to_owned(),
        }
    }
}

/// An inbound item, produced once per provider item by an `EventParser`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub capability_id: String,
    pub dedupe_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub payload: Value,
}

impl NormalizedEvent {
    pub fn new(capability_id: &str, dedupe_key: &str, payload: Value) -> Self {
        Self {
            capability_id: capability_id.to_owned(),
            dedupe_key: dedupe_key.to_owned(),
            connector: None,
            tenant: None,
            correlation_id: None,
            payload,
        }
    }

    pub fn with_connector(mut self, connector: &str) -> Self {
        self.connector = Some(connector.to_owned());
        self
    }

    pub fn with_tenant(mut self, tenant: &str) -> Self {
        self.tenant = Some(tenant.to_owned());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
    Sticker,
}

/// The message carried by an `OutboundIntent`, tagged by message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Text {
        body: String,
        #[serde(default)]
        preview_url: bool,
    },
    Template {
        name: String,
        language: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        components: Vec<Value>,
    },
    Media {
        kind: MediaKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Reaction {
        message_id: String,
        emoji: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
}

impl MessagePayload {
    pub fn message_type(&self) -> &'static str {
        match self {
            MessagePayload::Text { .. } => "text",
            MessagePayload::Template { .. } => "template",
            MessagePayload::Media { .. } => "media",
            MessagePayload::Reaction { .. } => "reaction",
            MessagePayload::Location { .. } => "location",
        }
    }

    /// Check the variant-specific constraints before anything is sent.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            MessagePayload::Text { body, .. } => {
                if body.trim().is_empty() {
                    return Err(ValidationError::field("body", "must not be empty"));
                }
                if body.chars().count() > MAX_TEXT_BODY_CHARS {
                    return Err(ValidationError::field(
                        "body",
                        &format!("must be at most {MAX_TEXT_BODY_CHARS} characters"),
                    ));
                }
                Ok(())
            }
            MessagePayload::Template { name, language, .. } => {
                if name.is_empty() {
                    return Err(ValidationError::field("name", "must not be empty"));
                }
                if language.is_empty() {
                    return Err(ValidationError::field("language", "must not be empty"));
                }
                Ok(())
            }
            MessagePayload::Media {
                kind,
                url,
                media_id,
                caption,
                ..
            } => {
                if url.is_none() && media_id.is_none() {
                    return Err(ValidationError::field(
                        "media",
                        "one of url or media_id is required",
                    ));
                }
                if caption.is_some() && matches!(kind, MediaKind::Audio | MediaKind::Sticker) {
                    return Err(ValidationError::field(
                        "caption",
                        "not supported for audio or sticker media",
                    ));
                }
                Ok(())
            }
            MessagePayload::Reaction { message_id, emoji } => {
                if message_id.is_empty() {
                    return Err(ValidationError::field("message_id", "must not be empty"));
                }
                if emoji.is_empty() {
                    return Err(ValidationError::field("emoji", "must not be empty"));
                }
                Ok(())
            }
            MessagePayload::Location {
                latitude,
                longitude,
                ..
            } => {
                if !(-90.0..=90.0).contains(latitude) {
                    return Err(ValidationError::field("latitude", "out of range"));
                }
                if !(-180.0..=180.0).contains(longitude) {
                    return Err(ValidationError::field("longitude", "out of range"));
                }
                Ok(())
            }
        }
    }
}

/// A caller-issued request to send one message through a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundIntent {
    pub intent_id: String,
    pub tenant_id: String,
    pub provider: String,
    pub to: String,
    pub payload: MessagePayload,
    pub dedupe_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_is_tagged_by_type() {
        let payload: MessagePayload = serde_json::from_value(json!({
            "type": "media",
            "kind": "image",
            "url": "https://cdn.example.com/cat.png",
            "caption": "a cat"
        }))
        .unwrap();

        assert_eq!(payload.message_type(), "media");
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn test_empty_text_is_rejected() {
        let payload = MessagePayload::Text {
            body: "   ".to_owned(),
            preview_url: false,
        };
        let err = payload.validate().unwrap_err();
        assert_eq!(err.field.as_deref(), Some("body"));
        assert_eq!(err.to_string(), "invalid body: must not be empty");
    }

    #[test]
    fn test_validation_error_without_field() {
        let err = ValidationError::new("payload must be an object");
        assert_eq!(err.to_string(), "payload must be an object");
    }

    #[test]
    fn test_media_requires_a_source() {
        let payload = MessagePayload::Media {
            kind: MediaKind::Document,
            url: None,
            media_id: None,
            caption: None,
            filename: Some("invoice.pdf".to_owned()),
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_audio_caption_is_rejected() {
        let payload = MessagePayload::Media {
            kind: MediaKind::Audio,
            url: None,
            media_id: Some("1234".to_owned()),
            caption: Some("listen".to_owned()),
            filename: None,
        };
        assert_eq!(
            payload.validate().unwrap_err().field.as_deref(),
            Some("caption")
        );
    }

    #[test]
    fn test_location_bounds() {
        let payload = MessagePayload::Location {
            latitude: 91.0,
            longitude: 0.0,
            name: None,
            address: None,
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_intent_deserializes_camel_case() {
        let intent: OutboundIntent = serde_json::from_value(json!({
            "intentId": "intent-1",
            "tenantId": "tenant-1",
            "provider": "whatsapp",
            "to": "+15551234567",
            "payload": {"type": "text", "body": "hello"},
            "dedupeKey": "whatsapp:outbound:intent-1",
            "createdAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(intent.intent_id, "intent-1");
        assert_eq!(intent.correlation_id, None);
        assert_eq!(intent.payload.message_type(), "text");
    }
}
