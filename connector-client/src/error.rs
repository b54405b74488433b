use std::fmt;
use std::time;

use connector_common::retry::InvalidBackoffConfig;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Provider codes Graph-style APIs use to signal throttling.
pub const DEFAULT_RATE_LIMIT_CODES: &[i64] = &[4, 17, 32, 613, 80007, 130429, 131048, 131056];
/// Provider codes signalling an expired or invalid access token.
pub const DEFAULT_AUTH_CODES: &[i64] = &[102, 190];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthError,
    RateLimit,
    ClientError,
    ServerError,
    NetworkError,
    Timeout,
    UnknownError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthError => "auth_error",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ClientError => "client_error",
            ErrorKind::ServerError => "server_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::UnknownError => "unknown_error",
        }
    }

    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::ServerError
                | ErrorKind::NetworkError
                | ErrorKind::Timeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub retry_after: Option<time::Duration>,
}

impl ErrorClassification {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            retryable: kind.default_retryable(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<time::Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// The `error` object of a provider error envelope.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProviderErrorBody {
    pub message: Option<String>,
    #[serde(rename = "type")]
    pub error_type: Option<String>,
    pub code: Option<i64>,
    pub error_subcode: Option<i64>,
    pub is_transient: Option<bool>,
    pub fbtrace_id: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ProviderErrorBody,
}

impl ProviderErrorBody {
    pub fn from_json(value: &Value) -> Option<Self> {
        serde_json::from_value::<ErrorEnvelope>(value.clone())
            .ok()
            .map(|envelope| envelope.error)
    }
}

/// Provider codes that override the status-based classification.
#[derive(Debug, Clone)]
pub struct ClassificationCodes {
    pub rate_limit: Vec<i64>,
    pub auth: Vec<i64>,
}

impl Default for ClassificationCodes {
    fn default() -> Self {
        Self {
            rate_limit: DEFAULT_RATE_LIMIT_CODES.to_vec(),
            auth: DEFAULT_AUTH_CODES.to_vec(),
        }
    }
}

/// Classify a non-2xx provider response. Rules are checked in order and the first match wins.
pub fn classify_response(
    status: u16,
    retry_after: Option<time::Duration>,
    error: Option<&ProviderErrorBody>,
    codes: &ClassificationCodes,
) -> ErrorClassification {
    let code = error.and_then(|error| error.code);
    let has_code = |known: &[i64]| code.is_some_and(|code| known.contains(&code));

    if status == 429 || has_code(&codes.rate_limit) {
        return ErrorClassification::new(ErrorKind::RateLimit).with_retry_after(retry_after);
    }

    if error.and_then(|error| error.is_transient) == Some(true) {
        return ErrorClassification::new(ErrorKind::ServerError);
    }

    if status == 401 || status == 403 || has_code(&codes.auth) {
        return ErrorClassification::new(ErrorKind::AuthError);
    }

    match status {
        500.. => ErrorClassification::new(ErrorKind::ServerError),
        400..=499 => ErrorClassification::new(ErrorKind::ClientError),
        _ => ErrorClassification::new(ErrorKind::UnknownError),
    }
}

/// Attempt to parse a Duration from a Retry-After header, returning None if not possible.
/// Retry-After header can specify a date in RFC2822 or a number of seconds; we try to parse both.
pub fn parse_retry_after_header(header_map: &reqwest::header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim();

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // A date in the past means no wait at all.
        return Some(duration.to_std().unwrap_or_default());
    }

    None
}

/// A provider call that failed for good, either non-retryable or out of attempts.
#[derive(Error, Debug, Clone)]
#[error("{} after {} attempt(s): {}", .classification.kind, .attempts, .message)]
pub struct ProviderError {
    classification: ErrorClassification,
    status: Option<u16>,
    provider_code: Option<i64>,
    message: String,
    attempts: u32,
}

impl ProviderError {
    pub(crate) fn new(classification: ErrorClassification, message: String) -> Self {
        Self {
            classification,
            status: None,
            provider_code: None,
            message,
            attempts: 1,
        }
    }

    pub(crate) fn with_response(mut self, status: u16, provider_code: Option<i64>) -> Self {
        self.status = Some(status);
        self.provider_code = provider_code;
        self
    }

    pub(crate) fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn classification(&self) -> &ErrorClassification {
        &self.classification
    }

    pub fn kind(&self) -> ErrorKind {
        self.classification.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.classification.retryable
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn provider_code(&self) -> Option<i64> {
        self.provider_code
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Provider message with digit runs already masked.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors building a `ProviderClient`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid provider base url: {0}")]
    BaseUrl(#[from] url::ParseError),
    #[error("failed to construct http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error(transparent)]
    Backoff(#[from] InvalidBackoffConfig),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(status: u16, error: Option<&ProviderErrorBody>) -> ErrorClassification {
        classify_response(status, None, error, &ClassificationCodes::default())
    }

    #[test]
    fn test_classify_by_status() {
        let rate_limited = classify(429, None);
        assert_eq!(rate_limited.kind, ErrorKind::RateLimit);
        assert!(rate_limited.retryable);

        for status in [401, 403] {
            let auth = classify(status, None);
            assert_eq!(auth.kind, ErrorKind::AuthError);
            assert!(!auth.retryable);
        }

        let server = classify(500, None);
        assert_eq!(server.kind, ErrorKind::ServerError);
        assert!(server.retryable);

        let not_found = classify(404, None);
        assert_eq!(not_found.kind, ErrorKind::ClientError);
        assert!(!not_found.retryable);

        let redirect = classify(302, None);
        assert_eq!(redirect.kind, ErrorKind::UnknownError);
        assert!(!redirect.retryable);
    }

    #[test]
    fn test_provider_codes_take_priority_over_status() {
        let throttled = ProviderErrorBody {
            code: Some(131056),
            ..Default::default()
        };
        assert_eq!(classify(400, Some(&throttled)).kind, ErrorKind::RateLimit);

        let expired_token = ProviderErrorBody {
            code: Some(190),
            ..Default::default()
        };
        assert_eq!(classify(400, Some(&expired_token)).kind, ErrorKind::AuthError);

        let transient = ProviderErrorBody {
            code: Some(2),
            is_transient: Some(true),
            ..Default::default()
        };
        let classification = classify(403, Some(&transient));
        assert_eq!(classification.kind, ErrorKind::ServerError);
        assert!(classification.retryable);
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let classification = classify_response(
            429,
            Some(time::Duration::from_secs(3)),
            None,
            &ClassificationCodes::default(),
        );
        assert_eq!(classification.retry_after, Some(time::Duration::from_secs(3)));

        let server = classify_response(
            503,
            Some(time::Duration::from_secs(3)),
            None,
            &ClassificationCodes::default(),
        );
        assert_eq!(server.retry_after, None);
    }

    #[test]
    fn test_custom_codes() {
        let codes = ClassificationCodes {
            rate_limit: vec![9000],
            auth: vec![],
        };
        let body = ProviderErrorBody {
            code: Some(9000),
            ..Default::default()
        };
        assert_eq!(
            classify_response(400, None, Some(&body), &codes).kind,
            ErrorKind::RateLimit
        );

        let token = ProviderErrorBody {
            code: Some(190),
            ..Default::default()
        };
        assert_eq!(
            classify_response(400, None, Some(&token), &codes).kind,
            ErrorKind::ClientError
        );
    }

    #[test]
    fn test_error_envelope_parsing() {
        let value = json!({
            "error": {
                "message": "(#131056) Too many messages",
                "type": "OAuthException",
                "code": 131056,
                "error_subcode": 2494055,
                "fbtrace_id": "AbCdEf"
            }
        });
        let body = ProviderErrorBody::from_json(&value).unwrap();

        assert_eq!(body.code, Some(131056));
        assert_eq!(body.error_type.as_deref(), Some("OAuthException"));
        assert_eq!(body.is_transient, None);

        assert!(ProviderErrorBody::from_json(&json!({"ok": true})).is_none());
    }

    #[test]
    fn test_parse_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "120".parse().unwrap());

        let duration = parse_retry_after_header(&headers).unwrap();
        assert_eq!(duration, time::Duration::from_secs(120));

        headers.remove(reqwest::header::RETRY_AFTER);

        let duration = parse_retry_after_header(&headers);
        assert_eq!(duration, None);

        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );

        let duration = parse_retry_after_header(&headers);
        assert_eq!(duration, Some(time::Duration::ZERO));

        headers.insert(reqwest::header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(parse_retry_after_header(&headers), None);
    }

    #[test]
    fn test_error_display() {
        let error = ProviderError::new(
            ErrorClassification::new(ErrorKind::ClientError),
            "recipient ***4567 is invalid".to_owned(),
        )
        .with_response(400, Some(131026))
        .with_attempts(1);

        assert_eq!(
            error.to_string(),
            "client_error after 1 attempt(s): recipient ***4567 is invalid"
        );
        assert_eq!(error.status(), Some(400));
        assert_eq!(error.provider_code(), Some(131026));
    }
}
