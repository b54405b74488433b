//! Authenticated calls against a provider's HTTP API.
//!
//! One `send` is one logical remote call: the request is replayed on retryable
//! failures until the backoff policy runs out, and anything else comes back
//! as a classified `ProviderError`.
use std::sync::LazyLock;
use std::time;

use connector_common::mask::mask_digits;
use connector_common::retry::{retry_with_delay_floor, BackoffConfig};
use connector_common::telemetry::{CounterLabels, HistogramLabels, Telemetry};
use regex::Regex;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};
use url::Url;

use crate::config::ProviderClientConfig;
use crate::error::{
    classify_response, parse_retry_after_header, ClassificationCodes, ConfigError,
    ErrorClassification, ErrorKind, ProviderError, ProviderErrorBody,
};

static VERSIONED_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v\d+(\.\d+)*(/|$)").unwrap());

const MAX_ERROR_TEXT_CHARS: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    /// Pre-encoded body sent as-is with its own content type.
    Raw {
        body: String,
        content_type: String,
    },
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Option<time::Duration>,
}

impl ProviderRequest {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_owned(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn raw(mut self, body: &str, content_type: &str) -> Self {
        self.body = RequestBody::Raw {
            body: body.to_owned(),
            content_type: content_type.to_owned(),
        };
        self
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_owned(), value.to_owned()));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Deadline for this call only, replacing the client-wide request timeout.
    pub fn timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

impl ResponseBody {
    fn parse(text: String) -> Self {
        match serde_json::from_str(&text) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(text),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_version: Option<String>,
    access_token: Option<String>,
    request_timeout: time::Duration,
    backoff: BackoffConfig,
    codes: ClassificationCodes,
    connector: String,
    telemetry: Telemetry,
}

impl ProviderClient {
    pub fn new(base_url: &str, telemetry: Telemetry) -> Result<Self, ConfigError> {
        Url::parse(base_url)?;

        let http = reqwest::Client::builder()
            .user_agent("connector-client")
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_version: None,
            access_token: None,
            request_timeout: time::Duration::from_secs(10),
            backoff: BackoffConfig::build(2.0, time::Duration::from_secs(1)).provide(),
            codes: ClassificationCodes::default(),
            connector: telemetry.resolve_connector(None, None),
            telemetry,
        })
    }

    pub fn from_config(
        config: &ProviderClientConfig,
        telemetry: Telemetry,
    ) -> Result<Self, ConfigError> {
        let backoff = config.backoff.provide();
        backoff.validate()?;

        let mut client = Self::new(config.base_url.as_str(), telemetry)?
            .request_timeout(config.request_timeout.0)
            .backoff(backoff);
        if let Some(version) = &config.api_version {
            client = client.api_version(version.as_str());
        }
        if let Some(token) = &config.access_token {
            client = client.access_token(token.as_str());
        }
        if let Some(connector) = &config.connector {
            client = client.connector(connector.as_str());
        }

        Ok(client)
    }

    pub fn api_version(mut self, version: &str) -> Self {
        self.api_version = Some(version.trim_matches('/').to_owned());
        self
    }

    pub fn access_token(mut self, token: &str) -> Self {
        self.access_token = Some(token.to_owned());
        self
    }

    pub fn request_timeout(mut self, timeout: time::Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn classification_codes(mut self, codes: ClassificationCodes) -> Self {
        self.codes = codes;
        self
    }

    pub fn connector(mut self, connector: &str) -> Self {
        self.connector = self.telemetry.resolve_connector(Some(connector), None);
        self
    }

    /// Resolve `path` against `{base_url}/{api_version}`. Absolute URLs pass
    /// through untouched and paths that already start with a version segment
    /// are not prefixed again.
    pub fn build_url(&self, path: &str) -> Result<Url, url::ParseError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path);
        }

        let path = path.trim_start_matches('/');
        match &self.api_version {
            Some(version) if !VERSIONED_PATH.is_match(path) => {
                Url::parse(&format!("{}/{}/{}", self.base_url, version, path))
            }
            _ => Url::parse(&format!("{}/{}", self.base_url, path)),
        }
    }

    pub async fn get(&self, path: &str) -> Result<ProviderResponse, ProviderError> {
        self.send(ProviderRequest::get(path)).await
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: Value,
    ) -> Result<ProviderResponse, ProviderError> {
        self.send(ProviderRequest::post(path).json(body)).await
    }

    /// Issue `request`, retrying retryable failures until the backoff policy is exhausted.
    pub async fn send(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let url = self.build_url(&request.path).map_err(|e| {
            ProviderError::new(
                ErrorClassification::new(ErrorKind::ClientError),
                format!("invalid request url: {e}"),
            )
        })?;

        let request = &request;
        let url = &url;
        retry_with_delay_floor(
            &self.backoff,
            ProviderError::is_retryable,
            |error| error.classification().retry_after.unwrap_or_default(),
            move |attempt| async move {
                let started = Instant::now();
                let result = self.attempt(request, url.clone()).await;
                let latency = started.elapsed();

                match result {
                    Ok(response) => {
                        self.record_success(request, attempt, latency, response.status);
                        Ok(response)
                    }
                    Err(error) => {
                        let error = error.with_attempts(attempt + 1);
                        let will_retry = error.is_retryable() && self.backoff.should_retry(attempt);
                        self.record_failure(request, attempt, latency, &error, will_retry);
                        Err(error)
                    }
                }
            },
        )
        .await
    }

    async fn attempt(
        &self,
        request: &ProviderRequest,
        url: Url,
    ) -> Result<ProviderResponse, ProviderError> {
        let mut builder = self.http.request(request.method.clone(), url);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Raw { body, content_type } => builder
                .header(CONTENT_TYPE, content_type.as_str())
                .body(body.clone()),
        };

        let call = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, headers, text))
        };

        let budget = request.timeout.unwrap_or(self.request_timeout);
        let (status, headers, text) = match tokio::time::timeout(budget, call).await {
            Err(_) => {
                return Err(ProviderError::new(
                    ErrorClassification::new(ErrorKind::Timeout),
                    format!("request timed out after {}ms", budget.as_millis()),
                ))
            }
            Ok(Err(e)) => return Err(transport_error(&e)),
            Ok(Ok(parts)) => parts,
        };

        let body = ResponseBody::parse(text);
        if (200..300).contains(&status) {
            return Ok(ProviderResponse {
                status,
                headers,
                body,
            });
        }

        let error_body = body.as_json().and_then(ProviderErrorBody::from_json);
        let classification = classify_response(
            status,
            parse_retry_after_header(&headers),
            error_body.as_ref(),
            &self.codes,
        );
        let message = error_message(status, error_body.as_ref(), &body);

        Err(ProviderError::new(classification, message)
            .with_response(status, error_body.and_then(|error| error.code)))
    }

    fn record_success(
        &self,
        request: &ProviderRequest,
        attempt: u32,
        latency: time::Duration,
        status: u16,
    ) {
        info!(
            connector = %self.connector,
            method = %request.method,
            path = %request.path,
            attempt,
            status,
            latency_ms = latency.as_millis() as u64,
            "provider request succeeded"
        );

        self.telemetry.counter(
            "provider_request_total",
            1,
            CounterLabels::new(&self.connector, "succeeded").upstream_status(Some(status)),
        );
        self.telemetry.histogram(
            "provider_request_latency_ms",
            latency,
            HistogramLabels::new(&self.connector, None, "succeeded"),
        );
    }

    fn record_failure(
        &self,
        request: &ProviderRequest,
        attempt: u32,
        latency: time::Duration,
        error: &ProviderError,
        will_retry: bool,
    ) {
        let classification = error.classification();
        warn!(
            connector = %self.connector,
            method = %request.method,
            path = %request.path,
            attempt,
            status = error.status(),
            latency_ms = latency.as_millis() as u64,
            error_kind = classification.kind.as_str(),
            retryable = classification.retryable,
            retry_after_ms = classification.retry_after.map(|d| d.as_millis() as u64),
            provider_code = error.provider_code(),
            error_message = error.message(),
            will_retry,
            "provider request failed"
        );

        self.telemetry.counter(
            "provider_request_total",
            1,
            CounterLabels::new(&self.connector, "failed")
                .error_code(Some(classification.kind.as_str()))
                .upstream_status(error.status()),
        );
        self.telemetry.histogram(
            "provider_request_latency_ms",
            latency,
            HistogramLabels::new(&self.connector, None, "failed"),
        );
    }
}

fn transport_error(error: &reqwest::Error) -> ProviderError {
    let kind = if error.is_timeout() {
        ErrorKind::Timeout
    } else if error.is_builder() {
        ErrorKind::ClientError
    } else {
        ErrorKind::NetworkError
    };

    ProviderError::new(
        ErrorClassification::new(kind),
        mask_digits(&error.to_string()).into_owned(),
    )
}

fn error_message(status: u16, error: Option<&ProviderErrorBody>, body: &ResponseBody) -> String {
    let raw = match (error.and_then(|error| error.message.as_deref()), body) {
        (Some(message), _) => message.to_owned(),
        (None, ResponseBody::Text(text)) if !text.trim().is_empty() => {
            text.chars().take(MAX_ERROR_TEXT_CHARS).collect()
        }
        _ => format!("provider responded with status {status}"),
    };

    mask_digits(&raw).into_owned()
}
