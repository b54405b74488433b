use std::str::FromStr;
use std::sync::Arc;
use std::time;

use envconfig::Envconfig;

use crate::dedupe::{
    DedupeError, DedupeStore, FailMode, MemoryDedupeStore, RedisConnection, RedisDedupeStore,
};
use crate::retry::BackoffConfig;
use crate::telemetry::{MetricsSink, Telemetry};

#[derive(Envconfig, Clone)]
pub struct DedupeConfig {
    #[envconfig(from = "DEDUPE_TTL_MS", default = "86400000")]
    pub ttl: EnvMsDuration,

    #[envconfig(from = "DEDUPE_FAIL_MODE", default = "open")]
    pub fail_mode: FailMode,

    #[envconfig(from = "DEDUPE_KEY_PREFIX", default = "dedupe")]
    pub key_prefix: String,

    #[envconfig(from = "REDIS_URL")]
    pub redis_url: Option<NonEmptyString>,
}

impl DedupeConfig {
    /// Build the shared store when a redis url is configured, the local one otherwise.
    pub async fn build_store(&self) -> Result<Arc<dyn DedupeStore>, DedupeError> {
        match &self.redis_url {
            Some(url) => {
                let client = RedisConnection::new(url.as_str()).await?;
                Ok(Arc::new(RedisDedupeStore::new(
                    Arc::new(client),
                    &self.key_prefix,
                    self.fail_mode,
                )))
            }
            None => Ok(Arc::new(MemoryDedupeStore::new())),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct BackoffEnvConfig {
    #[envconfig(from = "BACKOFF_INITIAL_DELAY_MS", default = "1000")]
    pub initial_delay: EnvMsDuration,

    #[envconfig(from = "BACKOFF_MAX_DELAY_MS", default = "30000")]
    pub max_delay: EnvMsDuration,

    #[envconfig(from = "BACKOFF_MULTIPLIER", default = "2.0")]
    pub multiplier: f64,

    #[envconfig(from = "BACKOFF_MAX_RETRIES", default = "3")]
    pub max_retries: u32,

    #[envconfig(from = "BACKOFF_JITTER", default = "true")]
    pub jitter: bool,
}

impl BackoffEnvConfig {
    pub fn provide(&self) -> BackoffConfig {
        BackoffConfig::build(self.multiplier, self.initial_delay.0)
            .maximum_delay(self.max_delay.0)
            .max_retries(self.max_retries)
            .jitter(self.jitter)
            .provide()
    }
}

#[derive(Envconfig, Clone)]
pub struct TelemetryConfig {
    #[envconfig(from = "CONNECTOR_DEFAULT", default = "unknown")]
    pub default_connector: String,

    #[envconfig(from = "CONNECTOR_MANIFEST_ID")]
    pub manifest_id: Option<NonEmptyString>,
}

impl TelemetryConfig {
    pub fn telemetry(&self, sink: Arc<dyn MetricsSink>) -> Telemetry {
        Telemetry::new(sink, &self.default_connector)
            .with_manifest_id(self.manifest_id.as_ref().map(NonEmptyString::as_str))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
