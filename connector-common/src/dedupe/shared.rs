use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::RedisError;
use tracing::warn;

use super::{DedupeError, DedupeStore, ErrorCallback, FailMode};

/// Value stored under a marked key. Only existence matters.
const SENTINEL: &str = "1";

impl From<RedisError> for DedupeError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            DedupeError::Timeout
        } else {
            DedupeError::Unavailable(err.to_string())
        }
    }
}

/// The two primitives a shared store must offer.
#[async_trait]
pub trait RedisClient: Send + Sync {
    /// Set `k` to `v` only if absent, expiring after `millis`. Returns `true` if the key was set.
    async fn set_nx_px(&self, k: String, v: String, millis: u64) -> Result<bool, DedupeError>;
    async fn exists(&self, k: String) -> Result<bool, DedupeError>;
}

pub struct RedisConnection {
    connection: MultiplexedConnection,
}

impl RedisConnection {
    pub async fn new(addr: &str) -> Result<RedisConnection, DedupeError> {
        let client = redis::Client::open(addr)?;
        let connection = client.get_multiplexed_async_connection().await?;

        Ok(RedisConnection { connection })
    }
}

#[async_trait]
impl RedisClient for RedisConnection {
    async fn set_nx_px(&self, k: String, v: String, millis: u64) -> Result<bool, DedupeError> {
        let mut conn = self.connection.clone();

        // One SET with both NX and PX keeps the check and the mark atomic.
        let result: Result<Option<String>, RedisError> = redis::cmd("SET")
            .arg(&k)
            .arg(&v)
            .arg("PX")
            .arg(millis)
            .arg("NX")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, k: String) -> Result<bool, DedupeError> {
        let mut conn = self.connection.clone();
        let exists: bool = redis::cmd("EXISTS").arg(&k).query_async(&mut conn).await?;

        Ok(exists)
    }
}

/// Dedupe store shared across instances through a redis-compatible backend.
///
/// Every backing failure is reported through the error callback. `check_and_mark`
/// then answers according to the `FailMode`, `try_check_and_mark` returns it.
pub struct RedisDedupeStore {
    client: Arc<dyn RedisClient>,
    prefix: String,
    fail_mode: FailMode,
    on_error: Option<ErrorCallback>,
}

impl RedisDedupeStore {
    pub fn new(client: Arc<dyn RedisClient>, prefix: &str, fail_mode: FailMode) -> Self {
        Self {
            client,
            prefix: prefix.to_owned(),
            fail_mode,
            on_error: None,
        }
    }

    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    fn storage_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{}:{}", self.prefix, key)
        }
    }

    fn report_failure(&self, error: &DedupeError, key: &str) {
        warn!(
            key,
            fail_mode = self.fail_mode.as_str(),
            error = %error,
            "dedupe store check failed"
        );
        metrics::counter!("dedupe_store_errors_total", "fail_mode" => self.fail_mode.as_str())
            .increment(1);

        if let Some(callback) = &self.on_error {
            callback(error, key);
        }
    }

    async fn mark(&self, key: &str, ttl: Duration) -> Result<bool, DedupeError> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Err(DedupeError::InvalidTtl);
        }

        let was_set = self
            .client
            .set_nx_px(self.storage_key(key), SENTINEL.to_owned(), millis)
            .await?;

        Ok(!was_set)
    }

    /// Whether `key` is currently marked, without marking it.
    pub async fn is_marked(&self, key: &str) -> Result<bool, DedupeError> {
        self.client.exists(self.storage_key(key)).await
    }
}

#[async_trait]
impl DedupeStore for RedisDedupeStore {
    async fn check_and_mark(&self, key: &str, ttl: Duration) -> Result<bool, DedupeError> {
        match self.mark(key, ttl).await {
            Ok(duplicate) => Ok(duplicate),
            Err(error) => {
                self.report_failure(&error, key);
                Ok(self.fail_mode.treat_as_duplicate())
            }
        }
    }

    /// Failures still reach the error callback before being returned.
    async fn try_check_and_mark(&self, key: &str, ttl: Duration) -> Result<bool, DedupeError> {
        self.mark(key, ttl).await.inspect_err(|error| {
            self.report_failure(error, key);
        })
    }

    fn fail_mode(&self) -> FailMode {
        self.fail_mode
    }
}
