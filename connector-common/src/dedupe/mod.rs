//! # Dedupe
//!
//! Atomic "seen before?" checks bounded by a TTL. The dedupe store is the only
//! shared mutable resource of the connector runtime: every mutation is a single
//! set-if-absent-with-expiry operation per key, so concurrent callers across
//! instances can never both observe "not duplicate" for the same key within one
//! TTL window.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod mock;
mod shared;

pub use memory::MemoryDedupeStore;
pub use mock::{MockRedisCall, MockRedisClient};
pub use shared::{RedisClient, RedisConnection, RedisDedupeStore};

/// Enumeration of failures a dedupe store backing can run into.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DedupeError {
    #[error("dedupe ttl must be greater than zero")]
    InvalidTtl,
    #[error("dedupe store timed out")]
    Timeout,
    #[error("dedupe store unavailable: {0}")]
    Unavailable(String),
}

/// Policy applied when the backing store fails.
///
/// `Open` treats the key as a duplicate: side effects are blocked and events may
/// be dropped. `Closed` treats the key as new: nothing is dropped but side
/// effects may repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    #[default]
    Open,
    Closed,
}

impl FailMode {
    /// The "is duplicate" answer to give when the store could not be consulted.
    pub fn treat_as_duplicate(&self) -> bool {
        match self {
            FailMode::Open => true,
            FailMode::Closed => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailMode::Open => "open",
            FailMode::Closed => "closed",
        }
    }
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid fail mode, expected open or closed")]
pub struct ParseFailModeError(pub String);

impl FromStr for FailMode {
    type Err = ParseFailModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "open" => Ok(FailMode::Open),
            "closed" => Ok(FailMode::Closed),
            invalid => Err(ParseFailModeError(invalid.to_owned())),
        }
    }
}

/// Called with the error and the (unprefixed) key whenever a backing fails.
pub type ErrorCallback = Arc<dyn Fn(&DedupeError, &str) + Send + Sync>;

#[async_trait]
pub trait DedupeStore: Send + Sync {
    /// Returns `true` if `key` was already marked within `ttl` of a prior call.
    /// Otherwise marks it now and returns `false`.
    async fn check_and_mark(&self, key: &str, ttl: Duration) -> Result<bool, DedupeError>;

    /// Like `check_and_mark`, but backing failures are returned to the caller
    /// instead of being resolved through the fail mode.
    async fn try_check_and_mark(&self, key: &str, ttl: Duration) -> Result<bool, DedupeError> {
        self.check_and_mark(key, ttl).await
    }

    /// Policy callers should apply to errors from `try_check_and_mark`.
    fn fail_mode(&self) -> FailMode {
        FailMode::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_mode_defaults_to_open() {
        assert_eq!(FailMode::default(), FailMode::Open);
        assert!(FailMode::default().treat_as_duplicate());
        assert!(!FailMode::Closed.treat_as_duplicate());
    }

    #[test]
    fn test_parse_fail_mode() {
        assert_eq!("open".parse::<FailMode>(), Ok(FailMode::Open));
        assert_eq!("CLOSED".parse::<FailMode>(), Ok(FailMode::Closed));
        assert_eq!(
            "sometimes".parse::<FailMode>(),
            Err(ParseFailModeError("sometimes".to_owned()))
        );
        assert_eq!(
            "sometimes".parse::<FailMode>().unwrap_err().to_string(),
            "sometimes is not a valid fail mode, expected open or closed"
        );
    }
}
