use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{DedupeError, RedisClient};

/// In-process stand-in for a redis backend. Clones share the same keyspace,
/// so several stores built from clones behave like instances sharing one server.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<MockRedisState>>,
}

#[derive(Default)]
struct MockRedisState {
    keys: HashMap<String, (String, Instant)>,
    error: Option<DedupeError>,
    calls: Vec<MockRedisCall>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRedisCall {
    SetNxPx { key: String, millis: u64 },
    Exists { key: String },
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent command fail with `error`.
    pub fn failing(self, error: DedupeError) -> Self {
        self.lock_state().error = Some(error);
        self
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        self.lock_state().calls.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, MockRedisState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl RedisClient for MockRedisClient {
    async fn set_nx_px(&self, k: String, v: String, millis: u64) -> Result<bool, DedupeError> {
        let mut state = self.lock_state();
        state.calls.push(MockRedisCall::SetNxPx {
            key: k.clone(),
            millis,
        });

        if let Some(error) = &state.error {
            return Err(error.clone());
        }

        let now = Instant::now();
        match state.keys.get(&k) {
            Some((_, expires_at)) if *expires_at > now => Ok(false),
            _ => {
                state
                    .keys
                    .insert(k, (v, now + Duration::from_millis(millis)));
                Ok(true)
            }
        }
    }

    async fn exists(&self, k: String) -> Result<bool, DedupeError> {
        let mut state = self.lock_state();
        state.calls.push(MockRedisCall::Exists { key: k.clone() });

        if let Some(error) = &state.error {
            return Err(error.clone());
        }

        let now = Instant::now();
        Ok(matches!(state.keys.get(&k), Some((_, expires_at)) if *expires_at > now))
    }
}
