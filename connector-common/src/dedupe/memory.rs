use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{DedupeError, DedupeStore};

const DEFAULT_PURGE_EVERY: usize = 1024;

/// Process-local dedupe store. Entries past their expiry are treated as absent
/// and overwritten by the next mark. Every `purge_every` new marks, expired
/// entries are dropped so unique keys do not accumulate.
pub struct MemoryDedupeStore {
    state: Mutex<MemoryState>,
    purge_every: usize,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, Instant>,
    marks_since_purge: usize,
}

impl MemoryState {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        self.marks_since_purge = 0;
        before - self.entries.len()
    }
}

impl Default for MemoryDedupeStore {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            purge_every: DEFAULT_PURGE_EVERY,
        }
    }
}

impl MemoryDedupeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many new marks may happen between two sweeps of expired entries.
    pub fn purge_every(mut self, marks: usize) -> Self {
        self.purge_every = marks.max(1);
        self
    }

    // A poisoned lock only means another caller panicked mid-insert; the map is still usable.
    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.lock_state().purge_expired(Instant::now())
    }

    /// Number of entries held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_state().entries.is_empty()
    }
}

#[async_trait]
impl DedupeStore for MemoryDedupeStore {
    async fn check_and_mark(&self, key: &str, ttl: Duration) -> Result<bool, DedupeError> {
        if ttl.is_zero() {
            return Err(DedupeError::InvalidTtl);
        }

        let now = Instant::now();
        let mut state = self.lock_state();

        if matches!(state.entries.get(key), Some(expires_at) if *expires_at > now) {
            return Ok(true);
        }

        state.marks_since_purge += 1;
        if state.marks_since_purge >= self.purge_every {
            state.purge_expired(now);
        }
        state.entries.insert(key.to_owned(), now + ttl);
        Ok(false)
    }
}
