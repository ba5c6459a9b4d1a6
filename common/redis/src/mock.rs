use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::{Client, CustomRedisError};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct MockState {
    entries: HashMap<String, Entry>,
    set_nx_ex_ret: HashMap<String, Result<bool, CustomRedisError>>,
    setex_ret: HashMap<String, Result<(), CustomRedisError>>,
    del_ret: HashMap<String, Result<(), CustomRedisError>>,
    // When set, every command fails with this error, as if the server were unreachable
    unavailable: Option<CustomRedisError>,
    calls: Vec<MockRedisCall>,
}

/// An in-process stand-in for redis.
///
/// Unlike a canned-response mock, it keeps real key state with TTLs so that
/// `set_nx_ex` behaves atomically across concurrent callers. Individual keys
/// can be overridden to return a fixed result, and the whole client can be
/// switched to "unreachable".
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockRedisValue {
    None,
    StringWithTTL(String, u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub value: MockRedisValue,
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_nx_ex_ret(&mut self, key: &str, ret: Result<bool, CustomRedisError>) -> Self {
        self.lock().set_nx_ex_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn setex_ret(&mut self, key: &str, ret: Result<(), CustomRedisError>) -> Self {
        self.lock().setex_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn del_ret(&mut self, key: &str, ret: Result<(), CustomRedisError>) -> Self {
        self.lock().del_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    /// Make every subsequent command fail with `err`, or restore normal operation with `None`.
    pub fn set_unavailable(&self, err: Option<CustomRedisError>) {
        self.lock().unavailable = err;
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        self.lock().calls.clone()
    }

    /// Current live value of a key, bypassing call recording.
    pub fn value_of(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.lock()
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    /// Remaining TTL of a live key, bypassing call recording.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Drop a key without going through `del`, e.g. to simulate an eviction.
    pub fn evict(&self, key: &str) {
        self.lock().entries.remove(key);
    }
}

fn record(state: &mut MockState, op: &str, key: &str, value: MockRedisValue) {
    state.calls.push(MockRedisCall {
        op: op.to_string(),
        key: key.to_string(),
        value,
    });
}

#[async_trait]
impl Client for MockRedisClient {
    async fn setex(&self, key: String, value: String, seconds: u64) -> Result<(), CustomRedisError> {
        let mut state = self.lock();
        record(
            &mut state,
            "setex",
            &key,
            MockRedisValue::StringWithTTL(value.clone(), seconds),
        );
        if let Some(err) = &state.unavailable {
            return Err(err.clone());
        }
        if let Some(ret) = state.setex_ret.get(&key) {
            return ret.clone();
        }

        state.entries.insert(
            key,
            Entry {
                value,
                expires_at: Some(Instant::now() + Duration::from_secs(seconds)),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: String,
        value: String,
        seconds: u64,
    ) -> Result<bool, CustomRedisError> {
        let mut state = self.lock();
        record(
            &mut state,
            "set_nx_ex",
            &key,
            MockRedisValue::StringWithTTL(value.clone(), seconds),
        );
        if let Some(err) = &state.unavailable {
            return Err(err.clone());
        }
        if let Some(ret) = state.set_nx_ex_ret.get(&key) {
            return ret.clone();
        }

        let now = Instant::now();
        if state.entries.get(&key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        state.entries.insert(
            key,
            Entry {
                value,
                expires_at: Some(now + Duration::from_secs(seconds)),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: String) -> Result<(), CustomRedisError> {
        let mut state = self.lock();
        record(&mut state, "del", &key, MockRedisValue::None);
        if let Some(err) = &state.unavailable {
            return Err(err.clone());
        }
        if let Some(ret) = state.del_ret.get(&key) {
            return ret.clone();
        }

        state.entries.remove(&key);
        Ok(())
    }
}
