//! In-process store
//!
//! Same contract as the Redis adapter, backed by `DashMap`. Expiry is lazy:
//! an expired entry is dropped the next time it is touched. Time comes from
//! `tokio::time`, so tests can pause and advance the clock.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{SessionStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// Expiry deadline, or none when the TTL runs past the clock's range
fn deadline(now: Instant, ttl_secs: u64) -> Option<Instant> {
    now.checked_add(Duration::from_secs(ttl_secs))
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// `DashMap`-backed store with per-key expiry
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// `StoreError::Unavailable` and `ping` reports false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys, in no particular order
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Remaining lifetime of a key, if it is live and has an expiry
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.live(key, now)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        }
    }

    fn live(&self, key: &str, now: Instant) -> Option<Entry> {
        let entry = self.entries.get(key)?.clone();
        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool> {
        self.check_available()?;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: deadline(Instant::now(), ttl_secs),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        match self.live(key, Instant::now()) {
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text)),
            Some(_) => Err(StoreError::Protocol(format!("{key} holds a set"))),
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.live(key, Instant::now()).is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn add_to_set(&self, set_key: &str, members: &[String]) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut entry = self.entries.entry(set_key.to_string()).or_insert(Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });

        if entry.is_expired(now) {
            *entry = Entry {
                value: Value::Set(BTreeSet::new()),
                expires_at: None,
            };
        }

        match &mut entry.value {
            Value::Set(set) => {
                set.extend(members.iter().cloned());
                Ok(true)
            }
            Value::Text(_) => Err(StoreError::Protocol(format!("{set_key} holds a string"))),
        }
    }

    async fn members_of(&self, set_key: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        match self.live(set_key, Instant::now()) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.into_iter().collect()),
            Some(_) => Err(StoreError::Protocol(format!("{set_key} holds a string"))),
            None => Ok(Vec::new()),
        }
    }

    async fn set_ttl(&self, key: &str, ttl_secs: u64) -> StoreResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = deadline(now, ttl_secs);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
