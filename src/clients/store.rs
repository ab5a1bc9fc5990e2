use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;

/// Key-value store with expiring keys shared by intake and workers.
///
/// `set_if_absent` and `compare_and_set` are the only multi-step operations
/// and must be atomic in every implementation.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Returns `false` if the key already existed.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Replaces the value only if it currently equals `expected`.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// The TTL is applied when the counter is created.
    async fn increment_counter(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// In-process store for tests and single-node runs.
///
/// The availability switch simulates an unreachable store: every call fails
/// with `StoreError::Unavailable` while it is off.
#[derive(Debug, Clone, Default)]
pub struct MemoryStatusStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values().filter(|e| e.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries
            .lock()
            .insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock();

        let value = entries
            .get(key)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value.clone());

        if value.is_none() {
            entries.remove(key);
        }

        Ok(value)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock();

        if entries.get(key).is_some_and(Entry::is_live) {
            return Ok(false);
        }

        entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock();

        let matches = entries
            .get(key)
            .is_some_and(|entry| entry.is_live() && entry.value == expected);

        if matches {
            entries.insert(key.to_string(), Entry::new(value, ttl));
        }

        Ok(matches)
    }

    async fn increment_counter(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock();

        let live = entries.get(key).filter(|entry| entry.is_live()).cloned();

        let (next, expires_at) = match live {
            Some(entry) => {
                let current = entry.value.parse::<i64>().map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                (current + 1, entry.expires_at)
            }
            None => (1, Instant::now() + ttl),
        };

        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );

        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}
