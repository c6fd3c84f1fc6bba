//! Lookup cache: account/container existence, ACLs, and advisory locks.
//!
//! The cache is trait-fronted so the in-process store and an external
//! memcache-style deployment interchange. The proxy never relies on
//! cross-process durability; every entry is reconstructible from a backend
//! HEAD.

use crate::clock::Clock;
use crate::error::CacheError;
use crate::sleeper::Sleeper;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Key-value store with TTLs over opaque JSON values.
#[async_trait]
pub trait CacheBackend: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>);
    async fn delete(&self, key: &str);
    /// Atomic counter; creates the key at `delta` when absent.
    async fn incr(&self, key: &str, delta: i64) -> i64;
    /// Set only if absent. Returns whether the value was stored.
    async fn add(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_micros: Option<u64>,
}

/// In-process cache backend with clock-driven expiry.
#[derive(Debug)]
pub struct MemoryCache {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, entries: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live<'a>(
        entries: &'a HashMap<String, Entry>,
        key: &str,
        now: u64,
    ) -> Option<&'a Entry> {
        entries.get(key).filter(|e| e.expires_micros.map_or(true, |at| now < at))
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.map(|ttl| self.clock.now_micros() + ttl.as_micros() as u64)
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now_micros();
        Self::live(&self.lock(), key, now).map(|e| e.value.clone())
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let expires_micros = self.expiry(ttl);
        self.lock().insert(key.to_string(), Entry { value, expires_micros });
    }

    async fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    async fn incr(&self, key: &str, delta: i64) -> i64 {
        let now = self.clock.now_micros();
        let mut entries = self.lock();
        let current = Self::live(&entries, key, now)
            .and_then(|e| e.value.as_i64())
            .unwrap_or(0);
        let next = current + delta;
        let expires_micros = entries.get(key).and_then(|e| e.expires_micros);
        entries.insert(key.to_string(), Entry { value: Value::from(next), expires_micros });
        next
    }

    async fn add(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        let now = self.clock.now_micros();
        let expires_micros = self.expiry(ttl);
        let mut entries = self.lock();
        if Self::live(&entries, key, now).is_some() {
            return false;
        }
        entries.insert(key.to_string(), Entry { value, expires_micros });
        true
    }
}

/// Cached account lookup: existence plus the account counters the container
/// controller enforces limits against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub status: u16,
    #[serde(default)]
    pub container_count: u64,
    #[serde(default)]
    pub bytes_used: u64,
}

impl AccountInfo {
    pub fn exists(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Cached container lookup: existence, ACLs, and versioning attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub status: u16,
    #[serde(default)]
    pub read_acl: Option<String>,
    #[serde(default)]
    pub write_acl: Option<String>,
    #[serde(default)]
    pub versions_location: Option<String>,
    #[serde(default)]
    pub sync_key: Option<String>,
}

impl ContainerInfo {
    pub fn exists(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Advisory lock guard. The lock self-heals via TTL if never released.
#[must_use = "soft locks should be released when the critical section ends"]
pub struct SoftLock {
    backend: Arc<dyn CacheBackend>,
    key: String,
}

impl SoftLock {
    pub async fn release(self) {
        self.backend.delete(&self.key).await;
    }
}

/// Typed facade over the cache backend used by the controllers.
#[derive(Debug, Clone)]
pub struct LookupCache {
    backend: Arc<dyn CacheBackend>,
    sleeper: Arc<dyn Sleeper>,
}

impl LookupCache {
    pub fn new(backend: Arc<dyn CacheBackend>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { backend, sleeper }
    }

    pub fn account_key(account: &str) -> String {
        format!("account/{account}")
    }

    pub fn container_key(account: &str, container: &str) -> String {
        format!("container/{account}/{container}")
    }

    pub async fn account(&self, account: &str) -> Option<AccountInfo> {
        let value = self.backend.get(&Self::account_key(account)).await?;
        serde_json::from_value(value).ok()
    }

    pub async fn set_account(&self, account: &str, info: &AccountInfo, ttl: Duration) {
        if let Ok(value) = serde_json::to_value(info) {
            self.backend.set(&Self::account_key(account), value, Some(ttl)).await;
        }
    }

    pub async fn purge_account(&self, account: &str) {
        self.backend.delete(&Self::account_key(account)).await;
    }

    pub async fn container(&self, account: &str, container: &str) -> Option<ContainerInfo> {
        let value = self.backend.get(&Self::container_key(account, container)).await?;
        serde_json::from_value(value).ok()
    }

    pub async fn set_container(
        &self,
        account: &str,
        container: &str,
        info: &ContainerInfo,
        ttl: Duration,
    ) {
        if let Ok(value) = serde_json::to_value(info) {
            self.backend.set(&Self::container_key(account, container), value, Some(ttl)).await;
        }
    }

    pub async fn purge_container(&self, account: &str, container: &str) {
        self.backend.delete(&Self::container_key(account, container)).await;
    }

    /// Acquire an advisory lock, retrying with jittered sleeps. On sustained
    /// contention returns [`CacheError::LockContended`]; callers fail open.
    pub async fn soft_lock(
        &self,
        key: &str,
        timeout: Duration,
        retries: u32,
    ) -> Result<SoftLock, CacheError> {
        let lock_key = format!("lock/{key}");
        for attempt in 0..=retries {
            let stored =
                self.backend.add(&lock_key, Value::from(attempt), Some(timeout)).await;
            if stored {
                return Ok(SoftLock { backend: self.backend.clone(), key: lock_key });
            }
            let jitter_ms: u64 = rand::rng().random_range(0..5);
            let backoff = Duration::from_millis(10 * u64::from(attempt + 1) + jitter_ms);
            self.sleeper.sleep(backoff).await;
        }
        Err(CacheError::LockContended { key: key.to_string(), attempts: retries + 1 })
    }
}
