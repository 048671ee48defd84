//! # Stage: Cache Tiers
//!
//! ## Responsibility
//! Verdict storage shared by the exact and semantic caches, with an
//! in-memory backend and an optional Redis backend (`caching` feature).
//!
//! ## Guarantees
//! - A backend failure or an undecodable entry is a miss, never an error:
//!   callers fall through to the next tier
//! - Expired entries are never returned
//! - The memory store never grows past `max_entries`; the entry closest to
//!   expiry is evicted first, in logarithmic time via a deadline index
//!
//! ## NOT Responsible For
//! - Key derivation (that belongs to `exact` and `semantic`)
//! - Deciding what is cached (that belongs to the orchestrator)

pub mod exact;
pub mod semantic;

pub use exact::ExactCache;
pub use semantic::{Embedder, HashingEmbedder, SemanticCache};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::CacheConfig;

struct Slot {
    payload: String,
    deadline: Instant,
    seq: u64,
}

/// Position of a slot in the deadline index. `seq` breaks ties between
/// entries written in the same instant.
type DeadlineKey = (Instant, u64);

/// Shared key-value store for cached verdicts.
///
/// Cloning is cheap and shares the underlying store.
#[derive(Clone)]
pub struct CacheLayer {
    store: Store,
}

#[derive(Clone)]
enum Store {
    Memory(Arc<MemoryStore>),
    #[cfg(feature = "caching")]
    Redis(redis::aio::MultiplexedConnection),
}

struct MemoryStore {
    inner: Mutex<MemoryInner>,
    max_entries: usize,
}

#[derive(Default)]
struct MemoryInner {
    slots: HashMap<String, Slot>,
    by_deadline: BTreeMap<DeadlineKey, String>,
    next_seq: u64,
}

impl CacheLayer {
    /// In-memory store holding at most `max_entries` entries (0 = unbounded).
    pub fn new_memory(max_entries: usize) -> Self {
        Self {
            store: Store::Memory(Arc::new(MemoryStore {
                inner: Mutex::new(MemoryInner::default()),
                max_entries,
            })),
        }
    }

    /// Redis-backed store sharing one multiplexed connection.
    ///
    /// # Errors
    ///
    /// Fails if the URL is invalid or the server does not answer `PING`.
    #[cfg(feature = "caching")]
    pub async fn new_redis(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        tracing::debug!("redis verdict cache connected");
        Ok(Self {
            store: Store::Redis(conn),
        })
    }

    /// Build the store described by the `[cache]` section.
    ///
    /// A configured `redis_url` that cannot be reached, or one set without
    /// the `caching` feature, falls back to memory with a warning.
    pub async fn from_config(config: &CacheConfig) -> Self {
        match config.redis_url.as_deref() {
            #[cfg(feature = "caching")]
            Some(url) => match Self::new_redis(url).await {
                Ok(layer) => layer,
                Err(e) => {
                    warn!(error = %e, "redis unreachable, caching verdicts in memory");
                    Self::new_memory(config.max_entries)
                }
            },
            #[cfg(not(feature = "caching"))]
            Some(_) => {
                warn!("cache.redis_url needs the `caching` feature, caching verdicts in memory");
                Self::new_memory(config.max_entries)
            }
            None => Self::new_memory(config.max_entries),
        }
    }

    /// Raw payload under `key`, if present and live.
    pub async fn get(&self, key: &str) -> Option<String> {
        match &self.store {
            Store::Memory(mem) => mem.get(key),
            #[cfg(feature = "caching")]
            Store::Redis(conn) => {
                let mut conn = conn.clone();
                match redis::cmd("GET")
                    .arg(key)
                    .query_async::<_, Option<String>>(&mut conn)
                    .await
                {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "redis GET failed, treating as miss");
                        None
                    }
                }
            }
        }
    }

    /// Store `payload` under `key` for `ttl_secs` seconds.
    pub async fn setex(&self, key: impl Into<String>, payload: impl Into<String>, ttl_secs: u64) {
        let key = key.into();
        let payload = payload.into();
        match &self.store {
            Store::Memory(mem) => mem.put(key, payload, Duration::from_secs(ttl_secs)),
            #[cfg(feature = "caching")]
            Store::Redis(conn) => {
                if ttl_secs == 0 {
                    return;
                }
                let mut conn = conn.clone();
                if let Err(e) = redis::cmd("SETEX")
                    .arg(&key)
                    .arg(ttl_secs)
                    .arg(payload)
                    .query_async::<_, ()>(&mut conn)
                    .await
                {
                    warn!(error = %e, "redis SETEX failed, verdict not cached");
                }
            }
        }
    }

    /// Remove `key`.
    pub async fn delete(&self, key: &str) {
        match &self.store {
            Store::Memory(mem) => mem.remove(key),
            #[cfg(feature = "caching")]
            Store::Redis(conn) => {
                let mut conn = conn.clone();
                if let Err(e) = redis::cmd("DEL")
                    .arg(key)
                    .query_async::<_, ()>(&mut conn)
                    .await
                {
                    warn!(error = %e, "redis DEL failed");
                }
            }
        }
    }

    /// Decode the JSON payload under `key`. Undecodable payloads are
    /// logged and treated as misses.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let payload = self.get(key).await?;
        match serde_json::from_str(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "discarding undecodable cache entry");
                None
            }
        }
    }

    /// Encode `value` as JSON and store it under `key`.
    pub async fn put_json<T: Serialize>(&self, key: impl Into<String>, value: &T, ttl_secs: u64) {
        match serde_json::to_string(value) {
            Ok(payload) => self.setex(key, payload, ttl_secs).await,
            Err(e) => warn!(error = %e, "failed to encode verdict for cache"),
        }
    }

    /// Entry count (memory only) and backend name.
    pub fn stats(&self) -> CacheStats {
        match &self.store {
            Store::Memory(mem) => CacheStats {
                entries: mem.len(),
                backend: "memory",
            },
            #[cfg(feature = "caching")]
            Store::Redis(_) => CacheStats {
                entries: 0,
                backend: "redis",
            },
        }
    }
}

impl MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get(key)?;
        if slot.deadline > Instant::now() {
            return Some(slot.payload.clone());
        }
        inner.unlink(key);
        None
    }

    fn put(&self, key: String, payload: String, ttl: Duration) {
        let mut inner = self.inner.lock();
        inner.unlink(&key);
        if ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        inner.sweep_expired(now);
        if self.max_entries > 0 {
            while inner.slots.len() >= self.max_entries {
                if !inner.evict_soonest() {
                    break;
                }
            }
        }
        inner.link(key, payload, now + ttl);
    }

    fn remove(&self, key: &str) {
        self.inner.lock().unlink(key);
    }

    fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

impl MemoryInner {
    fn link(&mut self, key: String, payload: String, deadline: Instant) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.by_deadline.insert((deadline, seq), key.clone());
        self.slots.insert(
            key,
            Slot {
                payload,
                deadline,
                seq,
            },
        );
    }

    fn unlink(&mut self, key: &str) {
        if let Some(slot) = self.slots.remove(key) {
            self.by_deadline.remove(&(slot.deadline, slot.seq));
        }
    }

    /// Drop the entry closest to expiry. `false` when the store is empty.
    fn evict_soonest(&mut self) -> bool {
        match self.by_deadline.pop_first() {
            Some((_, key)) => {
                self.slots.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Drop expired entries from the front of the index. Each removal is
    /// paid for by the write that inserted it.
    fn sweep_expired(&mut self, now: Instant) {
        while let Some(entry) = self.by_deadline.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            self.slots.remove(&key);
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently held (always 0 for Redis).
    pub entries: usize,
    /// `"memory"` or `"redis"`.
    pub backend: &'static str,
}
