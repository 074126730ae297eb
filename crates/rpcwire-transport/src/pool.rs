//! Keyed store of reusable transport instances.
//!
//! A [`ConnectionPool`] holds at most `max_connections` transports. When a
//! new key arrives at capacity, one entry is evicted according to the
//! [`EvictionPolicy`]. Entries are health-checked on the way out and dropped
//! if unhealthy.
//!
//! The map is guarded by a mutex. Health checks are async, so they run with
//! the lock released; an entry replaced while its check was in flight is left
//! alone.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use rpcwire_traits::{Clock, SystemClock, Transport, TransportError, TransportResult};

/// Which entry to discard when a full pool receives a new key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Oldest `last_accessed`
    #[default]
    Lru,
    /// Oldest `created_at`
    Fifo,
    /// Newest `created_at`
    Lifo,
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lru => write!(f, "lru"),
            Self::Fifo => write!(f, "fifo"),
            Self::Lifo => write!(f, "lifo"),
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Capacity; must be greater than zero
    pub max_connections: usize,
    /// Eviction rule applied at capacity
    pub eviction_policy: EvictionPolicy,
    /// Whether the manager inserts freshly created transports
    pub insert_on_create: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            eviction_policy: EvictionPolicy::Lru,
            insert_on_create: true,
        }
    }
}

impl PoolConfig {
    /// Create a pool configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects a zero capacity.
    pub fn validate(&self) -> TransportResult<()> {
        if self.max_connections == 0 {
            return Err(TransportError::ConfigurationError(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters exposed by [`ConnectionPool::get_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Entries inserted under a new key
    pub connections_created: u64,
    /// Successful `get_connection` calls
    pub connections_acquired: u64,
    /// Successful `release_connection` calls
    pub connections_released: u64,
    /// Entries evicted to make room
    pub connections_evicted: u64,
    /// Entries dropped after failing a health check
    pub health_check_failures: u64,
    /// Current number of entries
    pub connection_count: usize,
    /// Configured capacity
    pub max_connections: usize,
}

/// Metadata for one pooled entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PooledConnectionInfo {
    /// Pool key
    pub key: String,
    /// Time since the entry was inserted
    pub age: Duration,
    /// Time since the entry was last handed out
    pub idle: Duration,
    /// Number of times the entry was handed out
    pub access_count: u64,
    /// Whether the transport reported itself connected
    pub connected: bool,
}

/// Snapshot returned by [`ConnectionPool::get_pool_info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    /// Eviction rule in force
    pub eviction_policy: EvictionPolicy,
    /// Configured capacity
    pub max_connections: usize,
    /// Entries sorted by key
    pub connections: Vec<PooledConnectionInfo>,
}

/// Result of [`ConnectionPool::perform_health_check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHealth {
    /// Entries checked
    pub total: usize,
    /// Entries that passed
    pub healthy: usize,
    /// Entries that failed and were removed
    pub unhealthy: usize,
}

impl std::ops::AddAssign for PoolHealth {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.healthy += other.healthy;
        self.unhealthy += other.unhealthy;
    }
}

struct PoolEntry<T: ?Sized> {
    transport: Arc<T>,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    // tie-breakers for entries sharing an instant
    created_seq: u64,
    access_seq: u64,
}

#[derive(Default)]
struct PoolCounters {
    created: u64,
    acquired: u64,
    released: u64,
    evicted: u64,
    health_check_failures: u64,
}

struct PoolInner<T: ?Sized> {
    entries: HashMap<String, PoolEntry<T>>,
    counters: PoolCounters,
    seq: u64,
}

impl<T: ?Sized> PoolInner<T> {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn victim(&self, policy: EvictionPolicy) -> Option<String> {
        let entries = self.entries.iter();
        let chosen = match policy {
            EvictionPolicy::Lru => entries.min_by_key(|(_, e)| (e.last_accessed, e.access_seq)),
            EvictionPolicy::Fifo => entries.min_by_key(|(_, e)| (e.created_at, e.created_seq)),
            EvictionPolicy::Lifo => entries.max_by_key(|(_, e)| (e.created_at, e.created_seq)),
        };
        chosen.map(|(key, _)| key.clone())
    }

    /// Removes `key` only if it still holds `transport`.
    fn remove_if_same(&mut self, key: &str, transport: &Arc<T>) -> bool {
        let same = self
            .entries
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.transport, transport));
        if same {
            self.entries.remove(key);
        }
        same
    }
}

/// Bounded, keyed pool of shared transports.
pub struct ConnectionPool<T: Transport + ?Sized = dyn Transport> {
    config: PoolConfig,
    inner: Mutex<PoolInner<T>>,
    clock: Arc<dyn Clock>,
}

impl<T: Transport + ?Sized> fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("connection_count", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport + ?Sized> ConnectionPool<T> {
    /// Creates an empty pool.
    pub fn new(config: PoolConfig) -> TransportResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Mutex::new(PoolInner {
                entries: HashMap::new(),
                counters: PoolCounters::default(),
                seq: 0,
            }),
            clock: SystemClock::shared(),
        })
    }

    /// Replaces the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Pool configuration
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of pooled entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Whether `key` is pooled.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Inserts `transport` under `key`.
    ///
    /// Replacing an existing key never evicts. Inserting a new key into a full
    /// pool first evicts one entry; its key is returned.
    pub fn add_connection(&self, key: impl Into<String>, transport: Arc<T>) -> Option<String> {
        let key = key.into();
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let mut evicted = None;
        if !inner.entries.contains_key(&key)
            && inner.entries.len() >= self.config.max_connections
            && let Some(victim) = inner.victim(self.config.eviction_policy)
        {
            inner.entries.remove(&victim);
            inner.counters.evicted += 1;
            debug!(key = %victim, policy = %self.config.eviction_policy, "evicted pooled connection");
            evicted = Some(victim);
        }

        let seq = inner.next_seq();
        let entry = PoolEntry {
            transport,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            created_seq: seq,
            access_seq: seq,
        };
        if inner.entries.insert(key.clone(), entry).is_none() {
            inner.counters.created += 1;
        }
        trace!(key = %key, size = inner.entries.len(), "pooled connection added");
        evicted
    }

    /// Looks up `key`, health-checking the entry before handing it out.
    ///
    /// An unhealthy entry is removed and `None` is returned.
    pub async fn get_connection(&self, key: &str) -> Option<Arc<T>> {
        let transport = self.inner.lock().entries.get(key)?.transport.clone();

        let report = transport.health_check().await;

        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !report.healthy {
            if inner.remove_if_same(key, &transport) {
                inner.counters.health_check_failures += 1;
                warn!(key = %key, checks = ?report.checks, "dropping unhealthy pooled connection");
            }
            return None;
        }

        let seq = inner.next_seq();
        let entry = inner.entries.get_mut(key)?;
        if !Arc::ptr_eq(&entry.transport, &transport) {
            return None;
        }
        entry.last_accessed = now;
        entry.access_count += 1;
        entry.access_seq = seq;
        inner.counters.acquired += 1;
        Some(transport)
    }

    /// Removes `key`; returns whether it was present.
    pub fn remove_connection(&self, key: &str) -> bool {
        let removed = self.inner.lock().entries.remove(key).is_some();
        if removed {
            trace!(key = %key, "pooled connection removed");
        }
        removed
    }

    /// Returns a borrowed instance to the pool.
    ///
    /// The pool size never changes. Returns `false` if `key` no longer holds
    /// `transport`.
    pub fn release_connection(&self, key: &str, transport: &Arc<T>) -> bool {
        let mut inner = self.inner.lock();
        let held = inner
            .entries
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.transport, transport));
        if held {
            inner.counters.released += 1;
        } else {
            debug!(key = %key, "released connection is no longer pooled");
        }
        held
    }

    /// Key currently holding `transport`, if any.
    pub fn key_of(&self, transport: &Arc<T>) -> Option<String> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|(_, entry)| Arc::ptr_eq(&entry.transport, transport))
            .map(|(key, _)| key.clone())
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        if count > 0 {
            debug!(count, "connection pool cleared");
        }
    }

    /// Health-checks every entry, removing the unhealthy ones.
    pub async fn perform_health_check(&self) -> PoolHealth {
        let snapshot: Vec<(String, Arc<T>)> = self
            .inner
            .lock()
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.transport.clone()))
            .collect();

        let mut health = PoolHealth {
            total: snapshot.len(),
            ..PoolHealth::default()
        };
        let mut failed = Vec::new();
        for (key, transport) in snapshot {
            if transport.health_check().await.healthy {
                health.healthy += 1;
            } else {
                health.unhealthy += 1;
                failed.push((key, transport));
            }
        }

        if !failed.is_empty() {
            let mut inner = self.inner.lock();
            for (key, transport) in &failed {
                if inner.remove_if_same(key, transport) {
                    inner.counters.health_check_failures += 1;
                    warn!(key = %key, "removed unhealthy pooled connection");
                }
            }
        }
        health
    }

    /// Counter snapshot.
    pub fn get_stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            connections_created: inner.counters.created,
            connections_acquired: inner.counters.acquired,
            connections_released: inner.counters.released,
            connections_evicted: inner.counters.evicted,
            health_check_failures: inner.counters.health_check_failures,
            connection_count: inner.entries.len(),
            max_connections: self.config.max_connections,
        }
    }

    /// Per-entry metadata, sorted by key.
    pub fn get_pool_info(&self) -> PoolInfo {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let mut connections: Vec<PooledConnectionInfo> = inner
            .entries
            .iter()
            .map(|(key, entry)| PooledConnectionInfo {
                key: key.clone(),
                age: now.saturating_duration_since(entry.created_at),
                idle: now.saturating_duration_since(entry.last_accessed),
                access_count: entry.access_count,
                connected: entry.transport.is_connected(),
            })
            .collect();
        connections.sort_by(|a, b| a.key.cmp(&b.key));
        PoolInfo {
            eviction_policy: self.config.eviction_policy,
            max_connections: self.config.max_connections,
            connections,
        }
    }
}
