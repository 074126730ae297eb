//! Factory-driven transport creation with per-type pooling.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use rpcwire_traits::{
    Clock, SystemClock, Transport, TransportConfig, TransportError, TransportFactory,
    TransportResult, TransportType,
};

use crate::pool::{ConnectionPool, PoolConfig, PoolHealth, PoolInfo, PoolStats};

/// Deterministic pool key for `(transport_type, config)`.
///
/// `"{type}:{sha256 of the config's canonical JSON}"`. Config keys are
/// ordered, so equal configs always produce equal keys.
pub fn pool_key(transport_type: TransportType, config: &TransportConfig) -> String {
    let canonical = serde_json::to_vec(config).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    let mut key = String::with_capacity(transport_type.to_string().len() + 1 + digest.len() * 2);
    let _ = write!(key, "{transport_type}:");
    for byte in digest {
        let _ = write!(key, "{byte:02x}");
    }
    key
}

/// Creates transports through registered factories, reusing pooled
/// instances when pooling is enabled.
///
/// Pooled transports are shared: callers receive an `Arc` and must
/// `start()` a fresh instance themselves. Instances that are not connected
/// fail the pool's health check and are replaced on the next request.
pub struct PooledTransportManager {
    factories: RwLock<HashMap<TransportType, Arc<dyn TransportFactory>>>,
    pools: RwLock<BTreeMap<TransportType, Arc<ConnectionPool>>>,
    pool_config: RwLock<Option<PoolConfig>>,
    transports_created: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PooledTransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledTransportManager")
            .field("factories", &self.factories.read().keys().collect::<Vec<_>>())
            .field("pool_config", &*self.pool_config.read())
            .field("transports_created", &self.transports_created())
            .finish_non_exhaustive()
    }
}

impl Default for PooledTransportManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PooledTransportManager {
    /// A manager with no factories and pooling enabled with defaults.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            pools: RwLock::new(BTreeMap::new()),
            pool_config: RwLock::new(Some(PoolConfig::default())),
            transports_created: AtomicU64::new(0),
            clock: SystemClock::shared(),
        }
    }

    /// A manager with the stdio and HTTP factories registered, as enabled
    /// by crate features.
    pub fn with_default_factories() -> Self {
        let manager = Self::new();
        #[cfg(feature = "stdio")]
        manager.register_factory(Arc::new(crate::stdio::StdioTransportFactory));
        #[cfg(feature = "http")]
        manager.register_factory(Arc::new(crate::http::HttpTransportFactory));
        manager
    }

    /// Replaces the time source used by pools created from now on.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registers `factory` for its transport type, replacing any previous one.
    pub fn register_factory(&self, factory: Arc<dyn TransportFactory>) {
        let transport_type = factory.transport_type();
        debug!(transport = %transport_type, "registered transport factory");
        self.factories.write().insert(transport_type, factory);
    }

    /// Whether a usable factory is registered for `transport_type`.
    pub fn has_factory(&self, transport_type: TransportType) -> bool {
        self.factories
            .read()
            .get(&transport_type)
            .is_some_and(|f| f.is_available())
    }

    /// Whether pooling is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.pool_config.read().is_some()
    }

    /// Number of instances built by factories.
    pub fn transports_created(&self) -> u64 {
        self.transports_created.load(Ordering::Relaxed)
    }

    /// Returns a pooled transport for `(transport_type, config)` or builds a
    /// new one.
    pub async fn create_transport(
        &self,
        transport_type: TransportType,
        config: TransportConfig,
    ) -> TransportResult<Arc<dyn Transport>> {
        let pooling = self.pool_config.read().clone();
        let key = pool_key(transport_type, &config);

        if pooling.is_some()
            && let Some(pool) = self.existing_pool(transport_type)
            && let Some(transport) = pool.get_connection(&key).await
        {
            debug!(transport = %transport_type, key = %key, "reusing pooled transport");
            return Ok(transport);
        }

        let factory = self
            .factories
            .read()
            .get(&transport_type)
            .cloned()
            .ok_or_else(|| {
                TransportError::NotAvailable(format!(
                    "no factory registered for {transport_type} transport"
                ))
            })?;
        if !factory.is_available() {
            return Err(TransportError::NotAvailable(format!(
                "{transport_type} transport is not available"
            )));
        }

        let transport: Arc<dyn Transport> = Arc::from(factory.create(config)?);
        self.transports_created.fetch_add(1, Ordering::Relaxed);

        if let Some(pool_config) = pooling
            && pool_config.insert_on_create
        {
            let pool = self.pool_for(transport_type, &pool_config)?;
            pool.add_connection(key.clone(), transport.clone());
        }
        debug!(transport = %transport_type, key = %key, "created transport");
        Ok(transport)
    }

    /// Returns a borrowed instance to its pool.
    ///
    /// Returns `false` when pooling is disabled or the instance is not pooled.
    pub fn release_transport(
        &self,
        transport_type: TransportType,
        transport: &Arc<dyn Transport>,
    ) -> bool {
        let Some(pool) = self.existing_pool(transport_type) else {
            return false;
        };
        pool.key_of(transport)
            .is_some_and(|key| pool.release_connection(&key, transport))
    }

    /// Enables pooling with `config`.
    ///
    /// Existing pools are flushed so every pool follows the new config.
    pub fn enable_pooling(&self, config: PoolConfig) -> TransportResult<()> {
        config.validate()?;
        self.clear_pools();
        self.pools.write().clear();
        info!(
            max_connections = config.max_connections,
            policy = %config.eviction_policy,
            "transport pooling enabled"
        );
        *self.pool_config.write() = Some(config);
        Ok(())
    }

    /// Flushes every pool and disables pooling.
    pub fn disable_pooling(&self) {
        self.clear_pools();
        self.pools.write().clear();
        *self.pool_config.write() = None;
        info!("transport pooling disabled");
    }

    /// Health-checks every pool, summing the results.
    pub async fn perform_health_checks(&self) -> PoolHealth {
        let pools: Vec<Arc<ConnectionPool>> = self.pools.read().values().cloned().collect();
        let mut total = PoolHealth::default();
        for pool in pools {
            total += pool.perform_health_check().await;
        }
        total
    }

    /// Empties the pool for `transport_type`.
    pub fn clear_pool(&self, transport_type: TransportType) {
        if let Some(pool) = self.existing_pool(transport_type) {
            pool.clear();
        }
    }

    /// Empties every pool.
    pub fn clear_pools(&self) {
        for pool in self.pools.read().values() {
            pool.clear();
        }
    }

    /// Stats for every pool that exists.
    pub fn get_pool_stats(&self) -> BTreeMap<TransportType, PoolStats> {
        self.pools
            .read()
            .iter()
            .map(|(transport_type, pool)| (*transport_type, pool.get_stats()))
            .collect()
    }

    /// Entry metadata for every pool that exists.
    pub fn get_pool_info(&self) -> BTreeMap<TransportType, PoolInfo> {
        self.pools
            .read()
            .iter()
            .map(|(transport_type, pool)| (*transport_type, pool.get_pool_info()))
            .collect()
    }

    fn existing_pool(&self, transport_type: TransportType) -> Option<Arc<ConnectionPool>> {
        self.pools.read().get(&transport_type).cloned()
    }

    fn pool_for(
        &self,
        transport_type: TransportType,
        config: &PoolConfig,
    ) -> TransportResult<Arc<ConnectionPool>> {
        if let Some(pool) = self.existing_pool(transport_type) {
            return Ok(pool);
        }
        let mut pools = self.pools.write();
        if let Some(pool) = pools.get(&transport_type) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(ConnectionPool::new(config.clone())?.with_clock(self.clock.clone()));
        pools.insert(transport_type, pool.clone());
        Ok(pool)
    }
}
