//! Plugin instance registry: one connector per `(plugin, provider, credential, testnet)` tuple,
//! with idle eviction (§4.4).
//!
//! Grounded on §9's design note ("two-level lock: registry map + per-key construction mutex,
//! reference counting to coordinate eviction with in-flight borrowers") and, for the
//! construction-under-lock idiom itself, on `edgelord`'s `ConnectionPool` (TTL-based rotation,
//! zero-gap handoff) — adapted here from connection rotation to instance-cache eviction.

use crate::bar::InstanceCacheKey;
use crate::error::EngineError;
use crate::plugin::{Credentials, Plugin};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

/// Constructs plugin instances for one `plugin_key`. Implemented once per connector family.
#[async_trait]
pub trait PluginFactory: Send + Sync {
    fn plugin_key(&self) -> &'static str;
    fn list_configurable_providers(&self) -> Vec<&'static str>;
    async fn construct(
        &self,
        provider_id: &str,
        credentials: Option<Credentials>,
        testnet: bool,
    ) -> Result<Arc<dyn Plugin>, EngineError>;
}

struct Entry {
    plugin: Arc<dyn Plugin>,
    last_accessed_at_ms: AtomicI64,
    refcount: AtomicUsize,
}

/// RAII handle returned by [`Registry::get_plugin`]. Derefs to the plugin; dropping it releases
/// the borrow the idle sweeper waits on before forcing eviction.
pub struct PluginHandle(Arc<Entry>);

impl Deref for PluginHandle {
    type Target = Arc<dyn Plugin>;
    fn deref(&self) -> &Self::Target {
        &self.0.plugin
    }
}

impl Clone for PluginHandle {
    fn clone(&self) -> Self {
        self.0.refcount.fetch_add(1, Ordering::SeqCst);
        Self(self.0.clone())
    }
}

impl Drop for PluginHandle {
    fn drop(&mut self) {
        self.0.refcount.fetch_sub(1, Ordering::SeqCst);
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct Registry {
    factories: HashMap<&'static str, Arc<dyn PluginFactory>>,
    /// `(market, provider) -> plugin_key` discovery map (§4.4 step 1).
    market_discovery: HashMap<(String, String), &'static str>,
    entries: Arc<SyncMutex<HashMap<InstanceCacheKey, Arc<Entry>>>>,
    construction_locks: Arc<SyncMutex<HashMap<InstanceCacheKey, Arc<AsyncMutex<()>>>>>,
    idle_ttl: Duration,
    eviction_grace: Duration,
}

impl Registry {
    pub fn new(idle_ttl: Duration, eviction_grace: Duration) -> Self {
        Self {
            factories: HashMap::new(),
            market_discovery: HashMap::new(),
            entries: Arc::new(SyncMutex::new(HashMap::new())),
            construction_locks: Arc::new(SyncMutex::new(HashMap::new())),
            idle_ttl,
            eviction_grace,
        }
    }

    pub fn register_factory(&mut self, factory: Arc<dyn PluginFactory>) {
        self.factories.insert(factory.plugin_key(), factory);
    }

    pub fn register_market(&mut self, market: &str, provider: &str, plugin_key: &'static str) {
        self.market_discovery
            .insert((market.to_string(), provider.to_string()), plugin_key);
    }

    fn resolve_plugin_key(&self, market: &str, provider: &str) -> Result<&'static str, EngineError> {
        if let Some(key) = self.market_discovery.get(&(market.to_string(), provider.to_string())) {
            return Ok(key);
        }
        // Fall back: the market lookup failed, but `provider` may itself name a known plugin_key.
        if self.factories.contains_key(provider) {
            return Ok(self.factories.get_key_value(provider).unwrap().0);
        }
        Err(EngineError::InvalidSymbol(format!(
            "no plugin registered for market={market} provider={provider}"
        )))
    }

    pub async fn get_plugin(
        &self,
        market: &str,
        provider: &str,
        credentials: Option<Credentials>,
        testnet: bool,
    ) -> Result<PluginHandle, EngineError> {
        let plugin_key = self.resolve_plugin_key(market, provider)?;
        let factory = self
            .factories
            .get(plugin_key)
            .cloned()
            .ok_or_else(|| EngineError::PluginInternalError(format!("unknown plugin_key {plugin_key}")))?;

        if !factory.list_configurable_providers().contains(&provider) {
            return Err(EngineError::InvalidSymbol(format!(
                "provider {provider} not configurable for plugin {plugin_key}"
            )));
        }

        let credential_fingerprint = credentials
            .as_ref()
            .and_then(|c| c.api_key.as_deref())
            .map(InstanceCacheKey::fingerprint_credential)
            .unwrap_or_else(|| crate::bar::PUBLIC_CREDENTIAL_MARKER.to_string());

        let key = InstanceCacheKey {
            plugin_key: plugin_key.to_string(),
            provider_id: provider.to_string(),
            credential_fingerprint,
            testnet,
        };

        if let Some(entry) = self.touch(&key) {
            return Ok(PluginHandle(entry));
        }

        let construction_lock = {
            let mut locks = self.construction_locks.lock();
            locks.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        let _guard = construction_lock.lock().await;

        // Double-check: another task may have constructed it while we waited for the lock.
        if let Some(entry) = self.touch(&key) {
            return Ok(PluginHandle(entry));
        }

        let plugin = factory.construct(provider, credentials, testnet).await?;
        let entry = Arc::new(Entry {
            plugin,
            last_accessed_at_ms: AtomicI64::new(now_ms()),
            refcount: AtomicUsize::new(1),
        });
        self.entries.lock().insert(key.clone(), entry.clone());
        Ok(PluginHandle(entry))
    }

    fn touch(&self, key: &InstanceCacheKey) -> Option<Arc<Entry>> {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        entry.last_accessed_at_ms.store(now_ms(), Ordering::SeqCst);
        entry.refcount.fetch_add(1, Ordering::SeqCst);
        Some(entry.clone())
    }

    /// Runs one idle sweep, closing and removing entries idle for longer than `idle_ttl`.
    /// An active borrower (refcount > 0) is given `eviction_grace` to finish before the entry
    /// is force-closed with a warning, matching §4.4's eviction-vs-borrower race rule.
    pub async fn sweep_once(&self) {
        let now = now_ms();
        let idle_ttl_ms = self.idle_ttl.as_millis() as i64;

        let stale_keys: Vec<InstanceCacheKey> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, e)| now - e.last_accessed_at_ms.load(Ordering::SeqCst) > idle_ttl_ms)
                .map(|(k, _)| k.clone())
                .collect()
        };

        for key in stale_keys {
            let entry = {
                let entries = self.entries.lock();
                entries.get(&key).cloned()
            };
            let Some(entry) = entry else { continue };

            if entry.refcount.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(self.eviction_grace).await;
                if entry.refcount.load(Ordering::SeqCst) > 0 {
                    warn!(
                        plugin_key = %key.plugin_key,
                        provider_id = %key.provider_id,
                        "forcing plugin eviction past grace period with active borrowers"
                    );
                }
            }

            self.entries.lock().remove(&key);
            self.construction_locks.lock().remove(&key);
            entry.plugin.close().await;
        }
    }

    /// Spawns the periodic idle sweeper described in §4.4. Returns a handle that can be used to
    /// cancel it on shutdown.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }

    pub fn instance_count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{InstrumentDetails, StreamPayload, StreamType};

    struct CountingFactory {
        constructed: Arc<AtomicUsize>,
    }

    struct StubPlugin;

    #[async_trait]
    impl Plugin for StubPlugin {
        fn plugin_key(&self) -> &'static str {
            "stub"
        }
        fn supported_markets(&self) -> Vec<&'static str> {
            vec!["crypto"]
        }
        fn list_configurable_providers(&self) -> Vec<&'static str> {
            vec!["kraken"]
        }
        async fn close(&self) {}
        async fn get_symbols(&self, _market: &str) -> Result<Vec<String>, EngineError> {
            Ok(vec![])
        }
        async fn get_instrument_details(&self, _symbol: &str) -> Result<InstrumentDetails, EngineError> {
            Ok(InstrumentDetails {
                precision: 2,
                min_qty: 0.0,
                max_qty: None,
            })
        }
        async fn fetch_historical_1m(
            &self,
            _symbol: &str,
            _since_ms: i64,
            _limit: u32,
        ) -> Result<Vec<crate::bar::Bar>, EngineError> {
            Ok(vec![])
        }
        fn supports_native_push(&self, _stream_type: StreamType) -> bool {
            false
        }
        async fn watch(
            &self,
            _symbol: &str,
            _stream_type: StreamType,
        ) -> Result<tokio::sync::mpsc::Receiver<StreamPayload>, EngineError> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(rx)
        }
    }

    #[async_trait]
    impl PluginFactory for CountingFactory {
        fn plugin_key(&self) -> &'static str {
            "stub"
        }
        fn list_configurable_providers(&self) -> Vec<&'static str> {
            vec!["kraken"]
        }
        async fn construct(
            &self,
            _provider_id: &str,
            _credentials: Option<Credentials>,
            _testnet: bool,
        ) -> Result<Arc<dyn Plugin>, EngineError> {
            self.constructed.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubPlugin))
        }
    }

    #[tokio::test]
    async fn concurrent_get_plugin_constructs_exactly_once() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new(Duration::from_secs(900), Duration::from_secs(10));
        registry.register_factory(Arc::new(CountingFactory {
            constructed: constructed.clone(),
        }));
        registry.register_market("crypto", "kraken", "stub");
        let registry = Arc::new(registry);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_plugin("crypto", "kraken", None, false).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(constructed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.instance_count(), 1);
    }

    #[tokio::test]
    async fn idle_sweep_evicts_past_ttl() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new(Duration::from_millis(1), Duration::from_millis(1));
        registry.register_factory(Arc::new(CountingFactory {
            constructed: constructed.clone(),
        }));
        registry.register_market("crypto", "kraken", "stub");
        let registry = Arc::new(registry);

        let handle = registry.get_plugin("crypto", "kraken", None, false).await.unwrap();
        drop(handle);
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.sweep_once().await;
        assert_eq!(registry.instance_count(), 0);
    }
}
