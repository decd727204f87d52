//! Subscribe -> initial window -> live update, wired through the real subscription service,
//! orchestrator and streaming manager against a real Redis instance for the cache + pub/sub bus.
//!
//! Skips gracefully if no Redis is reachable, the same way an integration test that depends on a
//! fixture database would skip when that fixture is absent, rather than failing on missing
//! infrastructure.

use async_trait::async_trait;
use barstream_engine::backfill::Backfill;
use barstream_engine::bar::{Bar, SubscriptionKey};
use barstream_engine::cache::Cache;
use barstream_engine::config::Config;
use barstream_engine::error::EngineError;
use barstream_engine::orchestrator::{Orchestrator, PluginProvider};
use barstream_engine::plugin::{Credentials, InstrumentDetails, Plugin, StreamPayload, StreamType};
use barstream_engine::store::Store;
use barstream_engine::streaming::StreamingManager;
use barstream_engine::subscription::{ClientHandle, SubscriptionService};
use barstream_engine::timeframe::Timeframe;
use std::sync::Arc;
use std::time::Duration;

fn bar(ts_ms: i64) -> Bar {
    Bar {
        ts_ms,
        open: 100.0,
        high: 101.0,
        low: 99.0,
        close: 100.5,
        volume: 10.0,
    }
}

/// Answers historical requests with three 1m bars and, once the live connection is established,
/// pushes one more bar through the native-push path after a short delay -- standing in for a
/// provider that streams.
struct LivePlugin;

#[async_trait]
impl Plugin for LivePlugin {
    fn plugin_key(&self) -> &'static str {
        "live"
    }
    fn supported_markets(&self) -> Vec<&'static str> {
        vec!["crypto"]
    }
    fn list_configurable_providers(&self) -> Vec<&'static str> {
        vec!["fakeexchange"]
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
    async fn fetch_historical_1m(&self, _symbol: &str, since_ms: i64, limit: u32) -> Result<Vec<Bar>, EngineError> {
        if since_ms > 0 {
            return Ok(vec![]);
        }
        Ok((0..limit.min(3) as i64).map(|i| bar(i * 60_000)).collect())
    }
    fn supports_native_push(&self, stream_type: StreamType) -> bool {
        stream_type == StreamType::Ohlcv1m
    }
    async fn watch(
        &self,
        _symbol: &str,
        _stream_type: StreamType,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamPayload>, EngineError> {
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx
                .send(StreamPayload {
                    stream_type: StreamType::Ohlcv1m,
                    bar: Some(bar(180_000)),
                    closed: true,
                })
                .await;
        });
        Ok(rx)
    }
}

struct FixedProvider(Arc<dyn Plugin>);

#[async_trait]
impl PluginProvider for FixedProvider {
    async fn plugin_for(
        &self,
        _market: &str,
        _provider: &str,
        _credentials: Option<Credentials>,
    ) -> Result<Arc<dyn Plugin>, EngineError> {
        Ok(self.0.clone())
    }
}

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

#[tokio::test]
async fn subscribe_delivers_initial_window_then_live_update() {
    let Ok(cache) = Cache::connect(&redis_url()).await else {
        eprintln!("skipping subscribe_delivers_initial_window_then_live_update: no redis reachable at {}", redis_url());
        return;
    };
    let cache = Arc::new(cache);

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("live.db");
    let store = Arc::new(Store::open(db_path.to_str().unwrap(), 1_000).unwrap());

    let plugin: Arc<dyn Plugin> = Arc::new(LivePlugin);
    let provider: Arc<dyn PluginProvider> = Arc::new(FixedProvider(plugin));

    let mut config = Config::from_env().unwrap();
    config.max_pages_per_fetch = 1;
    config.default_chunk_limit = 3;
    config.stream_grace = Duration::from_millis(50);
    config.client_send_timeout = Duration::from_secs(5);
    config.default_backfill_period = Duration::from_secs(1);
    let config = Arc::new(config);

    let orchestrator = Arc::new(Orchestrator::new(store.clone(), cache.clone(), provider.clone(), config.clone()));
    let streaming = Arc::new(StreamingManager::new(cache.clone(), provider.clone(), config.clone()));
    let backfill = Arc::new(Backfill::new(store.clone(), provider.clone(), config.clone()));
    let subscriptions = Arc::new(SubscriptionService::new(orchestrator, streaming, backfill, cache, config));

    let (client, mut outbound, _kill) = ClientHandle::new(16);
    let timeframe = Timeframe::parse("1m").unwrap();

    subscriptions
        .subscribe(
            &client,
            "crypto".to_string(),
            "fakeexchange".to_string(),
            "BTC/USD".to_string(),
            timeframe,
            StreamType::Ohlcv1m,
            Some(0),
            None,
            180_000,
        )
        .await;

    let status = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
        .await
        .expect("status frame should arrive")
        .expect("channel should stay open");
    assert!(status.contains("initial data fetching"), "unexpected status frame: {status}");

    let initial = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
        .await
        .expect("initial data frame should arrive")
        .expect("channel should stay open");
    assert!(initial.contains("\"type\":\"data\""), "expected a data frame, got {initial}");
    assert!(initial.contains("60000"), "expected the seeded historical bars in the initial window: {initial}");

    let update = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
        .await
        .expect("live update frame should arrive")
        .expect("channel should stay open");
    assert!(update.contains("\"type\":\"update\""), "expected a live update frame, got {update}");
    assert!(update.contains("180000"), "expected the pushed bar's timestamp in the update frame: {update}");

    let key = SubscriptionKey::new("crypto", "fakeexchange", "BTC/USD", timeframe);
    subscriptions.unsubscribe(client.id, &key, StreamType::Ohlcv1m).await;
}
