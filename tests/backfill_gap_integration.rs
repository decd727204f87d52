//! End-to-end coverage of the backfill coordinator against a real on-disk store: a history with
//! a hole gets that hole filled from a fake provider, and a history with nothing missing does
//! not touch the provider at all.

use async_trait::async_trait;
use barstream_engine::backfill::{Backfill, BackfillState};
use barstream_engine::bar::Bar;
use barstream_engine::config::Config;
use barstream_engine::error::EngineError;
use barstream_engine::orchestrator::PluginProvider;
use barstream_engine::plugin::{Credentials, InstrumentDetails, Plugin, StreamPayload, StreamType};
use barstream_engine::store::Store;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn bar(ts_ms: i64) -> Bar {
    Bar {
        ts_ms,
        open: 1.0,
        high: 1.0,
        low: 1.0,
        close: 1.0,
        volume: 1.0,
    }
}

/// Fills every minute starting at `since_ms`, up to `limit` bars, the way a real REST provider
/// would answer a paged historical request.
struct FillingProvider {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Plugin for FillingProvider {
    fn plugin_key(&self) -> &'static str {
        "filling"
    }
    fn supported_markets(&self) -> Vec<&'static str> {
        vec!["crypto"]
    }
    fn list_configurable_providers(&self) -> Vec<&'static str> {
        vec!["fakeprovider"]
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
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((0..limit as i64).map(|i| bar(since_ms + i * 60_000)).collect())
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

fn fast_config(backfill_period_secs: u64) -> Config {
    let mut cfg = Config::from_env().unwrap();
    cfg.default_backfill_period = Duration::from_secs(backfill_period_secs);
    cfg.chunk_delay = Duration::from_millis(0);
    cfg.max_chunks_per_run = 50;
    cfg.default_chunk_limit = 20;
    cfg.max_concurrent_api = 4;
    cfg
}

#[tokio::test]
async fn backfill_fills_gap_in_recent_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backfill.db");
    let store = Arc::new(Store::open(path.to_str().unwrap(), 1_000).unwrap());

    // Only the newest minute is present; everything from t-9m..t-1m is missing.
    let now_ms = 10 * 60_000i64;
    store.insert_1m("crypto", "fakeprovider", "BTC/USD", &[bar(now_ms)]).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let plugin: Arc<dyn Plugin> = Arc::new(FillingProvider { calls: calls.clone() });
    let provider: Arc<dyn PluginProvider> = Arc::new(FixedProvider(plugin));
    let config = Arc::new(fast_config(600));

    let backfill = Backfill::new(store.clone(), provider, config);
    let state = backfill.run("crypto", "fakeprovider", "BTC/USD", None, now_ms).await;

    assert_eq!(state, BackfillState::Done);
    assert!(calls.load(Ordering::SeqCst) >= 1, "provider should have been queried at least once");

    let remaining = store
        .find_missing_1m_ranges("crypto", "fakeprovider", "BTC/USD", now_ms - 600_000, now_ms)
        .unwrap();
    assert!(remaining.is_empty(), "expected gap fully filled, still missing: {remaining:?}");
}

#[tokio::test]
async fn backfill_is_noop_when_nothing_missing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backfill.db");
    let store = Arc::new(Store::open(path.to_str().unwrap(), 1_000).unwrap());

    let now_ms = 5 * 60_000i64;
    let bars: Vec<Bar> = (0..=5).map(|i| bar(i * 60_000)).collect();
    store.insert_1m("crypto", "fakeprovider", "ETH/USD", &bars).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let plugin: Arc<dyn Plugin> = Arc::new(FillingProvider { calls: calls.clone() });
    let provider: Arc<dyn PluginProvider> = Arc::new(FixedProvider(plugin));
    let config = Arc::new(fast_config(300));

    let backfill = Backfill::new(store, provider, config);
    let state = backfill.run("crypto", "fakeprovider", "ETH/USD", None, now_ms).await;

    assert_eq!(state, BackfillState::Done);
    assert_eq!(calls.load(Ordering::SeqCst), 0, "fully-populated history should never reach the provider");
}

#[tokio::test]
async fn concurrent_runs_for_the_same_asset_do_not_double_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backfill.db");
    let store = Arc::new(Store::open(path.to_str().unwrap(), 1_000).unwrap());

    let now_ms = 10 * 60_000i64;
    let calls = Arc::new(AtomicUsize::new(0));
    let plugin: Arc<dyn Plugin> = Arc::new(FillingProvider { calls: calls.clone() });
    let provider: Arc<dyn PluginProvider> = Arc::new(FixedProvider(plugin));
    let config = Arc::new(fast_config(600));
    let backfill = Arc::new(Backfill::new(store.clone(), provider, config));

    let a = backfill.clone();
    let b = backfill.clone();
    let (ra, rb) = tokio::join!(
        a.run("crypto", "fakeprovider", "BTC/USD", None, now_ms),
        b.run("crypto", "fakeprovider", "BTC/USD", None, now_ms),
    );

    assert_eq!(ra, BackfillState::Done);
    assert_eq!(rb, BackfillState::Done);
    // The second run serializes behind the first's per-asset lock and finds nothing left to do.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
