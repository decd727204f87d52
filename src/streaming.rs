//! Streaming manager (§4.7): at most one feed per `(SubscriptionKey, stream_type)`, refcounted,
//! native-push preferred over polling, jittered polling, exponential-backoff restart.
//!
//! Grounded on `polymarket_ws.rs`'s reconnect-with-backoff loop (1s doubling, capped at 30s) for
//! the per-feed task shape, and on `borsaorg-borsa`'s `router-stream.rs` (`BackoffConfig` with
//! jitter, per-key supervised feeds) for the refcounted multi-key supervisor and jitter design.

use crate::bar::{Bar, SubscriptionKey};
use crate::cache::Cache;
use crate::config::Config;
use crate::error::EngineError;
use crate::orchestrator::PluginProvider;
use crate::plugin::{Credentials, StreamType};
use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedState {
    Running,
    Grace,
    Dead,
}

struct Feed {
    refcount: AtomicU32,
    state: SyncMutex<FeedState>,
    stop_tx: SyncMutex<Option<oneshot::Sender<()>>>,
}

pub struct StreamingManager {
    feeds: SyncMutex<HashMap<(SubscriptionKey, StreamType), Arc<Feed>>>,
    cache: Arc<Cache>,
    plugins: Arc<dyn PluginProvider>,
    config: Arc<Config>,
}

impl StreamingManager {
    pub fn new(cache: Arc<Cache>, plugins: Arc<dyn PluginProvider>, config: Arc<Config>) -> Self {
        Self {
            feeds: SyncMutex::new(HashMap::new()),
            cache,
            plugins,
            config,
        }
    }

    /// Increments the feed's refcount, starting a new feed task on 0->1 (§4.7).
    pub async fn start(&self, key: SubscriptionKey, stream_type: StreamType, credentials: Option<Credentials>) {
        let feed_key = (key.clone(), stream_type);
        let existing = {
            let mut feeds = self.feeds.lock();
            if let Some(feed) = feeds.get(&feed_key) {
                feed.refcount.fetch_add(1, Ordering::SeqCst);
                *feed.state.lock() = FeedState::Running;
                Some(feed.clone())
            } else {
                let feed = Arc::new(Feed {
                    refcount: AtomicU32::new(1),
                    state: SyncMutex::new(FeedState::Running),
                    stop_tx: SyncMutex::new(None),
                });
                feeds.insert(feed_key.clone(), feed.clone());
                None
            }
        };

        if existing.is_none() {
            let feed = self.feeds.lock().get(&feed_key).unwrap().clone();
            let (stop_tx, stop_rx) = oneshot::channel();
            *feed.stop_tx.lock() = Some(stop_tx);
            self.spawn_feed_task(key, stream_type, credentials, feed, stop_rx);
        }
    }

    /// Decrements the feed's refcount; on 1->0 the feed enters `grace` for `stream_grace` before
    /// being cancelled, unless a new subscriber arrives first (§4.7).
    pub async fn stop(&self, key: &SubscriptionKey, stream_type: StreamType) {
        let feed = {
            let feeds = self.feeds.lock();
            feeds.get(&(key.clone(), stream_type)).cloned()
        };
        let Some(feed) = feed else { return };

        let prior = feed.refcount.fetch_sub(1, Ordering::SeqCst);
        if prior != 1 {
            return;
        }

        *feed.state.lock() = FeedState::Grace;
        let grace = self.config.stream_grace;
        let feeds_map = &self.feeds;
        let feed_key = (key.clone(), stream_type);

        tokio::time::sleep(grace).await;
        if feed.refcount.load(Ordering::SeqCst) == 0 && *feed.state.lock() == FeedState::Grace {
            if let Some(tx) = feed.stop_tx.lock().take() {
                let _ = tx.send(());
            }
            feeds_map.lock().remove(&feed_key);
        }
    }

    fn spawn_feed_task(
        &self,
        key: SubscriptionKey,
        stream_type: StreamType,
        credentials: Option<Credentials>,
        feed: Arc<Feed>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let cache = self.cache.clone();
        let plugins = self.plugins.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut restart_attempts = 0u32;
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(60);

            loop {
                if *feed.state.lock() == FeedState::Dead {
                    return;
                }

                let run_result = tokio::select! {
                    _ = &mut stop_rx => return,
                    result = run_feed_once(&key, stream_type, credentials.clone(), &cache, &plugins, &config) => result,
                };

                match run_result {
                    Ok(()) => {
                        // Feed ended cleanly (e.g. no more subscribers mid-cycle); restart counter resets.
                        restart_attempts = 0;
                        backoff = Duration::from_secs(1);
                    }
                    Err(e) => {
                        restart_attempts += 1;
                        warn!(
                            market = %key.market, provider = %key.provider, symbol = %key.symbol,
                            stream_type = stream_type.as_str(), attempt = restart_attempts, error = %e,
                            "feed failed, restarting with backoff"
                        );
                        if restart_attempts >= config.max_restart_attempts {
                            *feed.state.lock() = FeedState::Dead;
                            let dead_channel = crate::cache::channel_name(
                                &key.market, &key.provider, &key.symbol, stream_type.as_str(),
                            );
                            let _ = cache
                                .publish(&dead_channel, &serde_json::json!({"type":"error","code":"FeedDead"}).to_string())
                                .await;
                            return;
                        }
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(max_backoff);
                    }
                }
            }
        });
    }
}

/// Runs one iteration of the feed (native push if supported, else a jittered poll loop) until it
/// errors or the caller's stop signal fires (handled by the caller's `select!`).
async fn run_feed_once(
    key: &SubscriptionKey,
    stream_type: StreamType,
    credentials: Option<Credentials>,
    cache: &Arc<Cache>,
    plugins: &Arc<dyn PluginProvider>,
    config: &Arc<Config>,
) -> Result<(), EngineError> {
    let plugin = plugins.plugin_for(&key.market, &key.provider, credentials).await?;
    let channel = crate::cache::channel_name(&key.market, &key.provider, &key.symbol, stream_type.as_str());

    if plugin.supports_native_push(stream_type) {
        let mut rx = plugin.watch(&key.symbol, stream_type).await?;
        while let Some(payload) = rx.recv().await {
            if let Some(bar) = payload.bar {
                publish_bar(cache, &channel, &bar, payload.closed).await?;
            }
        }
        return Ok(());
    }

    let poll_interval = poll_interval_for(stream_type, config);
    let mut last_seen_ts = 0i64;
    loop {
        let jitter = jittered(poll_interval);
        tokio::time::sleep(jitter).await;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let bars = plugin.fetch_historical_1m(&key.symbol, last_seen_ts, 100).await?;
        for bar in bars.into_iter().filter(|b| b.ts_ms > last_seen_ts) {
            last_seen_ts = last_seen_ts.max(bar.ts_ms);
            let closed = bar.ts_ms + key_timeframe_ms(key) <= now_ms;
            publish_bar(cache, &channel, &bar, closed).await?;
        }
    }
}

fn key_timeframe_ms(key: &SubscriptionKey) -> i64 {
    key.timeframe.ms() as i64
}

async fn publish_bar(cache: &Arc<Cache>, channel: &str, bar: &Bar, closed: bool) -> Result<(), EngineError> {
    let payload = serde_json::json!({
        "type": "update",
        "payload": {
            "ohlc": [[bar.ts_ms, bar.open, bar.high, bar.low, bar.close]],
            "volume": [[bar.ts_ms, bar.volume]],
            "closed": closed,
        }
    });
    cache.publish(channel, &payload.to_string()).await
}

fn poll_interval_for(stream_type: StreamType, config: &Config) -> Duration {
    match stream_type {
        StreamType::Ohlcv1m => Duration::from_secs(config.poll_ohlcv_sec),
        StreamType::Trades => Duration::from_secs(config.poll_trades_sec),
        StreamType::Book => Duration::from_secs(config.poll_book_sec),
        StreamType::UserOrders => Duration::from_secs(config.poll_user_orders_sec),
    }
}

/// Uniform noise +-10% to avoid synchronized fan-out (§4.7).
fn jittered(interval: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range(0.9..=1.1);
    Duration::from_secs_f64(interval.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(60);
        for _ in 0..1000 {
            let jittered = jittered(base);
            assert!(jittered.as_secs_f64() >= 54.0);
            assert!(jittered.as_secs_f64() <= 66.0);
        }
    }

    #[test]
    fn poll_intervals_match_defaults() {
        let cfg = Config::from_env().unwrap();
        assert_eq!(poll_interval_for(StreamType::Ohlcv1m, &cfg), Duration::from_secs(60));
        assert_eq!(poll_interval_for(StreamType::Trades, &cfg), Duration::from_secs(5));
        assert_eq!(poll_interval_for(StreamType::Book, &cfg), Duration::from_secs(2));
        assert_eq!(poll_interval_for(StreamType::UserOrders, &cfg), Duration::from_secs(15));
    }
}
