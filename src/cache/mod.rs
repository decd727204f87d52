//! Cache (§4.3): a shared TTL'd KV with pub/sub, backed by `redis`.
//!
//! Grounded on `hack-ink-jwks-cache`'s `CacheManager` for the overall shape (a cheap `Clone`
//! handle wrapping a connection manager, single-flight guarding refresh-on-miss work) and on
//! `nautechsystems-nautilus_trader`'s use of `redis` with `tokio-comp`/`connection-manager` for
//! this domain's exact hot KV+pubsub coupling.

use crate::bar::{finite_f64, Bar};
use crate::error::EngineError;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const BUCKET_MS: i64 = 3_600_000;

/// `bars1m:{market}:{provider}:{symbol}:{bucket_hour_ms}` per §4.3.
pub fn bucket_key(market: &str, provider: &str, symbol: &str, bucket_ms: i64) -> String {
    format!("bars1m:{market}:{provider}:{symbol}:{bucket_ms}")
}

/// `res:{market}:{provider}:{symbol}:{tf}:{since}:{until}:{limit}` per §4.3.
pub fn resample_key(
    market: &str,
    provider: &str,
    symbol: &str,
    tf: &str,
    since: Option<i64>,
    until: Option<i64>,
    limit: Option<u32>,
) -> String {
    format!(
        "res:{market}:{provider}:{symbol}:{tf}:{}:{}:{}",
        since.map(|v| v.to_string()).unwrap_or_default(),
        until.map(|v| v.to_string()).unwrap_or_default(),
        limit.map(|v| v.to_string()).unwrap_or_default(),
    )
}

/// `feed:{market}:{provider}:{symbol}:{stream_type}` per §4.3.
pub fn channel_name(market: &str, provider: &str, symbol: &str, stream_type: &str) -> String {
    format!("feed:{market}:{provider}:{symbol}:{stream_type}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BarsWire(#[serde(with = "bars_finite_f64")] Vec<Bar>);

mod bars_finite_f64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    #[derive(Serialize, Deserialize)]
    struct BarWire {
        ts_ms: i64,
        #[serde(with = "finite_f64")]
        open: f64,
        #[serde(with = "finite_f64")]
        high: f64,
        #[serde(with = "finite_f64")]
        low: f64,
        #[serde(with = "finite_f64")]
        close: f64,
        #[serde(with = "finite_f64")]
        volume: f64,
    }

    pub fn serialize<S: Serializer>(bars: &[Bar], serializer: S) -> Result<S::Ok, S::Error> {
        let wire: Vec<BarWire> = bars
            .iter()
            .map(|b| BarWire {
                ts_ms: b.ts_ms,
                open: b.open,
                high: b.high,
                low: b.low,
                close: b.close,
                volume: b.volume,
            })
            .collect();
        wire.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Bar>, D::Error> {
        let wire = Vec::<BarWire>::deserialize(deserializer)?;
        Ok(wire
            .into_iter()
            .map(|w| Bar {
                ts_ms: w.ts_ms,
                open: w.open,
                high: w.high,
                low: w.low,
                close: w.close,
                volume: w.volume,
            })
            .collect())
    }
}

#[derive(Clone)]
pub struct Cache {
    conn: ConnectionManager,
    client: redis::Client,
    /// Guards merge-on-write of a single 1m bucket so concurrent writers don't clobber each
    /// other's partial reads, the way `CacheManager::single_flight` guards JWKS refresh.
    write_lock: Arc<Mutex<()>>,
}

impl Cache {
    pub async fn connect(redis_url: &str) -> Result<Self, EngineError> {
        let client = redis::Client::open(redis_url).map_err(EngineError::from)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(EngineError::from)?;
        Ok(Self {
            conn,
            client,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Reads all 1m bars in `[since, until)` by touching only the hour buckets the window
    /// spans, then filtering client-side.
    pub async fn get_1m_bars(
        &self,
        market: &str,
        provider: &str,
        symbol: &str,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<Vec<Bar>, EngineError> {
        let mut conn = self.conn.clone();
        let first_bucket = (since_ms / BUCKET_MS) * BUCKET_MS;
        let last_bucket = ((until_ms - 1).max(since_ms) / BUCKET_MS) * BUCKET_MS;

        let mut out = Vec::new();
        let mut bucket = first_bucket;
        while bucket <= last_bucket {
            let key = bucket_key(market, provider, symbol, bucket);
            let raw: Option<String> = conn.get(&key).await.map_err(EngineError::from)?;
            if let Some(raw) = raw {
                if let Ok(BarsWire(bars)) = serde_json::from_str::<BarsWire>(&raw) {
                    out.extend(bars.into_iter().filter(|b| b.ts_ms >= since_ms && b.ts_ms < until_ms));
                }
            }
            bucket += BUCKET_MS;
        }
        out.sort_by_key(|b| b.ts_ms);
        Ok(out)
    }

    /// Merges `bars` into their hour buckets (dedup by `ts_ms`, keeping the new value), pipelined
    /// per bucket, with a per-bucket TTL.
    pub async fn store_1m_bars(
        &self,
        market: &str,
        provider: &str,
        symbol: &str,
        bars: &[Bar],
        ttl: Duration,
    ) -> Result<(), EngineError> {
        if bars.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut conn = self.conn.clone();

        let mut by_bucket: std::collections::BTreeMap<i64, Vec<Bar>> = std::collections::BTreeMap::new();
        for bar in bars {
            by_bucket.entry((bar.ts_ms / BUCKET_MS) * BUCKET_MS).or_default().push(bar.clone());
        }

        let mut pipe = redis::pipe();
        for (bucket, new_bars) in by_bucket {
            let key = bucket_key(market, provider, symbol, bucket);
            let existing: Option<String> = conn.get(&key).await.map_err(EngineError::from)?;
            let mut merged: std::collections::BTreeMap<i64, Bar> = existing
                .and_then(|raw| serde_json::from_str::<BarsWire>(&raw).ok())
                .map(|BarsWire(bars)| bars.into_iter().map(|b| (b.ts_ms, b)).collect())
                .unwrap_or_default();
            for bar in new_bars {
                merged.insert(bar.ts_ms, bar);
            }
            let serialized = serde_json::to_string(&BarsWire(merged.into_values().collect()))
                .expect("bar list always serializes");
            pipe.set_ex(&key, serialized, ttl.as_secs().max(1));
        }
        pipe.query_async::<_, ()>(&mut conn).await.map_err(EngineError::from)?;
        Ok(())
    }

    pub async fn get_resampled(&self, key: &str) -> Result<Option<Vec<Bar>>, EngineError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await.map_err(EngineError::from)?;
        Ok(raw.and_then(|r| serde_json::from_str::<BarsWire>(&r).ok()).map(|w| w.0))
    }

    pub async fn set_resampled(&self, key: &str, bars: &[Bar], ttl: Duration) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        let serialized =
            serde_json::to_string(&BarsWire(bars.to_vec())).expect("bar list always serializes");
        conn.set_ex::<_, _, ()>(key, serialized, ttl.as_secs().max(1))
            .await
            .map_err(EngineError::from)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), EngineError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await.map_err(EngineError::from)
    }

    /// Opens a dedicated pub/sub connection subscribed to `channel`. Each feed/listener task
    /// owns its own subscription; the shared [`ConnectionManager`] is not reused for pub/sub
    /// since `redis-rs` pub/sub requires exclusive use of the underlying connection.
    pub async fn subscribe(&self, channel: &str) -> Result<redis::aio::PubSub, EngineError> {
        let conn = self.client.get_async_connection().await.map_err(EngineError::from)?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await.map_err(EngineError::from)?;
        Ok(pubsub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_key_format() {
        assert_eq!(
            bucket_key("crypto", "binance", "BTC/USDT", 3_600_000),
            "bars1m:crypto:binance:BTC/USDT:3600000"
        );
    }

    #[test]
    fn resample_key_format_with_missing_bounds() {
        assert_eq!(
            resample_key("crypto", "binance", "BTC/USDT", "5m", None, None, Some(100)),
            "res:crypto:binance:BTC/USDT:5m:::100"
        );
    }

    #[test]
    fn channel_name_format() {
        assert_eq!(
            channel_name("crypto", "binance", "BTC/USDT", "ohlcv_1m"),
            "feed:crypto:binance:BTC/USDT:ohlcv_1m"
        );
    }

    #[test]
    fn bars_wire_round_trips_nan_inf() {
        let bars = vec![Bar {
            ts_ms: 0,
            open: f64::NAN,
            high: f64::INFINITY,
            low: f64::NEG_INFINITY,
            close: 1.0,
            volume: 0.0,
        }];
        let json = serde_json::to_string(&BarsWire(bars.clone())).unwrap();
        let BarsWire(back) = serde_json::from_str(&json).unwrap();
        assert!(back[0].open.is_nan());
        assert_eq!(back[0].high, f64::INFINITY);
        assert_eq!(back[0].low, f64::NEG_INFINITY);
    }
}
