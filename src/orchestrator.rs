//! Data orchestrator (§4.5): the layered fetch pipeline cache → aggregates → 1m store+resample →
//! plugin, with write-through and since/until/limit projection.
//!
//! Grounded on `borsaorg-borsa`'s `history.rs`: the staged-pipeline shape (each stage returns a
//! full or partial result the next stage may augment), the pipeline-order tie-break on merging
//! sources for the same timestamp (`collect_successes`/`order_results`), and the
//! partial-result-with-marker error handling (`merge_history_or_tag_connector_error`).

use crate::bar::Bar;
use crate::cache::Cache;
use crate::config::Config;
use crate::error::EngineError;
use crate::plugin::{Credentials, Plugin};
use crate::resample::resample;
use crate::store::{Store, Window};
use crate::timeframe::Timeframe;
use std::sync::Arc;
use tracing::warn;

/// Resolves a `(market, provider)` pair to a borrowed plugin instance, without exposing the
/// whole registry to the orchestrator (§9: "pass a narrow `PluginProvider` capability ... rather
/// than the whole registry object").
#[async_trait::async_trait]
pub trait PluginProvider: Send + Sync {
    async fn plugin_for(
        &self,
        market: &str,
        provider: &str,
        credentials: Option<Credentials>,
    ) -> Result<Arc<dyn Plugin>, EngineError>;
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub market: String,
    pub provider: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    pub limit: Option<u32>,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub bars: Vec<Bar>,
    pub partial: bool,
}

pub struct Orchestrator {
    store: Arc<Store>,
    cache: Arc<Cache>,
    plugins: Arc<dyn PluginProvider>,
    config: Arc<Config>,
}

impl Orchestrator {
    pub fn new(store: Arc<Store>, cache: Arc<Cache>, plugins: Arc<dyn PluginProvider>, config: Arc<Config>) -> Self {
        Self {
            store,
            cache,
            plugins,
            config,
        }
    }

    pub async fn fetch(&self, req: FetchRequest, now_ms: i64) -> Result<FetchResult, EngineError> {
        let since_ms = req.since_ms.unwrap_or(0);
        let until_ms = req.until_ms.unwrap_or(now_ms);

        if since_ms >= until_ms || req.limit == Some(0) {
            return Ok(FetchResult {
                bars: Vec::new(),
                partial: false,
            });
        }

        // Stage 1: cache.
        if req.timeframe.is_one_minute() {
            match self
                .cache
                .get_1m_bars(&req.market, &req.provider, &req.symbol, since_ms, until_ms)
                .await
            {
                Ok(bars) if !bars.is_empty() => {
                    return Ok(project(bars, req.since_ms, req.until_ms, req.limit));
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "1m cache read failed, falling through"),
            }
        } else {
            let key = crate::cache::resample_key(
                &req.market,
                &req.provider,
                &req.symbol,
                &req.timeframe.to_string(),
                req.since_ms,
                req.until_ms,
                req.limit,
            );
            match self.cache.get_resampled(&key).await {
                Ok(Some(bars)) => return Ok(project(bars, req.since_ms, req.until_ms, req.limit)),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "resample cache read failed, falling through"),
            }
        }

        let mut partial = false;
        let mut merged: Vec<Bar> = Vec::new();

        // Stage 2: materialized aggregates.
        let mut aggregate_hit = false;
        if !req.timeframe.is_one_minute() {
            let window = Window {
                since_ms: req.since_ms,
                until_ms: req.until_ms,
                limit: req.limit,
            };
            match self
                .store
                .fetch_aggregate(&req.market, &req.provider, &req.symbol, req.timeframe, window)
            {
                Ok(Some(bars)) if !bars.is_empty() => {
                    aggregate_hit = true;
                    let key = crate::cache::resample_key(
                        &req.market,
                        &req.provider,
                        &req.symbol,
                        &req.timeframe.to_string(),
                        req.since_ms,
                        req.until_ms,
                        req.limit,
                    );
                    if let Err(e) = self
                        .cache
                        .set_resampled(&key, &bars, self.resample_ttl(req.timeframe))
                        .await
                    {
                        warn!(error = %e, "resample cache write-through failed");
                    }
                    return Ok(project(bars, req.since_ms, req.until_ms, req.limit));
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "aggregate read failed, falling through"),
            }
        }

        // Stage 3: 1m store + resample, only when the window is "recent enough" or aggregates
        // returned nothing.
        let recent_enough = now_ms.saturating_sub(until_ms)
            <= self.config.aggregate_staleness_window.as_millis() as i64;
        if !req.timeframe.is_one_minute() && (recent_enough || !aggregate_hit) {
            let window = Window {
                since_ms: req.since_ms,
                until_ms: req.until_ms,
                limit: None,
            };
            match self.store.fetch_1m(&req.market, &req.provider, &req.symbol, window) {
                Ok(bars) if !bars.is_empty() => {
                    let resampled = resample(&bars, req.timeframe);
                    merged = merge_tiebreak(merged, resampled);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "1m store read failed, falling through to plugin"),
            }
        } else if req.timeframe.is_one_minute() {
            let window = Window {
                since_ms: req.since_ms,
                until_ms: req.until_ms,
                limit: req.limit,
            };
            match self.store.fetch_1m(&req.market, &req.provider, &req.symbol, window) {
                Ok(bars) if !bars.is_empty() => merged = merge_tiebreak(merged, bars),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "1m store read failed, falling through to plugin"),
            }
        }

        let covers_window = merged.iter().any(|b| b.ts_ms <= since_ms)
            && merged.iter().any(|b| b.ts_ms >= until_ms - req.timeframe.ms() as i64);

        if !covers_window {
            match self.fetch_from_plugin(&req, since_ms, until_ms).await {
                Ok(fetched_1m) => {
                    if !fetched_1m.is_empty() {
                        if let Err(e) = self.store.insert_1m(&req.market, &req.provider, &req.symbol, &fetched_1m) {
                            warn!(error = %e, "write-through to store failed");
                        }
                        if let Err(e) = self
                            .cache
                            .store_1m_bars(
                                &req.market,
                                &req.provider,
                                &req.symbol,
                                &fetched_1m,
                                self.config.cache_ttl_1m_recent,
                            )
                            .await
                        {
                            warn!(error = %e, "write-through to 1m cache failed");
                        }
                        let from_plugin = if req.timeframe.is_one_minute() {
                            fetched_1m
                        } else {
                            resample(&fetched_1m, req.timeframe)
                        };
                        merged = merge_tiebreak(merged, from_plugin);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "plugin fetch failed, returning partial result");
                    partial = true;
                }
            }
        }

        if !req.timeframe.is_one_minute() && !merged.is_empty() {
            let key = crate::cache::resample_key(
                &req.market,
                &req.provider,
                &req.symbol,
                &req.timeframe.to_string(),
                req.since_ms,
                req.until_ms,
                req.limit,
            );
            if let Err(e) = self
                .cache
                .set_resampled(&key, &merged, self.resample_ttl(req.timeframe))
                .await
            {
                warn!(error = %e, "resample cache write-through failed");
            }
        }

        let mut result = project(merged, req.since_ms, req.until_ms, req.limit);
        result.partial = result.partial || partial;
        Ok(result)
    }

    fn resample_ttl(&self, tf: Timeframe) -> std::time::Duration {
        if tf.is_one_minute() {
            self.config.cache_ttl_resample_1m
        } else if tf.ms() <= 3_600_000 {
            self.config.cache_ttl_resample_1m
        } else if tf.ms() <= 86_400_000 {
            self.config.cache_ttl_resample_1h
        } else {
            self.config.cache_ttl_resample_1d
        }
    }

    /// Paging loop per §4.5 stage 4: repeatedly calls `fetch_historical_1m` advancing the
    /// cursor to `last_bar.ts + 1ms`, bounded by `max_pages_per_fetch`.
    async fn fetch_from_plugin(
        &self,
        req: &FetchRequest,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<Vec<Bar>, EngineError> {
        let plugin = self
            .plugins
            .plugin_for(&req.market, &req.provider, req.credentials.clone())
            .await?;

        let mut cursor = since_ms;
        let mut out = Vec::new();
        for _ in 0..self.config.max_pages_per_fetch {
            if cursor >= until_ms {
                break;
            }
            let page = plugin
                .fetch_historical_1m(&req.symbol, cursor, self.config.default_chunk_limit)
                .await?;
            if page.is_empty() {
                break;
            }
            let last_ts = page.iter().map(|b| b.ts_ms).max().unwrap_or(cursor);
            out.extend(page.into_iter().filter(|b| b.ts_ms < until_ms));
            if last_ts < cursor {
                break;
            }
            cursor = last_ts + 1;
        }
        Ok(out)
    }
}

/// Merges two already-resampled/derived series keeping, for duplicate `ts_ms`, the bar from
/// `fresher` (pipeline order: Cache < Aggregate < 1m store < Plugin; later stages overwrite
/// earlier ones).
fn merge_tiebreak(older: Vec<Bar>, fresher: Vec<Bar>) -> Vec<Bar> {
    let mut by_ts: std::collections::BTreeMap<i64, Bar> = older.into_iter().map(|b| (b.ts_ms, b)).collect();
    for bar in fresher {
        by_ts.insert(bar.ts_ms, bar);
    }
    by_ts.into_values().collect()
}

/// Applies `since`/`until`/`limit` per §4.5 stage 6: `since` inclusive, `until` exclusive,
/// `limit` keeps the most recent bars when both bounds are unspecified, otherwise the first
/// `limit` bars after `since`.
fn project(mut bars: Vec<Bar>, since_ms: Option<i64>, until_ms: Option<i64>, limit: Option<u32>) -> FetchResult {
    bars.sort_by_key(|b| b.ts_ms);
    bars.dedup_by_key(|b| b.ts_ms);

    if let Some(since) = since_ms {
        bars.retain(|b| b.ts_ms >= since);
    }
    if let Some(until) = until_ms {
        bars.retain(|b| b.ts_ms < until);
    }

    if let Some(limit) = limit {
        let limit = limit as usize;
        if since_ms.is_none() && until_ms.is_none() {
            let start = bars.len().saturating_sub(limit);
            bars = bars.split_off(start);
        } else {
            bars.truncate(limit);
        }
    }

    FetchResult {
        bars,
        partial: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn project_since_inclusive_until_exclusive() {
        let bars = vec![bar(0), bar(60_000), bar(120_000)];
        let result = project(bars, Some(60_000), Some(120_000), None);
        assert_eq!(result.bars.len(), 1);
        assert_eq!(result.bars[0].ts_ms, 60_000);
    }

    #[test]
    fn project_limit_with_no_bounds_keeps_most_recent() {
        let bars: Vec<Bar> = (0..10).map(|i| bar(i * 60_000)).collect();
        let result = project(bars, None, None, Some(3));
        assert_eq!(result.bars.len(), 3);
        assert_eq!(result.bars[0].ts_ms, 7 * 60_000);
        assert_eq!(result.bars[2].ts_ms, 9 * 60_000);
    }

    #[test]
    fn project_since_equals_until_is_empty() {
        let bars = vec![bar(0), bar(60_000)];
        let result = project(bars, Some(60_000), Some(60_000), None);
        assert!(result.bars.is_empty());
    }

    #[test]
    fn merge_tiebreak_prefers_fresher_for_same_ts() {
        let older = vec![Bar {
            close: 1.0,
            ..bar(0)
        }];
        let fresher = vec![Bar {
            close: 99.0,
            ..bar(0)
        }];
        let merged = merge_tiebreak(older, fresher);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].close, 99.0);
    }
}
