//! Backfill coordinator (§4.6): per-asset serialized gap detection and chunked historical fill.
//!
//! Grounded on `dome.rs`'s `execute_with_retry` (exponential backoff, base 1s, capped at 30s)
//! for the retry policy, and on `main.rs`'s `DataSourceKillSwitch` for the structured
//! state-transition logging style (`tracing` fields on every transition).

use crate::config::Config;
use crate::error::EngineError;
use crate::orchestrator::PluginProvider;
use crate::plugin::Credentials;
use crate::store::Store;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillState {
    Idle,
    Planning,
    Fetching,
    Throttled,
    Done,
    Failed,
}

pub struct Backfill {
    store: Arc<Store>,
    plugins: Arc<dyn PluginProvider>,
    config: Arc<Config>,
    asset_locks: SyncMutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
    api_semaphore: Arc<Semaphore>,
}

impl Backfill {
    pub fn new(store: Arc<Store>, plugins: Arc<dyn PluginProvider>, config: Arc<Config>) -> Self {
        let permits = config.max_concurrent_api;
        Self {
            store,
            plugins,
            config,
            asset_locks: SyncMutex::new(HashMap::new()),
            api_semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    fn asset_lock(&self, provider: &str, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.asset_locks.lock();
        locks
            .entry((provider.to_string(), symbol.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Runs one backfill pass for `(market, provider, symbol)`. Serialized per asset; concurrent
    /// calls for the same asset wait for the in-flight one rather than running twice.
    pub async fn run(
        &self,
        market: &str,
        provider: &str,
        symbol: &str,
        credentials: Option<Credentials>,
        now_ms: i64,
    ) -> BackfillState {
        let lock = self.asset_lock(provider, symbol);
        let _guard = lock.lock().await;

        info!(market, provider, symbol, state = ?BackfillState::Planning, "backfill transition");

        let target_oldest_ms = now_ms - self.config.default_backfill_period.as_millis() as i64;
        let gaps = match self.store.find_missing_1m_ranges(market, provider, symbol, target_oldest_ms, now_ms) {
            Ok(gaps) => gaps,
            Err(e) => {
                warn!(market, provider, symbol, error = %e, state = ?BackfillState::Failed, "backfill transition");
                return BackfillState::Failed;
            }
        };

        if gaps.is_empty() {
            info!(market, provider, symbol, state = ?BackfillState::Done, "backfill transition: nothing missing");
            return BackfillState::Done;
        }

        // Newest-first so recent history fills quickly (§4.6).
        let mut gaps = gaps;
        gaps.sort_by_key(|(_, end)| std::cmp::Reverse(*end));

        info!(market, provider, symbol, state = ?BackfillState::Fetching, gap_count = gaps.len(), "backfill transition");

        let plugin = match self.plugins.plugin_for(market, provider, credentials).await {
            Ok(p) => p,
            Err(e) => {
                warn!(market, provider, symbol, error = %e, state = ?BackfillState::Failed, "backfill transition");
                return BackfillState::Failed;
            }
        };

        let mut chunks_used = 0u32;
        for (gap_start, gap_end) in gaps {
            if chunks_used >= self.config.max_chunks_per_run {
                info!(
                    market, provider, symbol,
                    remaining_gap_start = gap_start, remaining_gap_end = gap_end,
                    "backfill bounded-work limit reached, deferring remainder to next trigger"
                );
                break;
            }

            let mut current_end = gap_end;
            loop {
                if chunks_used >= self.config.max_chunks_per_run || current_end < gap_start {
                    break;
                }

                let permit = match self.api_semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };

                let fetch_result = self
                    .fetch_chunk_with_retry(plugin.as_ref(), symbol, gap_start, current_end)
                    .await;
                chunks_used += 1;

                drop(permit);
                tokio::time::sleep(self.config.chunk_delay).await;

                match fetch_result {
                    Ok(bars) if bars.is_empty() => {
                        // Provider has no older data for this cursor; move on to the next gap.
                        break;
                    }
                    Ok(bars) => {
                        let filtered: Vec<_> = bars
                            .into_iter()
                            .filter(|b| b.ts_ms >= gap_start && b.ts_ms <= current_end)
                            .collect();
                        let oldest = filtered.iter().map(|b| b.ts_ms).min();
                        if let Err(e) = self.store.insert_1m(market, provider, symbol, &filtered) {
                            warn!(market, provider, symbol, error = %e, "backfill insert failed");
                        }
                        match oldest {
                            Some(oldest) if oldest > gap_start => current_end = oldest - 60_000,
                            _ => break,
                        }
                    }
                    Err(EngineError::PluginAuthError(reason)) => {
                        warn!(market, provider, symbol, reason, state = ?BackfillState::Failed, "backfill transition: aborting");
                        return BackfillState::Failed;
                    }
                    Err(e) => {
                        warn!(market, provider, symbol, error = %e, "backfill chunk failed after retries, skipping gap");
                        break;
                    }
                }
            }
        }

        info!(market, provider, symbol, state = ?BackfillState::Done, "backfill transition");
        BackfillState::Done
    }

    /// Retry policy (§4.6): `PluginRateLimited` obeys the retry-after hint; `PluginNetworkError`
    /// retries up to 3 times with exponential backoff (base 1s, cap 30s); `PluginAuthError`
    /// aborts immediately and is propagated to the caller.
    async fn fetch_chunk_with_retry(
        &self,
        plugin: &dyn crate::plugin::Plugin,
        symbol: &str,
        gap_start: i64,
        current_end: i64,
    ) -> Result<Vec<crate::bar::Bar>, EngineError> {
        const MAX_RETRIES: u32 = 3;
        const BASE_BACKOFF: Duration = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(30);

        let span = (current_end - gap_start).max(0) as u64 / 60_000 + 1;
        let limit = span.min(self.config.default_chunk_limit as u64) as u32;
        let cursor = (current_end - (limit as i64 - 1) * 60_000).max(gap_start);

        let mut backoff = BASE_BACKOFF;
        let mut attempt = 0u32;
        loop {
            match plugin.fetch_historical_1m(symbol, cursor, limit).await {
                Ok(bars) => return Ok(bars),
                Err(EngineError::PluginAuthError(reason)) => return Err(EngineError::PluginAuthError(reason)),
                Err(EngineError::PluginRateLimited { retry_after_ms }) => {
                    info!(symbol, retry_after_ms, state = ?BackfillState::Throttled, "backfill transition");
                    tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                    attempt += 1;
                    if attempt > MAX_RETRIES {
                        return Err(EngineError::PluginRateLimited { retry_after_ms });
                    }
                    info!(symbol, state = ?BackfillState::Fetching, "backfill transition: resuming after throttle");
                }
                Err(EngineError::PluginNetworkError(reason)) => {
                    attempt += 1;
                    if attempt > MAX_RETRIES {
                        return Err(EngineError::PluginNetworkError(reason));
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
