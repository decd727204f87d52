//! Engine configuration, loaded from the environment the way `models::Config::from_env` does:
//! `dotenv` first, then `std::env::var(...).unwrap_or_else(default).parse().unwrap_or(default)`
//! per field, so a malformed value degrades to the documented default rather than panicking.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the reference transport, e.g. `0.0.0.0:8080`.
    pub bind_addr: String,
    /// SQLite path for the persistent 1m bar store.
    pub database_path: String,
    /// Redis connection URL backing the cache + pub/sub bus.
    pub redis_url: String,

    pub idle_ttl: Duration,
    pub idle_sweep_interval: Duration,
    pub eviction_grace: Duration,

    pub default_backfill_period: Duration,
    pub max_chunks_per_run: u32,
    pub chunk_delay: Duration,
    pub max_concurrent_api: usize,

    pub cache_ttl_1m_recent: Duration,
    pub cache_ttl_resample_1m: Duration,
    pub cache_ttl_resample_1h: Duration,
    pub cache_ttl_resample_1d: Duration,

    pub poll_ohlcv_sec: u64,
    pub poll_trades_sec: u64,
    pub poll_book_sec: u64,
    pub poll_user_orders_sec: u64,

    pub stream_grace: Duration,
    pub max_restart_attempts: u32,
    pub client_queue_capacity: usize,

    pub plugin_call_timeout: Duration,
    pub client_send_timeout: Duration,

    /// Aggregate-staleness window used by the orchestrator's "recent enough" heuristic (§4.5
    /// stage 3): only fall through to 1m-store+resample when the newest requested bar is within
    /// this window of now, or the aggregate stage returned nothing.
    pub aggregate_staleness_window: Duration,

    /// Batch size for `insert_1m` upserts (§4.2).
    pub insert_batch_size: usize,
    /// Per-call page size used by the orchestrator's plugin paging loop and backfill's chunked
    /// fetch when the plugin doesn't advertise a smaller limit.
    pub default_chunk_limit: u32,
    /// Max pages per orchestrator plugin-fetch call (§4.5 stage 4).
    pub max_pages_per_fetch: u32,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parsed(key, default_secs))
}

fn env_millis(key: &str, default_millis: u64) -> Duration {
    Duration::from_millis(env_parsed(key, default_millis))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            bind_addr: env_string("BIND_ADDR", "0.0.0.0:8080"),
            database_path: env_string("DATABASE_PATH", "./barstream.db"),
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),

            idle_ttl: env_secs("IDLE_TTL_SECS", 15 * 60),
            idle_sweep_interval: env_secs("IDLE_SWEEP_INTERVAL_SECS", 5 * 60),
            eviction_grace: env_secs("EVICTION_GRACE_SECS", 10),

            default_backfill_period: env_secs("DEFAULT_BACKFILL_PERIOD_SECS", 30 * 86_400),
            max_chunks_per_run: env_parsed("MAX_CHUNKS_PER_RUN", 100),
            chunk_delay: env_millis("CHUNK_DELAY_MS", 1_500),
            max_concurrent_api: env_parsed("MAX_CONCURRENT_API", 10),

            cache_ttl_1m_recent: env_secs("CACHE_TTL_1M_RECENT_SECS", 24 * 3_600),
            cache_ttl_resample_1m: env_secs("CACHE_TTL_RESAMPLE_1M_SECS", 60),
            cache_ttl_resample_1h: env_secs("CACHE_TTL_RESAMPLE_1H_SECS", 300),
            cache_ttl_resample_1d: env_secs("CACHE_TTL_RESAMPLE_1D_SECS", 3_600),

            poll_ohlcv_sec: env_parsed("POLL_OHLCV_SEC", 60),
            poll_trades_sec: env_parsed("POLL_TRADES_SEC", 5),
            poll_book_sec: env_parsed("POLL_BOOK_SEC", 2),
            poll_user_orders_sec: env_parsed("POLL_USER_ORDERS_SEC", 15),

            stream_grace: env_secs("STREAM_GRACE_SECS", 30),
            max_restart_attempts: env_parsed("MAX_RESTART_ATTEMPTS", 10),
            client_queue_capacity: env_parsed("CLIENT_QUEUE_CAPACITY", 1024),

            plugin_call_timeout: env_secs("PLUGIN_CALL_TIMEOUT_SECS", 30),
            client_send_timeout: env_secs("CLIENT_SEND_TIMEOUT_SECS", 5),

            aggregate_staleness_window: env_secs("AGGREGATE_STALENESS_WINDOW_SECS", 2 * 3_600),

            insert_batch_size: env_parsed("INSERT_BATCH_SIZE", 1_000),
            default_chunk_limit: env_parsed("DEFAULT_CHUNK_LIMIT", 1_000),
            max_pages_per_fetch: env_parsed("MAX_PAGES_PER_FETCH", 20),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_env_value_falls_back_to_default() {
        std::env::set_var("MAX_CHUNKS_PER_RUN", "not-a-number");
        let n: u32 = env_parsed("MAX_CHUNKS_PER_RUN", 100);
        assert_eq!(n, 100);
        std::env::remove_var("MAX_CHUNKS_PER_RUN");
    }

    #[test]
    fn defaults_match_spec() {
        std::env::remove_var("IDLE_TTL_SECS");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.idle_ttl, Duration::from_secs(900));
        assert_eq!(cfg.eviction_grace, Duration::from_secs(10));
        assert_eq!(cfg.client_queue_capacity, 1024);
        assert_eq!(cfg.max_restart_attempts, 10);
    }
}
