//! Closed error taxonomy (§7), wired through `thiserror` the way `borsaorg-borsa` models its
//! `BorsaError` enum — a fixed, named set of variants the rest of the engine matches on rather
//! than opaque `anyhow::Error` chains.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "code", content = "message")]
pub enum EngineError {
    #[error("invalid timeframe: {0}")]
    InvalidTimeframe(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("plugin auth error: {0}")]
    PluginAuthError(String),

    #[error("plugin network error: {0}")]
    PluginNetworkError(String),

    #[error("plugin rate limited, retry after {retry_after_ms}ms")]
    PluginRateLimited { retry_after_ms: u64 },

    #[error("plugin feature unsupported: {0}")]
    PluginFeatureUnsupported(String),

    #[error("plugin bad symbol: {0}")]
    PluginBadSymbol(String),

    #[error("plugin internal error: {0}")]
    PluginInternalError(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store corrupt: {0}")]
    StoreCorrupt(String),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("client overflow")]
    ClientOverflow,

    #[error("feed dead: {0}")]
    FeedDead(String),

    #[error("shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Taxonomy code as sent over the wire in `{"type":"error","code":...}` frames (§6).
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidTimeframe(_) => "InvalidTimeframe",
            EngineError::InvalidSymbol(_) => "InvalidSymbol",
            EngineError::PluginAuthError(_) => "PluginAuthError",
            EngineError::PluginNetworkError(_) => "PluginNetworkError",
            EngineError::PluginRateLimited { .. } => "PluginRateLimited",
            EngineError::PluginFeatureUnsupported(_) => "PluginFeatureUnsupported",
            EngineError::PluginBadSymbol(_) => "PluginBadSymbol",
            EngineError::PluginInternalError(_) => "PluginInternalError",
            EngineError::StoreUnavailable(_) => "StoreUnavailable",
            EngineError::StoreCorrupt(_) => "StoreCorrupt",
            EngineError::CacheUnavailable(_) => "CacheUnavailable",
            EngineError::ClientOverflow => "ClientOverflow",
            EngineError::FeedDead(_) => "FeedDead",
            EngineError::ShuttingDown => "ShuttingDown",
        }
    }

    /// Transient plugin errors are retried by callers with backoff; persistent ones surface
    /// immediately and disable the code path for the client view (§7).
    pub fn is_transient_plugin_error(&self) -> bool {
        matches!(
            self,
            EngineError::PluginNetworkError(_) | EngineError::PluginRateLimited { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::StoreCorrupt(_) | EngineError::ShuttingDown)
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::Error as E;
        match &e {
            E::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                EngineError::StoreUnavailable(e.to_string())
            }
            _ => EngineError::StoreCorrupt(e.to_string()),
        }
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::CacheUnavailable(e.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            EngineError::PluginNetworkError(e.to_string())
        } else {
            EngineError::PluginInternalError(e.to_string())
        }
    }
}
