//! Plugin contract & registry (§4.4).
//!
//! A plugin is a small capability trait rather than a deep class hierarchy, per §9's design
//! note — composition of a retry wrapper, HTTP client, rate limiter, not inheritance. Grounded
//! on the per-provider scraper modules (`dome_rest.rs`, `polymarket_ws.rs`), each of which
//! already is, informally, exactly one such connector.

pub mod registry;
pub mod rest_connector;
pub mod ws_connector;

use crate::bar::Bar;
use crate::error::EngineError;
use async_trait::async_trait;
use std::time::Duration;

pub use registry::Registry;

/// Credentials resolved by the external credential-lookup callback (§1).
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub secret: Option<String>,
    pub aux: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Ohlcv1m,
    Trades,
    Book,
    UserOrders,
}

impl StreamType {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamType::Ohlcv1m => "ohlcv_1m",
            StreamType::Trades => "trades",
            StreamType::Book => "book",
            StreamType::UserOrders => "user_orders",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentDetails {
    pub precision: u32,
    pub min_qty: f64,
    pub max_qty: Option<f64>,
}

/// A single streamed payload, already normalized enough to be republished on the cache bus.
#[derive(Debug, Clone)]
pub struct StreamPayload {
    pub stream_type: StreamType,
    pub bar: Option<Bar>,
    pub closed: bool,
}

/// The uniform connector interface every provider family implements (§4.4).
#[async_trait]
pub trait Plugin: Send + Sync {
    fn plugin_key(&self) -> &'static str;
    fn supported_markets(&self) -> Vec<&'static str>;
    fn list_configurable_providers(&self) -> Vec<&'static str>;

    /// Releases underlying connections. Called by the registry on eviction or shutdown.
    async fn close(&self);

    async fn get_symbols(&self, market: &str) -> Result<Vec<String>, EngineError>;
    async fn get_instrument_details(&self, symbol: &str) -> Result<InstrumentDetails, EngineError>;

    /// Up to the plugin's own per-call max (e.g. 500-1000 bars); the caller pages.
    async fn fetch_historical_1m(
        &self,
        symbol: &str,
        since_ms: i64,
        limit: u32,
    ) -> Result<Vec<Bar>, EngineError>;

    fn supports_native_push(&self, stream_type: StreamType) -> bool;

    /// Starts a native-push feed. Only called when [`Plugin::supports_native_push`] is true.
    /// The returned receiver yields normalized payloads until the connector is dropped or the
    /// plugin's own connection fails, whichever happens first.
    async fn watch(
        &self,
        symbol: &str,
        stream_type: StreamType,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamPayload>, EngineError>;

    /// Per-call timeout budget; the registry/orchestrator apply this uniformly so individual
    /// connectors don't each need their own deadline plumbing.
    fn call_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}

/// Maps `(plugin_key, provider_id)` to errors with retry-after hints, used by connectors that
/// receive an HTTP 429 with a `Retry-After` header.
pub fn rate_limited(retry_after: Duration) -> EngineError {
    EngineError::PluginRateLimited {
        retry_after_ms: retry_after.as_millis() as u64,
    }
}

/// Maps an arbitrary `reqwest` response into the closed taxonomy (§4.4): anything not already a
/// named case becomes `PluginInternalError`.
pub fn classify_http_status(status: reqwest::StatusCode, body: &str) -> EngineError {
    match status.as_u16() {
        401 | 403 => EngineError::PluginAuthError(body.to_string()),
        404 => EngineError::PluginBadSymbol(body.to_string()),
        429 => EngineError::PluginRateLimited { retry_after_ms: 1_000 },
        501 => EngineError::PluginFeatureUnsupported(body.to_string()),
        s if (500..600).contains(&s) => EngineError::PluginNetworkError(body.to_string()),
        _ => EngineError::PluginInternalError(format!("status {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_statuses() {
        assert!(matches!(
            classify_http_status(reqwest::StatusCode::UNAUTHORIZED, ""),
            EngineError::PluginAuthError(_)
        ));
        assert!(matches!(
            classify_http_status(reqwest::StatusCode::NOT_FOUND, ""),
            EngineError::PluginBadSymbol(_)
        ));
        assert!(matches!(
            classify_http_status(reqwest::StatusCode::TOO_MANY_REQUESTS, ""),
            EngineError::PluginRateLimited { .. }
        ));
        assert!(matches!(
            classify_http_status(reqwest::StatusCode::IM_A_TEAPOT, ""),
            EngineError::PluginInternalError(_)
        ));
    }
}
