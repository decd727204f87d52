//! A reference REST-polling plugin connector.
//!
//! Grounded on `dome_rest.rs`'s `DomeRestClient`: a `reqwest::Client` built once with
//! connect/pool tuning, a query-param-builder (`Vec<(String, String)>`) per request, and a
//! uniform `status().is_success()` check before parsing JSON. `get_candlesticks_raw` there is
//! the direct ancestor of `fetch_historical_1m` here.

use crate::bar::Bar;
use crate::error::EngineError;
use crate::plugin::{classify_http_status, rate_limited, Credentials, InstrumentDetails, Plugin, StreamType};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct CandleRow {
    #[serde(rename = "t")]
    ts_ms: i64,
    #[serde(rename = "o")]
    open: f64,
    #[serde(rename = "h")]
    high: f64,
    #[serde(rename = "l")]
    low: f64,
    #[serde(rename = "c")]
    close: f64,
    #[serde(rename = "v")]
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    candles: Vec<CandleRow>,
}

/// A REST-polling connector for a provider exposing a plain candlestick endpoint. One instance
/// per `InstanceCacheKey`, constructed by the registry.
pub struct RestConnector {
    client: Client,
    base_url: String,
    provider_id: String,
}

impl RestConnector {
    pub fn new(base_url: impl Into<String>, provider_id: impl Into<String>, credentials: Option<Credentials>) -> Result<Self, EngineError> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60));

        if let Some(creds) = credentials.as_ref().and_then(|c| c.api_key.as_ref()) {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = format!("Bearer {creds}")
                .parse()
                .map_err(|_| EngineError::PluginAuthError("invalid api key material".into()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        let client = builder
            .build()
            .map_err(|e| EngineError::PluginInternalError(format!("build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            provider_id: provider_id.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Plugin for RestConnector {
    fn plugin_key(&self) -> &'static str {
        "rest_candles"
    }

    fn supported_markets(&self) -> Vec<&'static str> {
        vec!["crypto"]
    }

    fn list_configurable_providers(&self) -> Vec<&'static str> {
        vec!["kraken", "coinbase"]
    }

    async fn close(&self) {}

    async fn get_symbols(&self, _market: &str) -> Result<Vec<String>, EngineError> {
        let url = self.url("/symbols");
        let resp = self.client.get(url).send().await.map_err(EngineError::from)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_http_status(status, &body));
        }
        #[derive(Deserialize)]
        struct Resp {
            symbols: Vec<String>,
        }
        let parsed: Resp = resp.json().await.map_err(EngineError::from)?;
        Ok(parsed.symbols)
    }

    async fn get_instrument_details(&self, symbol: &str) -> Result<InstrumentDetails, EngineError> {
        let url = self.url("/instrument");
        let resp = self
            .client
            .get(url)
            .query(&[("symbol", symbol)])
            .send()
            .await
            .map_err(EngineError::from)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_http_status(status, &body));
        }
        #[derive(Deserialize)]
        struct Resp {
            precision: u32,
            min_qty: f64,
            max_qty: Option<f64>,
        }
        let parsed: Resp = resp.json().await.map_err(EngineError::from)?;
        Ok(InstrumentDetails {
            precision: parsed.precision,
            min_qty: parsed.min_qty,
            max_qty: parsed.max_qty,
        })
    }

    async fn fetch_historical_1m(
        &self,
        symbol: &str,
        since_ms: i64,
        limit: u32,
    ) -> Result<Vec<Bar>, EngineError> {
        let url = self.url("/candles");
        let mut qp: Vec<(String, String)> = Vec::with_capacity(4);
        qp.push(("symbol".to_string(), symbol.to_string()));
        qp.push(("since".to_string(), since_ms.to_string()));
        qp.push(("interval".to_string(), "1m".to_string()));
        qp.push(("limit".to_string(), limit.to_string()));

        let resp = self
            .client
            .get(url)
            .query(&qp)
            .send()
            .await
            .map_err(EngineError::from)?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(1));
            return Err(rate_limited(retry_after));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_http_status(status, &body));
        }

        let parsed: CandlesResponse = resp.json().await.map_err(EngineError::from)?;
        Ok(parsed
            .candles
            .into_iter()
            .map(|r| Bar {
                ts_ms: r.ts_ms,
                open: r.open,
                high: r.high,
                low: r.low,
                close: r.close,
                volume: r.volume,
            })
            .collect())
    }

    fn supports_native_push(&self, _stream_type: StreamType) -> bool {
        false
    }

    async fn watch(
        &self,
        _symbol: &str,
        _stream_type: StreamType,
    ) -> Result<tokio::sync::mpsc::Receiver<crate::plugin::StreamPayload>, EngineError> {
        Err(EngineError::PluginFeatureUnsupported(format!(
            "{} does not support native push",
            self.provider_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_and_path() {
        let connector = RestConnector::new("https://api.example.com", "kraken", None).unwrap();
        assert_eq!(connector.url("/candles"), "https://api.example.com/candles");
    }
}
