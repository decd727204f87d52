//! A reference native-push WebSocket plugin connector.
//!
//! Grounded directly on `polymarket_ws.rs`'s `PolymarketMarketWsCache`: a command channel for
//! on-demand subscription requests, a `run()` supervisor loop with exponential reconnect
//! backoff (1s doubling, capped at 30s), and a `connect_and_stream` inner loop using
//! `tokio::select!` over a ping interval, inbound commands, and inbound WS frames.

use crate::bar::Bar;
use crate::error::EngineError;
use crate::plugin::{Credentials, InstrumentDetails, Plugin, StreamPayload, StreamType};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct WsBarMsg {
    #[serde(rename = "event_type")]
    event_type: String,
    symbol: String,
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
    #[serde(default)]
    closed: bool,
}

pub struct WsConnector {
    ws_url: String,
    provider_id: String,
}

impl WsConnector {
    pub fn new(ws_url: impl Into<String>, provider_id: impl Into<String>, _credentials: Option<Credentials>) -> Self {
        Self {
            ws_url: ws_url.into(),
            provider_id: provider_id.into(),
        }
    }

    async fn run(ws_url: String, symbol: String, tx: mpsc::Sender<StreamPayload>) {
        let mut reconnect_delay = Duration::from_secs(1);
        let max_reconnect_delay = Duration::from_secs(30);

        loop {
            if tx.is_closed() {
                return;
            }
            match Self::connect_and_stream(&ws_url, &symbol, &tx).await {
                Ok(()) => reconnect_delay = Duration::from_secs(1),
                Err(e) => {
                    warn!(error = %e, symbol, "native push ws disconnected; reconnecting");
                    sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
                }
            }
        }
    }

    async fn connect_and_stream(
        ws_url: &str,
        symbol: &str,
        tx: &mpsc::Sender<StreamPayload>,
    ) -> Result<(), EngineError> {
        let (ws_stream, _resp) = connect_async(ws_url)
            .await
            .map_err(|e| EngineError::PluginNetworkError(format!("connect_async: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let sub_msg = serde_json::json!({ "type": "subscribe", "symbol": symbol });
        write
            .send(Message::Text(sub_msg.to_string()))
            .await
            .map_err(|e| EngineError::PluginNetworkError(format!("send subscribe: {e}")))?;

        let mut ping = tokio::time::interval(Duration::from_secs(5));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        return Err(EngineError::PluginNetworkError("ping send failed".into()));
                    }
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Err(EngineError::PluginNetworkError("stream ended".into()));
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => {
                            if let Some(payload) = parse_bar_message(&text, symbol) {
                                if tx.send(payload).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "ws close");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => return Err(EngineError::PluginNetworkError(format!("ws error: {e}"))),
                    }
                }
            }
        }
    }
}

fn parse_bar_message(text: &str, symbol: &str) -> Option<StreamPayload> {
    let msg: WsBarMsg = serde_json::from_str(text).ok()?;
    if msg.event_type != "bar" || msg.symbol != symbol {
        return None;
    }
    Some(StreamPayload {
        stream_type: StreamType::Ohlcv1m,
        bar: Some(Bar {
            ts_ms: msg.ts_ms,
            open: msg.open,
            high: msg.high,
            low: msg.low,
            close: msg.close,
            volume: msg.volume,
        }),
        closed: msg.closed,
    })
}

#[async_trait]
impl Plugin for WsConnector {
    fn plugin_key(&self) -> &'static str {
        "ws_native_push"
    }

    fn supported_markets(&self) -> Vec<&'static str> {
        vec!["crypto"]
    }

    fn list_configurable_providers(&self) -> Vec<&'static str> {
        vec!["binance"]
    }

    async fn close(&self) {}

    async fn get_symbols(&self, _market: &str) -> Result<Vec<String>, EngineError> {
        Err(EngineError::PluginFeatureUnsupported(
            "reference data not implemented on the streaming connector".into(),
        ))
    }

    async fn get_instrument_details(&self, _symbol: &str) -> Result<InstrumentDetails, EngineError> {
        Err(EngineError::PluginFeatureUnsupported(
            "reference data not implemented on the streaming connector".into(),
        ))
    }

    async fn fetch_historical_1m(
        &self,
        _symbol: &str,
        _since_ms: i64,
        _limit: u32,
    ) -> Result<Vec<Bar>, EngineError> {
        Err(EngineError::PluginFeatureUnsupported(format!(
            "{} is push-only, no historical fetch",
            self.provider_id
        )))
    }

    fn supports_native_push(&self, stream_type: StreamType) -> bool {
        matches!(stream_type, StreamType::Ohlcv1m)
    }

    async fn watch(
        &self,
        symbol: &str,
        stream_type: StreamType,
    ) -> Result<mpsc::Receiver<StreamPayload>, EngineError> {
        if !self.supports_native_push(stream_type) {
            return Err(EngineError::PluginFeatureUnsupported(format!(
                "{:?} has no native push",
                stream_type
            )));
        }
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(Self::run(self.ws_url.clone(), symbol.to_string(), tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bar_message() {
        let text = r#"{"event_type":"bar","symbol":"BTC/USDT","t":0,"o":1.0,"h":2.0,"l":0.5,"c":1.5,"v":10.0,"closed":true}"#;
        let payload = parse_bar_message(text, "BTC/USDT").unwrap();
        assert!(payload.closed);
        assert_eq!(payload.bar.unwrap().close, 1.5);
    }

    #[test]
    fn ignores_messages_for_other_symbols() {
        let text = r#"{"event_type":"bar","symbol":"ETH/USDT","t":0,"o":1.0,"h":2.0,"l":0.5,"c":1.5,"v":10.0}"#;
        assert!(parse_bar_message(text, "BTC/USDT").is_none());
    }

    #[test]
    fn ignores_non_bar_events() {
        let text = r#"{"event_type":"ping","symbol":"BTC/USDT","t":0,"o":0.0,"h":0.0,"l":0.0,"c":0.0,"v":0.0}"#;
        assert!(parse_bar_message(text, "BTC/USDT").is_none());
    }
}
