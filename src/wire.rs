//! Client wire protocol (§6): JSON frames over the bidirectional transport.
//!
//! Grounded on `handle_socket` (parses an untyped `serde_json::Value` looking for a `"type"`
//! tag, replies with hand-built `serde_json::json!` frames) — the same untyped-frame style,
//! generalized to the subscribe/unsubscribe/data/update/error/ping vocabulary §6 names.

use crate::bar::Bar;
use crate::error::EngineError;
use crate::plugin::StreamType;
use crate::timeframe::Timeframe;
use serde::Deserialize;
use serde_json::json;

/// A parsed client -> server frame.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Subscribe {
        market: String,
        provider: String,
        symbol: String,
        timeframe: Timeframe,
        stream: StreamType,
        since_ms: Option<i64>,
    },
    Unsubscribe {
        market: String,
        provider: String,
        symbol: String,
        timeframe: Timeframe,
        stream: StreamType,
    },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    frame_type: String,
    market: Option<String>,
    provider: Option<String>,
    symbol: Option<String>,
    timeframe: Option<String>,
    stream: Option<String>,
    since: Option<i64>,
}

fn parse_stream_type(s: &str) -> Result<StreamType, EngineError> {
    match s {
        "ohlcv" | "ohlcv_1m" => Ok(StreamType::Ohlcv1m),
        "trades" => Ok(StreamType::Trades),
        "book" => Ok(StreamType::Book),
        "user_orders" => Ok(StreamType::UserOrders),
        other => Err(EngineError::PluginFeatureUnsupported(format!(
            "unknown stream type: {other}"
        ))),
    }
}

/// Parses one inbound client frame (§6: `subscribe`/`unsubscribe`).
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, EngineError> {
    let raw: RawFrame = serde_json::from_str(text)
        .map_err(|e| EngineError::InvalidSymbol(format!("malformed frame: {e}")))?;

    let require = |field: Option<String>, name: &str| -> Result<String, EngineError> {
        field.ok_or_else(|| EngineError::InvalidSymbol(format!("missing field: {name}")))
    };

    match raw.frame_type.as_str() {
        "subscribe" => Ok(ClientFrame::Subscribe {
            market: require(raw.market, "market")?,
            provider: require(raw.provider, "provider")?,
            symbol: require(raw.symbol, "symbol")?,
            timeframe: Timeframe::parse(&require(raw.timeframe, "timeframe")?)?,
            stream: parse_stream_type(&require(raw.stream, "stream")?)?,
            since_ms: raw.since,
        }),
        "unsubscribe" => Ok(ClientFrame::Unsubscribe {
            market: require(raw.market, "market")?,
            provider: require(raw.provider, "provider")?,
            symbol: require(raw.symbol, "symbol")?,
            timeframe: Timeframe::parse(&require(raw.timeframe, "timeframe")?)?,
            stream: parse_stream_type(&require(raw.stream, "stream")?)?,
        }),
        other => Err(EngineError::InvalidSymbol(format!("unknown frame type: {other}"))),
    }
}

/// `{"type":"status","payload":"<text>"}` (§6).
pub fn status_frame(text: &str) -> String {
    json!({ "type": "status", "payload": text }).to_string()
}

/// `{"type":"data","payload":{"ohlc":[...],"volume":[...],"initial_batch":true}}` (§6).
pub fn data_frame(bars: &[Bar], initial_batch: bool) -> String {
    let ohlc: Vec<_> = bars
        .iter()
        .map(|b| json!([b.ts_ms, b.open, b.high, b.low, b.close]))
        .collect();
    let volume: Vec<_> = bars.iter().map(|b| json!([b.ts_ms, b.volume])).collect();
    json!({
        "type": "data",
        "payload": {
            "ohlc": ohlc,
            "volume": volume,
            "initial_batch": initial_batch,
        }
    })
    .to_string()
}

/// `{"type":"error","code":"<taxonomy>","message":"<text>"}` (§6). No stack traces over the
/// wire (§7).
pub fn error_frame(err: &EngineError) -> String {
    json!({ "type": "error", "code": err.code(), "message": err.to_string() }).to_string()
}

/// `{"type":"ping"}` heartbeat (§6).
pub const PING_FRAME: &str = r#"{"type":"ping"}"#;

/// Extracts the leading bar timestamp from an `update`/`data` frame already on the wire, used by
/// the subscription service to track `last_forwarded_ts` without re-deserializing into [`Bar`].
pub fn leading_ts_ms(frame_json: &str) -> Option<i64> {
    let value: serde_json::Value = serde_json::from_str(frame_json).ok()?;
    value
        .get("payload")?
        .get("ohlc")?
        .as_array()?
        .first()?
        .as_array()?
        .first()?
        .as_i64()
}
