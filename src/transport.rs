//! Thin reference transport (ambient, stands in for the "out of scope" HTTP/WebSocket framing
//! layer per spec.md §1): an `axum` `/ws` route wiring one client connection to the subscription
//! service, plus a `/health` route.
//!
//! Grounded directly on `websocket_handler`/`handle_socket` in `main.rs`: the same
//! `WebSocketUpgrade` + `on_upgrade` shape, the same `tokio::select!` over an outbound channel
//! and the client's inbound stream. Generalized from one global broadcast channel to the
//! subscription service's per-client bounded queue (§4.8), and from a bare ping/pong echo to the
//! §6 heartbeat-with-missed-pong-disconnect rule.

use crate::config::Config;
use crate::error::EngineError;
use crate::identity::{CredentialLookup, UserIdentity};
use crate::orchestrator::Orchestrator;
use crate::plugin::StreamType;
use crate::streaming::StreamingManager;
use crate::subscription::{ClientHandle, SubscriptionService};
use crate::wire::{error_frame, parse_client_frame, ClientFrame, PING_FRAME};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
    routing::get,
    Router,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub streaming: Arc<StreamingManager>,
    pub subscriptions: Arc<SubscriptionService>,
    pub credential_lookup: Arc<dyn CredentialLookup>,
    pub config: Arc<Config>,
}

/// Builds the reference transport's router: `/ws` for the client protocol, `/health` for
/// liveness, with request logging and rate limiting layered on top (the `middleware` module's
/// established convention).
pub fn router(state: AppState) -> Router {
    let rate_limiter = crate::middleware::RateLimitLayer::new(crate::middleware::RateLimitConfig::default());
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .layer(axum::middleware::from_fn(crate::middleware::request_logging_simple))
        .layer(axum::middleware::from_fn_with_state(
            rate_limiter,
            crate::middleware::rate_limit::rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Drives one client connection: subscribe/unsubscribe frame handling, outbound forwarding from
/// the subscription service's per-client queue, and the §6 heartbeat.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (client, mut outbound_rx, kill) = ClientHandle::new(state.config.client_queue_capacity);
    // The real identity/credential boundary lives outside this crate (spec.md §1); the reference
    // transport treats every connection as the anonymous public-data user.
    let user = UserIdentity {
        user_id: "anonymous".to_string(),
    };

    let mut active: HashSet<(String, String, String, String, StreamType)> = HashSet::new();
    let mut ping_ticker = tokio::time::interval(Duration::from_secs(30));
    let mut unanswered_pings = 0u32;

    loop {
        tokio::select! {
            _ = kill.notified() => {
                break;
            }
            _ = ping_ticker.tick() => {
                if unanswered_pings >= 2 {
                    warn!(client_id = %client.id, "client missed 2 heartbeats, closing");
                    break;
                }
                unanswered_pings += 1;
                if socket.send(Message::Text(PING_FRAME.to_string())).await.is_err() {
                    break;
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(frame) = outbound else { break };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if handle_pong(&text) {
                            unanswered_pings = 0;
                            continue;
                        }
                        handle_inbound_frame(&text, &state, &client, &user, &mut active).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    for (market, provider, symbol, timeframe, stream_type) in active {
        if let Ok(tf) = crate::timeframe::Timeframe::parse(&timeframe) {
            let key = crate::bar::SubscriptionKey::new(market, provider, symbol, tf);
            state.subscriptions.unsubscribe(client.id, &key, stream_type).await;
        }
    }
    info!(client_id = %client.id, "client disconnected");
}

fn handle_pong(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str().map(str::to_string)))
        .map(|t| t == "pong")
        .unwrap_or(false)
}

async fn handle_inbound_frame(
    text: &str,
    state: &AppState,
    client: &ClientHandle,
    user: &UserIdentity,
    active: &mut HashSet<(String, String, String, String, StreamType)>,
) {
    let frame = match parse_client_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            send_err(client, &e);
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe {
            market,
            provider,
            symbol,
            timeframe,
            stream,
            since_ms,
        } => {
            let resolved = state.credential_lookup.lookup(user, &provider).await;
            let credentials = resolved.map(|r| r.credentials);
            active.insert((market.clone(), provider.clone(), symbol.clone(), timeframe.to_string(), stream));
            state
                .subscriptions
                .subscribe(client, market, provider, symbol, timeframe, stream, since_ms, credentials, now_ms())
                .await;
        }
        ClientFrame::Unsubscribe {
            market,
            provider,
            symbol,
            timeframe,
            stream,
        } => {
            active.remove(&(market.clone(), provider.clone(), symbol.clone(), timeframe.to_string(), stream));
            let key = crate::bar::SubscriptionKey::new(market, provider, symbol, timeframe);
            state.subscriptions.unsubscribe(client.id, &key, stream).await;
        }
    }
}

fn send_err(client: &ClientHandle, err: &EngineError) {
    let _ = client.try_send(error_frame(err));
}
