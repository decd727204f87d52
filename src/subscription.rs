//! Subscription service (§4.8): maps client views onto the shared feeds the streaming manager
//! maintains, with per-client bounded outbound queues and FIFO forwarding.
//!
//! Grounded on `handle_socket`/`websocket_handler` (`tokio::select!` over a broadcast receiver
//! and the client's inbound stream, replaying recent state on connect) generalized from one
//! global broadcast channel to one bus subscription per
//! `(client, key, stream_type)` view, per spec.md §4.8 and §9 ("communication between feeds and
//! clients goes through the cache's pub/sub bus, never direct references").

use crate::backfill::Backfill;
use crate::bar::SubscriptionKey;
use crate::cache::Cache;
use crate::config::Config;
use crate::error::EngineError;
use crate::orchestrator::{FetchRequest, Orchestrator};
use crate::plugin::{Credentials, StreamType};
use crate::streaming::StreamingManager;
use crate::timeframe::Timeframe;
use crate::wire::{data_frame, error_frame, leading_ts_ms, status_frame};
use futures_util::StreamExt;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use uuid::Uuid;

/// A client's bounded outbound frame queue (§4.8 backpressure: default capacity 1024, FIFO,
/// overflow drops the slowest client).
#[derive(Clone)]
pub struct ClientHandle {
    pub id: Uuid,
    tx: mpsc::Sender<String>,
    kill: Arc<tokio::sync::Notify>,
}

impl ClientHandle {
    /// Creates a handle plus the receiving end the transport layer drains to the socket, and a
    /// kill signal the transport select!s on to know when to close the connection.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>, Arc<tokio::sync::Notify>) {
        let (tx, rx) = mpsc::channel(capacity);
        let kill = Arc::new(tokio::sync::Notify::new());
        (
            Self {
                id: Uuid::new_v4(),
                tx,
                kill: kill.clone(),
            },
            rx,
            kill,
        )
    }

    /// Best-effort enqueue. On a full queue, the client is flagged for closure and
    /// `ClientOverflow` is returned; the caller should stop forwarding to this client.
    pub(crate) fn try_send(&self, frame: String) -> Result<(), EngineError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id = %self.id, "client outbound queue overflow, closing connection");
                self.kill.notify_one();
                Err(EngineError::ClientOverflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::ShuttingDown),
        }
    }
}

struct View {
    last_forwarded_ts: Arc<AtomicI64>,
    cancel: Option<oneshot::Sender<()>>,
}

/// Registers `(client, SubscriptionKey, stream_type) -> view_state` (§4.8), dispatches initial
/// windows, and forwards bus updates per-view with `last_forwarded_ts` filtering.
pub struct SubscriptionService {
    orchestrator: Arc<Orchestrator>,
    streaming: Arc<StreamingManager>,
    backfill: Arc<Backfill>,
    cache: Arc<Cache>,
    config: Arc<Config>,
    views: SyncMutex<HashMap<(Uuid, SubscriptionKey, StreamType), View>>,
}

impl SubscriptionService {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        streaming: Arc<StreamingManager>,
        backfill: Arc<Backfill>,
        cache: Arc<Cache>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            orchestrator,
            streaming,
            backfill,
            cache,
            config,
            views: SyncMutex::new(HashMap::new()),
        }
    }

    /// Implements §4.8's `subscribe` steps 1-6: register the view, send a status frame, dispatch
    /// the initial window, ensure the feed is running, and spawn the per-view bus listener.
    pub async fn subscribe(
        &self,
        client: &ClientHandle,
        market: String,
        provider: String,
        symbol: String,
        timeframe: Timeframe,
        stream_type: StreamType,
        since_ms: Option<i64>,
        credentials: Option<Credentials>,
        now_ms: i64,
    ) {
        let key = SubscriptionKey::new(market, provider, symbol, timeframe);
        let view_key = (client.id, key.clone(), stream_type);

        // A resubscribe on an already-registered view replaces it cleanly rather than leaking
        // the old listener/feed refcount.
        self.unsubscribe(client.id, &key, stream_type).await;

        let _ = client.try_send(status_frame("initial data fetching"));

        let last_forwarded_ts = Arc::new(AtomicI64::new(since_ms.map(|s| s - 1).unwrap_or(-1)));

        if stream_type == StreamType::Ohlcv1m {
            // §4.6: subscribing to a key is one of the two backfill triggers (the other is
            // periodic maintenance, driven independently). Fire-and-forget: the initial window
            // below is served from whatever's already in the store/cache, not blocked on this.
            let backfill = self.backfill.clone();
            let (bf_market, bf_provider, bf_symbol, bf_credentials) =
                (key.market.clone(), key.provider.clone(), key.symbol.clone(), credentials.clone());
            tokio::spawn(async move {
                backfill.run(&bf_market, &bf_provider, &bf_symbol, bf_credentials, now_ms).await;
            });

            let req = FetchRequest {
                market: key.market.clone(),
                provider: key.provider.clone(),
                symbol: key.symbol.clone(),
                timeframe: key.timeframe,
                since_ms,
                until_ms: Some(now_ms),
                limit: None,
                credentials: credentials.clone(),
            };
            match self.orchestrator.fetch(req, now_ms).await {
                Ok(result) => {
                    if let Some(last) = result.bars.iter().map(|b| b.ts_ms).max() {
                        last_forwarded_ts.store(last, Ordering::SeqCst);
                    }
                    let _ = client.try_send(data_frame(&result.bars, true));
                }
                Err(e) => {
                    let _ = client.try_send(error_frame(&e));
                }
            }
        } else {
            // §4.4's historical endpoint is specified only for 1m bars; non-OHLCV stream types
            // have no historical fetch in this contract, so they start from live data only.
            let _ = client.try_send(data_frame(&[], true));
        }

        self.streaming.start(key.clone(), stream_type, credentials).await;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.spawn_listener(client.clone(), key.clone(), stream_type, last_forwarded_ts.clone(), cancel_rx);

        self.views.lock().insert(
            view_key,
            View {
                last_forwarded_ts,
                cancel: Some(cancel_tx),
            },
        );
    }

    /// §4.8 teardown: cancel the listener, unregister the view, stop the feed.
    pub async fn unsubscribe(&self, client_id: Uuid, key: &SubscriptionKey, stream_type: StreamType) {
        let view = self.views.lock().remove(&(client_id, key.clone(), stream_type));
        let Some(mut view) = view else { return };
        if let Some(cancel) = view.cancel.take() {
            let _ = cancel.send(());
        }
        self.streaming.stop(key, stream_type).await;
    }

    fn spawn_listener(
        &self,
        client: ClientHandle,
        key: SubscriptionKey,
        stream_type: StreamType,
        last_forwarded_ts: Arc<AtomicI64>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let cache = self.cache.clone();
        let channel = crate::cache::channel_name(&key.market, &key.provider, &key.symbol, stream_type.as_str());
        let send_timeout = self.config.client_send_timeout;

        tokio::spawn(async move {
            let mut pubsub = match cache.subscribe(&channel).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(channel, error = %e, "failed to subscribe to feed channel");
                    let _ = client.try_send(error_frame(&e));
                    return;
                }
            };
            let mut stream = pubsub.on_message();

            loop {
                tokio::select! {
                    _ = &mut cancel_rx => return,
                    msg = stream.next() => {
                        let Some(msg) = msg else { return };
                        let Ok(payload) = msg.get_payload::<String>() else { continue };

                        if let Some(ts) = leading_ts_ms(&payload) {
                            if ts <= last_forwarded_ts.load(Ordering::SeqCst) {
                                continue;
                            }
                            last_forwarded_ts.store(ts, Ordering::SeqCst);
                        }

                        let send = tokio::time::timeout(send_timeout, async {
                            client.try_send(payload)
                        });
                        match send.await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) | Err(_) => return,
                        }
                    }
                }
            }
        });
    }

    /// Number of currently-registered views, used by tests and operational introspection.
    pub fn view_count(&self) -> usize {
        self.views.lock().len()
    }
}
