//! Resilient realtime price feed.
//!
//! A background task owns the websocket connection: it logs in, registers
//! every subscribed instrument, echoes heartbeats, and reconnects per the
//! configured retry policy. Price ticks are handed to a separate dispatch
//! task through a bounded queue, so a slow sink (an exit order in flight)
//! never stalls heartbeat echo on the receive path. Subscriptions survive
//! reconnects because the sink map is the source of truth, not the
//! server-side registration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::FeedError;
use crate::models::{PriceTick, TickSource};

pub mod protocol;
pub mod retry;

use protocol::ServerFrame;
pub use retry::RetryPolicy;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);
const TICK_QUEUE_DEPTH: usize = 256;

/// Consumer of price ticks for one instrument.
#[async_trait]
pub trait TickSink: Send + Sync {
    async fn on_tick(&self, tick: &PriceTick);
}

/// Observable connection state, published on a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedStatus {
    Connecting,
    Up,
    Reconnecting,
    /// Retry policy exhausted; the feed task has stopped.
    Failed(String),
    Closed,
}

enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Close,
}

enum SessionEnd {
    Closed,
    Lost(FeedError),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Shared {
    url: String,
    token: String,
    retry: RetryPolicy,
    sinks: RwLock<HashMap<String, Arc<dyn TickSink>>>,
    last_prices: Mutex<HashMap<String, i64>>,
    closed: AtomicBool,
}

/// Handle to the background feed task.
pub struct StreamingFeed {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<FeedStatus>,
}

impl StreamingFeed {
    /// Spawns the connection task; it starts connecting immediately.
    pub fn new(url: impl Into<String>, token: impl Into<String>, retry: RetryPolicy) -> Arc<Self> {
        let shared = Arc::new(Shared {
            url: url.into(),
            token: token.into(),
            retry,
            sinks: RwLock::new(HashMap::new()),
            last_prices: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(FeedStatus::Connecting);
        let (tick_tx, tick_rx) = mpsc::channel(TICK_QUEUE_DEPTH);
        tokio::spawn(dispatch_ticks(Arc::clone(&shared), tick_rx));
        tokio::spawn(run_loop(Arc::clone(&shared), cmd_rx, status_tx, tick_tx));
        Arc::new(Self {
            shared,
            cmd_tx,
            status_rx,
        })
    }

    /// Registers `sink` for `instrument` ticks. The registration is replayed
    /// to the server on every reconnect.
    pub fn subscribe(&self, instrument: &str, sink: Arc<dyn TickSink>) {
        self.shared
            .sinks
            .write()
            .unwrap()
            .insert(instrument.to_string(), sink);
        let _ = self.cmd_tx.send(Command::Subscribe(instrument.to_string()));
    }

    pub fn unsubscribe(&self, instrument: &str) {
        self.shared.sinks.write().unwrap().remove(instrument);
        let _ = self
            .cmd_tx
            .send(Command::Unsubscribe(instrument.to_string()));
    }

    /// Most recent valid price seen for `instrument`, from any session.
    pub fn last_price(&self, instrument: &str) -> Option<i64> {
        self.shared.last_prices.lock().unwrap().get(instrument).copied()
    }

    pub fn status(&self) -> watch::Receiver<FeedStatus> {
        self.status_rx.clone()
    }

    /// Stops the connection task. Idempotent.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            let _ = self.cmd_tx.send(Command::Close);
        }
    }
}

/// Delivers queued ticks to their sinks, off the websocket receive path.
/// A sink that awaits a broker round trip only delays later ticks, never
/// the heartbeat echo. Ends when the connection task drops its sender.
async fn dispatch_ticks(shared: Arc<Shared>, mut tick_rx: mpsc::Receiver<PriceTick>) {
    while let Some(tick) = tick_rx.recv().await {
        let sink = shared.sinks.read().unwrap().get(&tick.instrument).cloned();
        if let Some(sink) = sink {
            sink.on_tick(&tick).await;
        }
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<FeedStatus>,
    tick_tx: mpsc::Sender<PriceTick>,
) {
    let mut attempt: u32 = 0;
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            let _ = status_tx.send(FeedStatus::Closed);
            return;
        }
        let _ = status_tx.send(if attempt == 0 {
            FeedStatus::Connecting
        } else {
            FeedStatus::Reconnecting
        });

        match connect_session(&shared).await {
            Ok(mut ws) => {
                attempt = 0;
                let _ = status_tx.send(FeedStatus::Up);
                info!(url = %shared.url, "price stream connected");
                if let Err(e) = resubscribe_all(&shared, &mut ws).await {
                    warn!(error = %e, "resubscription failed, reconnecting");
                } else {
                    match drive(&shared, &mut ws, &mut cmd_rx, &tick_tx).await {
                        SessionEnd::Closed => {
                            let _ = ws.close(None).await;
                            let _ = status_tx.send(FeedStatus::Closed);
                            info!("price stream closed");
                            return;
                        }
                        SessionEnd::Lost(e) => {
                            warn!(error = %e, "price stream lost");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "price stream connect failed");
            }
        }

        if shared.closed.load(Ordering::SeqCst) {
            let _ = status_tx.send(FeedStatus::Closed);
            return;
        }
        attempt += 1;
        match shared.retry.delay(attempt) {
            Some(delay) => {
                info!(attempt, ?delay, "scheduling reconnect");
                tokio::time::sleep(delay).await;
            }
            None => {
                let exhausted = FeedError::Unavailable {
                    attempts: attempt - 1,
                };
                error!(error = %exhausted, "giving up on price stream");
                let _ = status_tx.send(FeedStatus::Failed(exhausted.to_string()));
                return;
            }
        }
    }
}

/// Opens the websocket and completes the LOGIN handshake.
async fn connect_session(shared: &Shared) -> Result<WsStream, FeedError> {
    let mut request = shared
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| FeedError::Disconnected(e.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", shared.token))
        .map_err(|e| FeedError::Disconnected(e.to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (mut ws, _) = connect_async(request)
        .await
        .map_err(|e| FeedError::Disconnected(e.to_string()))?;

    ws.send(Message::Text(protocol::login_frame(&shared.token)))
        .await
        .map_err(|e| FeedError::Disconnected(e.to_string()))?;

    let ack = tokio::time::timeout(LOGIN_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(ServerFrame::Login {
                        return_code,
                        return_msg,
                    }) => {
                        return if return_code.unwrap_or(0) == 0 {
                            Ok(())
                        } else {
                            Err(FeedError::Disconnected(format!(
                                "login rejected: {}",
                                return_msg.unwrap_or_default()
                            )))
                        };
                    }
                    // The server may heartbeat before acknowledging login.
                    Ok(ServerFrame::Ping) => {
                        if let Err(e) = ws.send(Message::Text(text)).await {
                            return Err(FeedError::Disconnected(e.to_string()));
                        }
                    }
                    _ => {}
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(FeedError::Disconnected(e.to_string())),
                None => return Err(FeedError::Disconnected("closed during login".into())),
            }
        }
    })
    .await
    .map_err(|_| FeedError::Disconnected("login timed out".into()))?;
    ack?;
    Ok(ws)
}

/// Re-registers every known subscription on a fresh session.
async fn resubscribe_all(shared: &Shared, ws: &mut WsStream) -> Result<(), FeedError> {
    let instruments: Vec<String> = shared.sinks.read().unwrap().keys().cloned().collect();
    for instrument in instruments {
        debug!(%instrument, "re-registering realtime subscription");
        ws.send(Message::Text(protocol::register_frame(&instrument)))
            .await
            .map_err(|e| FeedError::Disconnected(e.to_string()))?;
    }
    Ok(())
}

/// Pumps one connected session until it ends.
async fn drive(
    shared: &Shared,
    ws: &mut WsStream,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    tick_tx: &mpsc::Sender<PriceTick>,
) -> SessionEnd {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Subscribe(instrument)) => {
                    if let Err(e) = ws.send(Message::Text(protocol::register_frame(&instrument))).await {
                        return SessionEnd::Lost(FeedError::Disconnected(e.to_string()));
                    }
                }
                Some(Command::Unsubscribe(instrument)) => {
                    if let Err(e) = ws.send(Message::Text(protocol::remove_frame(&instrument))).await {
                        return SessionEnd::Lost(FeedError::Disconnected(e.to_string()));
                    }
                }
                Some(Command::Close) | None => return SessionEnd::Closed,
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(end) = handle_frame(shared, ws, tick_tx, &text).await {
                        return end;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = ws.send(Message::Pong(payload)).await {
                        return SessionEnd::Lost(FeedError::Disconnected(e.to_string()));
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    return SessionEnd::Lost(FeedError::Disconnected("server closed".into()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Lost(FeedError::Disconnected(e.to_string())),
                None => return SessionEnd::Lost(FeedError::Disconnected("stream ended".into())),
            },
        }
    }
}

/// Handles one text frame; returns `Some` when the session must end.
async fn handle_frame(
    shared: &Shared,
    ws: &mut WsStream,
    tick_tx: &mpsc::Sender<PriceTick>,
    text: &str,
) -> Option<SessionEnd> {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            let malformed = FeedError::Malformed(e.to_string());
            warn!(error = %malformed, raw = text, "skipping frame");
            return None;
        }
    };
    match frame {
        // Heartbeat is echoed verbatim and ahead of any other work so the
        // server never times the session out while ticks are being handled.
        ServerFrame::Ping => {
            if let Err(e) = ws.send(Message::Text(text.to_string())).await {
                return Some(SessionEnd::Lost(FeedError::Disconnected(e.to_string())));
            }
        }
        ServerFrame::Real { data } => {
            for entry in data {
                if !entry.is_price_update() {
                    continue;
                }
                let Some(price) = entry.price() else {
                    debug!(instrument = %entry.item, "tick without usable price");
                    continue;
                };
                if price <= 0 {
                    continue;
                }
                // Cache first so pull-style readers never see a price older
                // than what sinks were notified with.
                shared
                    .last_prices
                    .lock()
                    .unwrap()
                    .insert(entry.item.clone(), price);
                let tick = PriceTick {
                    instrument: entry.item,
                    price,
                    timestamp: Utc::now(),
                    source: TickSource::Stream,
                };
                // The last-price cache and the poll backstop cover a dropped
                // tick; blocking the receive loop here would starve the
                // heartbeat echo.
                if let Err(e) = tick_tx.try_send(tick) {
                    warn!(error = %e, "tick queue full, dropping tick");
                }
            }
        }
        ServerFrame::System { code, message } => {
            warn!(?code, ?message, "system frame");
            if code.as_deref() == Some(protocol::SYSTEM_DUPLICATE_SESSION) {
                return Some(SessionEnd::Lost(FeedError::Disconnected(
                    "duplicate session, server dropped us".into(),
                )));
            }
        }
        ServerFrame::RegAck {
            return_code,
            return_msg,
        } => {
            if return_code.unwrap_or(0) == 0 {
                debug!("subscription acknowledged");
            } else {
                warn!(?return_code, ?return_msg, "subscription rejected");
            }
        }
        ServerFrame::RemoveAck { .. } | ServerFrame::Login { .. } => {}
        ServerFrame::Unknown => debug!(raw = text, "unrecognized frame"),
    }
    None
}
