//! Home Assistant websocket client: auth handshake, id-correlated commands,
//! subscriptions, keepalive and automatic reconnect.

use super::{Subscription, Transport};
use crate::error::{Result, SatelliteError};
use crate::state::lock;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_BASE_MS: u64 = 800;
const RECONNECT_MAX_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub websocket: String,
    pub http: String,
}

/// Derive the websocket and HTTP endpoints from a configured base URL.
pub fn endpoints(url: &str) -> Result<Endpoints> {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/api/websocket").unwrap_or(trimmed);
    let schemes = [
        ("https://", "wss", "https"),
        ("http://", "ws", "http"),
        ("wss://", "wss", "https"),
        ("ws://", "ws", "http"),
    ];
    for (prefix, ws, http) in schemes {
        if let Some(host) = trimmed.strip_prefix(prefix) {
            if host.is_empty() {
                break;
            }
            return Ok(Endpoints {
                websocket: format!("{}://{}/api/websocket", ws, host),
                http: format!("{}://{}", http, host),
            });
        }
    }
    Err(SatelliteError::Config(format!(
        "unsupported Home Assistant URL '{}'",
        url
    )))
}

fn reconnect_delay_ms(attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(10);
    let factor = 1u64 << exp;
    (RECONNECT_BASE_MS.saturating_mul(factor)).min(RECONNECT_MAX_MS)
}

fn is_permanent_connect_error(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Http(resp) => {
            let code = resp.status().as_u16();
            code == 401 || code == 403
        }
        _ => false,
    }
}

fn build_ws_request(url: &str) -> Result<tungstenite::http::Request<()>> {
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        "User-Agent",
        HeaderValue::from_static(concat!("voice-satellite/", env!("CARGO_PKG_VERSION"))),
    );
    Ok(request)
}

async fn next_json(ws: &mut WsStream) -> Result<Value> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
            Some(Ok(Message::Close(_))) | None => return Err(SatelliteError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn authenticate(ws: &mut WsStream, token: &str) -> Result<()> {
    let hello = next_json(ws).await?;
    if hello["type"] != "auth_required" {
        return Err(SatelliteError::Transport(format!(
            "unexpected greeting: {}",
            hello
        )));
    }
    log::info!(
        "[ha] connected to Home Assistant {}",
        hello["ha_version"].as_str().unwrap_or("?")
    );
    let auth = json!({ "type": "auth", "access_token": token });
    ws.send(Message::Text(auth.to_string().into())).await?;
    let reply = next_json(ws).await?;
    match reply["type"].as_str() {
        Some("auth_ok") => Ok(()),
        Some("auth_invalid") => Err(SatelliteError::Config(format!(
            "authentication rejected: {}",
            reply["message"].as_str().unwrap_or("invalid access token")
        ))),
        _ => Err(SatelliteError::Transport(format!(
            "unexpected auth reply: {}",
            reply
        ))),
    }
}

/// Connect and complete the `auth_required` / `auth` / `auth_ok` exchange.
async fn open_socket(url: &str, token: &str) -> Result<WsStream> {
    let request = build_ws_request(url)?;
    let (mut ws, _) = connect_async(request).await.map_err(|e| {
        if is_permanent_connect_error(&e) {
            SatelliteError::Config(format!("Authentication failed: {}", e))
        } else {
            e.into()
        }
    })?;

    tokio::time::timeout(AUTH_TIMEOUT, authenticate(&mut ws, token))
        .await
        .map_err(|_| SatelliteError::Timeout("authentication"))??;
    Ok(ws)
}

struct Inner {
    endpoints: Endpoints,
    token: String,
    next_id: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    subscriptions: Mutex<HashMap<u64, mpsc::UnboundedSender<Value>>>,
    connected: AtomicBool,
    ready_tx: broadcast::Sender<()>,
}

impl Inner {
    fn new(endpoints: Endpoints, token: &str) -> Self {
        let (ready_tx, _) = broadcast::channel(8);
        Self {
            endpoints,
            token: token.to_string(),
            next_id: AtomicU64::new(1),
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            ready_tx,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn attach(self: &Arc<Self>, ws: WsStream) -> JoinHandle<()> {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *lock(&self.outbound) = Some(out_tx);
        self.connected.store(true, Ordering::SeqCst);

        let inner = self.clone();
        tokio::spawn(async move {
            let writer_inner = inner.clone();
            let writer = tokio::spawn(async move {
                let mut ping = tokio::time::interval(PING_INTERVAL);
                ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // Skip the first immediate tick.
                ping.tick().await;
                loop {
                    tokio::select! {
                        msg = out_rx.recv() => {
                            let Some(msg) = msg else { break };
                            if let Err(e) = ws_tx.send(msg).await {
                                log::warn!("[ha] send failed: {}", e);
                                break;
                            }
                        }
                        _ = ping.tick() => {
                            let ping = json!({ "id": writer_inner.next_id(), "type": "ping" });
                            if ws_tx.send(Message::Text(ping.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = ws_tx.close().await;
            });

            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => inner.dispatch(&text),
                    Ok(Message::Close(frame)) => {
                        match frame {
                            Some(frame) => log::warn!(
                                "[ha] websocket closed: {} {}",
                                frame.code,
                                frame.reason
                            ),
                            None => log::warn!("[ha] websocket closed"),
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("[ha] websocket error: {}", e);
                        break;
                    }
                }
            }
            writer.abort();
            inner.on_disconnect();
        })
    }

    fn on_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.outbound).take();
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(SatelliteError::Closed));
        }
        // Dropping the senders ends every subscriber's stream.
        lock(&self.subscriptions).clear();
    }

    fn dispatch(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[ha] unparseable message: {}", e);
                return;
            }
        };
        match value {
            Value::Array(items) => items.into_iter().for_each(|m| self.route(m)),
            other => self.route(other),
        }
    }

    fn route(&self, msg: Value) {
        let Some(id) = msg.get("id").and_then(Value::as_u64) else {
            return;
        };
        match msg.get("type").and_then(Value::as_str) {
            Some("result") => {
                let outcome = if msg["success"].as_bool() == Some(true) {
                    Ok(msg.get("result").cloned().unwrap_or(Value::Null))
                } else {
                    lock(&self.subscriptions).remove(&id);
                    Err(SatelliteError::Server {
                        code: msg["error"]["code"]
                            .as_str()
                            .unwrap_or("unknown_error")
                            .to_string(),
                        message: msg["error"]["message"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                    })
                };
                if let Some(tx) = lock(&self.pending).remove(&id) {
                    let _ = tx.send(outcome);
                }
            }
            Some("event") => {
                let event = msg.get("event").cloned().unwrap_or(Value::Null);
                let sender = lock(&self.subscriptions).get(&id).cloned();
                if let Some(tx) = sender {
                    if tx.send(event).is_err() {
                        lock(&self.subscriptions).remove(&id);
                    }
                }
            }
            Some("pong") => {}
            other => log::debug!("[ha] unhandled message type {:?}", other),
        }
    }

    /// Send `message` under `id` and wait for its result.
    async fn request(&self, id: u64, mut message: Value) -> Result<Value> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SatelliteError::NotConnected);
        }
        message["id"] = json!(id);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let sent = lock(&self.outbound)
            .as_ref()
            .map(|out| out.send(Message::Text(message.to_string().into())).is_ok())
            .unwrap_or(false);
        if !sent {
            lock(&self.pending).remove(&id);
            return Err(SatelliteError::NotConnected);
        }
        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SatelliteError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(SatelliteError::Timeout("command result"))
            }
        }
    }
}

async fn supervise(inner: Arc<Inner>, mut session: JoinHandle<()>) {
    loop {
        let _ = session.await;
        log::warn!("[ha] connection lost");
        let mut attempts: u32 = 0;
        session = loop {
            attempts += 1;
            let delay = reconnect_delay_ms(attempts);
            log::info!("[ha] reconnecting in {}ms (attempt {})", delay, attempts);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            match open_socket(&inner.endpoints.websocket, &inner.token).await {
                Ok(ws) => break inner.attach(ws),
                Err(e) if e.is_config() => {
                    log::error!("[ha] giving up: {}", e);
                    return;
                }
                Err(e) => log::warn!("[ha] reconnect failed: {}", e),
            }
        };
        log::info!("[ha] reconnected");
        let _ = inner.ready_tx.send(());
    }
}

pub struct HaConnection {
    inner: Arc<Inner>,
}

impl HaConnection {
    pub async fn connect(url: &str, token: &str) -> Result<Arc<Self>> {
        let inner = Arc::new(Inner::new(endpoints(url)?, token));
        log::info!("[ha] connecting to {}", inner.endpoints.websocket);
        let ws = open_socket(&inner.endpoints.websocket, &inner.token).await?;
        let session = inner.attach(ws);
        tokio::spawn(supervise(inner.clone(), session));
        Ok(Arc::new(Self { inner }))
    }
}

#[async_trait]
impl Transport for HaConnection {
    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn call(&self, message: Value) -> Result<Value> {
        let id = self.inner.next_id();
        self.inner.request(id, message).await
    }

    async fn subscribe(&self, message: Value) -> Result<Subscription> {
        let id = self.inner.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        // Registered first: events can follow the result immediately.
        lock(&self.inner.subscriptions).insert(id, tx);
        match self.inner.request(id, message).await {
            Ok(_) => Ok(Subscription { id, events: rx }),
            Err(e) => {
                lock(&self.inner.subscriptions).remove(&id);
                Err(e)
            }
        }
    }

    async fn unsubscribe(&self, id: u64) -> Result<()> {
        lock(&self.inner.subscriptions).remove(&id);
        if !self.is_connected() {
            return Ok(());
        }
        let msg = json!({ "type": "unsubscribe_events", "subscription": id });
        self.call(msg).await.map(|_| ())
    }

    fn send_binary(&self, frame: Vec<u8>) -> bool {
        lock(&self.inner.outbound)
            .as_ref()
            .map(|out| out.send(Message::Binary(frame.into())).is_ok())
            .unwrap_or(false)
    }

    fn ready(&self) -> broadcast::Receiver<()> {
        self.inner.ready_tx.subscribe()
    }

    fn base_url(&self) -> String {
        self.inner.endpoints.http.clone()
    }
}
