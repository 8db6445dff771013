pub mod commands;
pub mod ha;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// A live server-side subscription. Events arrive in send order until the
/// subscription is dropped server-side or the connection closes.
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::UnboundedReceiver<Value>,
}

/// Control channel to the Home Assistant websocket API.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Send a command and wait for its `result`.
    async fn call(&self, message: Value) -> Result<Value>;

    /// Send a subscribing command. Resolves once the server acknowledges it.
    async fn subscribe(&self, message: Value) -> Result<Subscription>;

    async fn unsubscribe(&self, id: u64) -> Result<()>;

    /// Queue a binary frame. Returns false when there is no open socket.
    fn send_binary(&self, frame: Vec<u8>) -> bool;

    /// Fires each time the connection is re-established after a drop.
    fn ready(&self) -> broadcast::Receiver<()>;

    /// HTTP base used to resolve relative media paths.
    fn base_url(&self) -> String;
}

/// Fire-and-forget command. Failures are only logged.
pub fn send_and_forget(transport: &Arc<dyn Transport>, message: Value, area: &'static str) {
    let transport = transport.clone();
    tokio::spawn(async move {
        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        if let Err(e) = transport.call(message).await {
            log::debug!("[{}] {} failed: {}", area, kind, e);
        }
    });
}

/// Resolve a server-relative media path against the HTTP base.
pub fn media_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}
