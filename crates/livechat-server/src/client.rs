use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use livechat_core::ids::HostClientId;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// A host frame connected over the socket.
pub struct HostClient {
    pub id: HostClientId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl HostClient {
    fn new(id: HostClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Every host frame currently attached to the widget.
pub struct ClientRegistry {
    clients: DashMap<HostClientId, Arc<HostClient>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new host frame and return its id and outbound queue.
    pub fn register(&self) -> (HostClientId, mpsc::Receiver<String>) {
        let id = HostClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let _ = self
            .clients
            .insert(id.clone(), Arc::new(HostClient::new(id.clone(), tx)));
        (id, rx)
    }

    pub fn unregister(&self, id: &HostClientId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.connected.store(false, Ordering::Relaxed);
        }
    }

    /// Queue `message` for one client. Dropped when its queue is full.
    pub fn send_to(&self, id: &HostClientId, message: String) -> bool {
        let Some(tx) = self.clients.get(id).map(|c| c.tx.clone()) else {
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(client_id = %id, msg_len = msg.len(), "send queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue `message` for every connected client; returns how many accepted it.
    pub fn broadcast_all(&self, message: &str) -> usize {
        self.clients
            .iter()
            .filter(|entry| entry.is_connected())
            .filter(|entry| entry.tx.try_send(message.to_string()).is_ok())
            .count()
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Remove clients that stopped answering pings.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<HostClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.is_alive())
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(client_id = %id, "cleaned up dead host client");
        }
        dead.len()
    }

    fn client(&self, id: &HostClientId) -> Option<Arc<HostClient>> {
        self.clients.get(id).map(|c| Arc::clone(c.value()))
    }
}

/// Pump one socket: outbound queue and heartbeat on one side, inbound text to
/// `on_message` on the other. Returns when either side closes.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: HostClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    on_message: mpsc::Sender<(HostClientId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_client = registry.client(&client_id);
    let writer_cid = client_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Default::default())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_cid, "sent ping");
                }
            }
        }

        if let Some(client) = writer_client {
            client.connected.store(false, Ordering::Relaxed);
        }
    });

    let reader_client = registry.client(&client_id);
    let reader_cid = client_id.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message
                        .send((reader_cid.clone(), text.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                WsMessage::Pong(_) => {
                    if let Some(client) = &reader_client {
                        client.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&client_id);
    tracing::info!(client_id = %client_id, "host client disconnected");
}

/// Periodically drop clients that stopped answering pings.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            let _ = ticker.tick().await;
            let removed = registry.cleanup_dead_clients();
            if removed > 0 {
                tracing::info!(removed, "dead host client cleanup");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = ClientRegistry::new(32);
        let (a, _rx_a) = registry.register();
        let (b, _rx_b) = registry.register();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("host_"));
        assert_eq!(registry.count(), 2);

        registry.unregister(&a);
        assert_eq!(registry.count(), 1);
        registry.unregister(&a);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn send_to_specific_client() {
        let registry = ClientRegistry::new(32);
        let (id, mut rx) = registry.register();

        assert!(registry.send_to(&id, "hello".into()));
        assert_eq!(rx.recv().await.unwrap(), "hello");
        assert!(!registry.send_to(&HostClientId::new(), "lost".into()));
    }

    #[test]
    fn full_queue_drops_message() {
        let registry = ClientRegistry::new(2);
        let (id, _rx) = registry.register();

        assert!(registry.send_to(&id, "1".into()));
        assert!(registry.send_to(&id, "2".into()));
        assert!(!registry.send_to(&id, "3".into()));
    }

    #[test]
    fn broadcast_reaches_connected_clients() {
        let registry = ClientRegistry::new(32);
        let (_a, mut rx_a) = registry.register();
        let (b, mut rx_b) = registry.register();
        let (_c, rx_c) = registry.register();
        drop(rx_c);

        if let Some(client) = registry.client(&b) {
            client.connected.store(false, Ordering::Relaxed);
        }

        assert_eq!(registry.broadcast_all("ready"), 1);
        assert_eq!(rx_a.try_recv().unwrap(), "ready");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn pong_keeps_client_alive() {
        let (tx, _rx) = mpsc::channel(1);
        let client = HostClient::new(HostClientId::new(), tx);
        assert!(client.is_alive());
        client.last_pong.store(0, Ordering::Relaxed);
        assert!(!client.is_alive());
        client.record_pong();
        assert!(client.is_alive());
    }

    #[test]
    fn cleanup_removes_expired_clients() {
        let registry = ClientRegistry::new(32);
        let (stale, _rx1) = registry.register();
        let (_fresh, _rx2) = registry.register();

        if let Some(client) = registry.client(&stale) {
            client.last_pong.store(0, Ordering::Relaxed);
        }

        assert_eq!(registry.cleanup_dead_clients(), 1);
        assert_eq!(registry.count(), 1);
        assert!(registry.client(&stale).is_none());
    }
}
