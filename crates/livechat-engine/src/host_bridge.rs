use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use livechat_core::commands::{HostCommand, HostMessage};
use livechat_core::errors::BridgeError;

/// Delivery channel toward the embedding page.
pub trait HostTransport: Send + Sync {
    fn post(&self, message: &HostMessage) -> Result<(), BridgeError>;
}

/// Fans host messages out to every subscriber (the host socket clients).
pub struct BroadcastTransport {
    tx: broadcast::Sender<HostMessage>,
}

impl BroadcastTransport {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostMessage> {
        self.tx.subscribe()
    }
}

impl HostTransport for BroadcastTransport {
    fn post(&self, message: &HostMessage) -> Result<(), BridgeError> {
        self.tx
            .send(message.clone())
            .map(|_| ())
            .map_err(|_| BridgeError::NoHost)
    }
}

/// Transport for a widget running without a host frame.
pub struct NoHostTransport;

impl HostTransport for NoHostTransport {
    fn post(&self, _message: &HostMessage) -> Result<(), BridgeError> {
        Err(BridgeError::NoHost)
    }
}

/// One-way, at-most-once command channel to the host page.
pub struct HostBridge {
    transport: Arc<dyn HostTransport>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl HostBridge {
    pub fn new(transport: Arc<dyn HostTransport>) -> Self {
        Self {
            transport,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Post `command`. Delivery failures are logged and dropped, never retried.
    pub fn send(&self, command: HostCommand) {
        match self.transport.post(&command.to_message()) {
            Ok(()) => {
                let _ = self.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(command = %command, "host command sent");
            }
            Err(e) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(command = %command, error = %e, "host command dropped");
            }
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
