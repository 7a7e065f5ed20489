use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use livechat_core::commands::HostMessage;

use crate::client::ClientRegistry;

/// Forwards commands posted through the host bridge to every attached host frame.
pub struct EventBridge {
    registry: Arc<ClientRegistry>,
}

impl EventBridge {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    pub fn start(&self, mut rx: broadcast::Receiver<HostMessage>) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if let Some(json) = serialize_message(&message) {
                            let delivered = registry.broadcast_all(&json);
                            tracing::trace!(function = %message.function, delivered, "forwarded host command");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event bridge lagged, dropped host commands");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event bridge channel closed");
                        break;
                    }
                }
            }
        })
    }
}

pub fn create_bridge(
    registry: Arc<ClientRegistry>,
    rx: broadcast::Receiver<HostMessage>,
) -> JoinHandle<()> {
    EventBridge::new(registry).start(rx)
}

/// Wire form of a host command, as the host frame's message listener expects it.
pub fn serialize_message(message: &HostMessage) -> Option<String> {
    serde_json::to_string(message).ok()
}
