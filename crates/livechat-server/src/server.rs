use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use livechat_core::events::HostEvent;
use livechat_core::ids::HostClientId;
use livechat_engine::BroadcastTransport;

use crate::client::{self, ClientRegistry};
use crate::event_bridge;
use crate::orchestrator::{Phase, SessionOrchestrator};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9092,
            max_send_queue: 256,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Shared state handed to the axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SessionOrchestrator,
    pub registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(HostClientId, String)>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/host", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/state", get(state_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind the host socket and start forwarding commands from `transport`.
pub async fn start(
    config: ServerConfig,
    orchestrator: SessionOrchestrator,
    transport: &BroadcastTransport,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ClientRegistry::new(config.max_send_queue));

    let bridge = event_bridge::create_bridge(Arc::clone(&registry), transport.subscribe());
    let cleanup = client::start_cleanup_task(Arc::clone(&registry), config.cleanup_interval);

    let (message_tx, message_rx) = mpsc::channel::<(HostClientId, String)>(1024);
    let events = tokio::spawn(process_host_messages(
        message_rx,
        orchestrator.clone(),
        Arc::clone(&registry),
    ));

    let router = build_router(AppState {
        orchestrator,
        registry,
        message_tx,
    });
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "host socket listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "host socket server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        tasks: vec![server, bridge, events, cleanup],
    })
}

/// Keeps the server tasks alive; `shutdown` stops them.
pub struct ServerHandle {
    pub port: u16,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.registry.register();
    tracing::info!(client_id = %client_id, "host client connected");
    client::handle_ws_connection(socket, client_id, rx, state.registry, state.message_tx).await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let phase = state.orchestrator.phase();
    let status = if phase == Phase::Failed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = serde_json::json!({
        "status": if phase == Phase::Failed { "failed" } else { "ok" },
        "phase": phase,
        "mountId": state.orchestrator.mount_id(),
        "hostClients": state.registry.count(),
    });
    (status, Json(body))
}

async fn state_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "state": state.orchestrator.state(),
        "screen": state.orchestrator.render(),
    }))
}

/// Apply host-frame events in arrival order. Unparseable messages are answered
/// with an error frame to the sender only.
async fn process_host_messages(
    mut rx: mpsc::Receiver<(HostClientId, String)>,
    orchestrator: SessionOrchestrator,
    registry: Arc<ClientRegistry>,
) {
    while let Some((client_id, raw)) = rx.recv().await {
        match serde_json::from_str::<HostEvent>(&raw) {
            Ok(event) => orchestrator.handle_host_event(event),
            Err(e) => {
                tracing::debug!(client_id = %client_id, error = %e, "rejected host message");
                let reply = serde_json::json!({"type": "error", "message": e.to_string()});
                let _ = registry.send_to(&client_id, reply.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Subsystems;
    use livechat_core::config::{IframeState, LivechatConfig, WidgetProps};
    use livechat_core::errors::ConnectionError;
    use livechat_engine::mock::{CallLog, MockConnection, RecordingSubsystem};
    use livechat_engine::{ConnectionManager, HostBridge, VisibilityWatcher};

    fn orchestrator(
        connection: Arc<dyn ConnectionManager>,
        transport: &Arc<BroadcastTransport>,
        log: &CallLog,
    ) -> SessionOrchestrator {
        let stub = Arc::new(RecordingSubsystem::new("stub", log.clone()));
        let subsystems = Subsystems {
            connection,
            custom_fields: stub.clone(),
            presence: stub.clone(),
            triggers: stub,
            visibility: Arc::new(VisibilityWatcher::new()),
            bridge: Arc::new(HostBridge::new(transport.clone())),
        };
        let props = WidgetProps {
            minimized: true,
            iframe: IframeState { visible: true },
            ..Default::default()
        };
        SessionOrchestrator::new(props, subsystems)
    }

    fn online() -> LivechatConfig {
        LivechatConfig {
            enabled: true,
            online: true,
            ..Default::default()
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn serves_health_and_state() {
        let log = CallLog::new();
        let transport = Arc::new(BroadcastTransport::new(16));
        let session = orchestrator(
            Arc::new(MockConnection::ready(online(), log.clone())),
            &transport,
            &log,
        );
        let handle = start(test_config(), session.clone(), &transport).await.unwrap();
        assert!(handle.port > 0);

        let base = format!("http://127.0.0.1:{}", handle.port);
        let resp = reqwest::get(format!("{base}/state")).await.unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["state"]["initialized"], false);
        assert!(body["screen"].is_null());

        session.mount().await.unwrap();

        let resp = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["phase"], "ready");
        assert_eq!(body["hostClients"], 0);

        let body: serde_json::Value = reqwest::get(format!("{base}/state"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["state"]["initialized"], true);
        assert_eq!(body["screen"]["path"], "/");

        handle.shutdown();
    }

    #[tokio::test]
    async fn health_reports_failed_session() {
        let log = CallLog::new();
        let transport = Arc::new(BroadcastTransport::new(16));
        let session = orchestrator(
            Arc::new(MockConnection::failing(ConnectionError::WidgetDisabled, log.clone())),
            &transport,
            &log,
        );
        let handle = start(test_config(), session.clone(), &transport).await.unwrap();
        assert!(session.mount().await.is_err());

        let resp = reqwest::get(format!("http://127.0.0.1:{}/health", handle.port))
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "failed");

        handle.shutdown();
    }

    #[tokio::test]
    async fn host_messages_drive_the_session() {
        let log = CallLog::new();
        let transport = Arc::new(BroadcastTransport::new(16));
        let session = orchestrator(
            Arc::new(MockConnection::ready(online(), log.clone())),
            &transport,
            &log,
        );
        session.mount().await.unwrap();

        let registry = Arc::new(ClientRegistry::new(8));
        let (client_id, mut client_rx) = registry.register();
        let (tx, rx) = mpsc::channel(8);
        let processor = tokio::spawn(process_host_messages(rx, session.clone(), Arc::clone(&registry)));

        tx.send((client_id.clone(), r#"{"type":"visibility","hidden":true}"#.into()))
            .await
            .unwrap();
        tx.send((client_id.clone(), r#"{"type":"resize"}"#.into()))
            .await
            .unwrap();
        tx.send((client_id, r#"{"type":"unload"}"#.into())).await.unwrap();
        drop(tx);
        processor.await.unwrap();

        let state = session.state();
        assert!(!state.visible);
        assert!(state.minimized);

        let reply: serde_json::Value =
            serde_json::from_str(&client_rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply["type"], "error");
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn commands_reach_registered_host_clients() {
        let log = CallLog::new();
        let transport = Arc::new(BroadcastTransport::new(16));
        let session = orchestrator(
            Arc::new(MockConnection::ready(online(), log.clone())),
            &transport,
            &log,
        );
        let registry = Arc::new(ClientRegistry::new(8));
        let (_id, mut client_rx) = registry.register();
        let bridge = event_bridge::create_bridge(Arc::clone(&registry), transport.subscribe());

        session.mount().await.unwrap();

        let mut functions = Vec::new();
        for _ in 0..3 {
            let raw = tokio::time::timeout(Duration::from_secs(1), client_rx.recv())
                .await
                .unwrap()
                .unwrap();
            let msg: serde_json::Value = serde_json::from_str(&raw).unwrap();
            functions.push(msg["fn"].as_str().unwrap().to_string());
        }
        assert_eq!(functions, ["minimizeWindow", "showWidget", "ready"]);

        bridge.abort();
    }
}
