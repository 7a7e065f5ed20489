use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;

use livechat_core::config::Visitor;
use livechat_engine::connection::ConnectionOptions;
use livechat_engine::{
    BroadcastTransport, CustomFieldRegistry, HostBridge, PresenceTracker, RestConnection,
    RetryPolicy, TriggerEngine, VisibilityWatcher,
};
use livechat_server::{ServerConfig, SessionOrchestrator, Subsystems};
use livechat_settings::LivechatSettings;
use livechat_telemetry::TelemetryConfig;

const HOST_CHANNEL_CAPACITY: usize = 256;

/// Runs one livechat widget session and exposes it to the host frame over a socket.
#[derive(Parser, Debug)]
#[command(name = "livechat-widget", version)]
struct Args {
    /// Settings file (defaults to ~/.livechat/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Port for the host socket; overrides the settings file.
    #[arg(long)]
    port: Option<u16>,

    /// Widget document location, e.g. `https://site/livechat?mode=popout`.
    #[arg(long)]
    location: Option<String>,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = match &args.settings {
        Some(path) => livechat_settings::load_settings_from_path(path),
        None => livechat_settings::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(location) = args.location {
        settings.widget.location = location;
    }

    let telemetry = livechat_telemetry::init_telemetry(telemetry_config(&settings, args.pretty));
    tracing::info!(server_url = %settings.connection.server_url, "starting livechat widget");

    let transport = Arc::new(BroadcastTransport::new(HOST_CHANNEL_CAPACITY));
    let subsystems = build_subsystems(&settings, Arc::clone(&transport))?;

    let mut props = settings.widget.to_props();
    if let Some(token) = &settings.connection.token {
        props.user = Some(Visitor {
            token: Some(token.clone()),
            ..Default::default()
        });
    }
    let orchestrator = SessionOrchestrator::new(props, subsystems);

    let server = livechat_server::start(
        ServerConfig {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_send_queue: settings.server.max_send_queue,
            cleanup_interval: std::time::Duration::from_secs(settings.server.cleanup_interval_secs),
        },
        orchestrator.clone(),
        &transport,
    )
    .await
    .context("failed to start host socket")?;
    tracing::info!(port = server.port, mount_id = %orchestrator.mount_id(), "widget server ready");

    let mounting = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.mount().await {
                tracing::warn!(error = %e, "widget stays inert");
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    orchestrator.handle_unload();
    orchestrator.teardown().await;
    let _ = mounting.await;
    server.shutdown();

    if let Some(logs) = telemetry.logs() {
        match logs.for_mount(orchestrator.mount_id().as_str()) {
            Ok(records) if !records.is_empty() => {
                tracing::info!(warnings = records.len(), "session left persisted warnings");
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "could not read persisted logs"),
        }
    }
    Ok(())
}

fn telemetry_config(settings: &LivechatSettings, pretty: bool) -> TelemetryConfig {
    let logging = &settings.logging;
    let mut config = TelemetryConfig {
        log_level: logging.level.clone(),
        module_levels: logging.module_levels.clone(),
        json: !pretty,
        log_to_sqlite: logging.log_to_sqlite,
        ..TelemetryConfig::default()
    };
    if !logging.log_db_path.is_empty() {
        config.log_db_path = PathBuf::from(&logging.log_db_path);
    }
    config
}

fn build_subsystems(
    settings: &LivechatSettings,
    transport: Arc<BroadcastTransport>,
) -> anyhow::Result<Subsystems> {
    let conn = &settings.connection;
    let connection = RestConnection::new(ConnectionOptions {
        server_url: conn.server_url.clone(),
        token: conn.token.clone().map(SecretString::from),
        timeout: conn.connect_timeout(),
        retry: RetryPolicy {
            max_retries: conn.max_retries,
            base_delay: conn.base_delay(),
            max_delay: conn.max_delay(),
            ..RetryPolicy::default()
        },
    })?;

    let triggers = &settings.triggers;
    Ok(Subsystems {
        connection: Arc::new(connection),
        custom_fields: Arc::new(CustomFieldRegistry::new()),
        presence: Arc::new(PresenceTracker::new(settings.presence.away_after())),
        triggers: Arc::new(TriggerEngine::with_limits(
            triggers.handler_timeout(),
            triggers.circuit_threshold,
            triggers.circuit_cooldown(),
        )),
        visibility: Arc::new(VisibilityWatcher::new()),
        bridge: Arc::new(HostBridge::new(transport)),
    })
}
