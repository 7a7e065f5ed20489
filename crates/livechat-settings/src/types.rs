//! Settings types.
//!
//! Every section uses `#[serde(default)]` so a user file only needs the keys it
//! overrides.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use livechat_core::config::{IframeState, WidgetProps};
use livechat_core::state::SoundState;

use crate::errors::{Result, SettingsError};

/// Root settings container.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LivechatSettings {
    /// Host-frame socket server.
    pub server: ServerSettings,
    /// Backend handshake.
    pub connection: ConnectionSettings,
    /// Initial widget props.
    pub widget: WidgetSettings,
    /// Presence idle detection.
    pub presence: PresenceSettings,
    /// Trigger handler execution.
    pub triggers: TriggerSettings,
    /// Logging and log persistence.
    pub logging: LoggingSettings,
}

impl LivechatSettings {
    /// Reject values that would make the runtime misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.connection.server_url.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "connection.serverUrl must not be empty".into(),
            ));
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.connectTimeoutMs must be positive".into(),
            ));
        }
        if self.connection.base_delay_ms > self.connection.max_delay_ms {
            return Err(SettingsError::InvalidValue(
                "connection.baseDelayMs must not exceed connection.maxDelayMs".into(),
            ));
        }
        if self.presence.away_after_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "presence.awayAfterMs must be positive".into(),
            ));
        }
        if self.triggers.circuit_threshold == 0 {
            return Err(SettingsError::InvalidValue(
                "triggers.circuitThreshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    /// `0` binds a random port.
    pub port: u16,
    /// Per-client outbound queue length.
    pub max_send_queue: usize,
    /// Interval between dead host-client sweeps.
    pub cleanup_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9092,
            max_send_queue: 256,
            cleanup_interval_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Base URL of the livechat backend.
    pub server_url: String,
    /// Visitor token of a returning visitor.
    pub token: Option<String>,
    pub connect_timeout_ms: u64,
    /// Retries after the first attempt, for retryable failures only.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            token: None,
            connect_timeout_ms: 10_000,
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

/// Initial widget props, as the embedding page would pass them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WidgetSettings {
    pub minimized: bool,
    pub undocked: bool,
    pub expanded: bool,
    pub iframe_visible: bool,
    pub sound_enabled: bool,
    pub gdpr_accepted: bool,
    /// Location of the widget document (its query selects pop-out mode).
    pub location: String,
}

impl WidgetSettings {
    pub fn to_props(&self) -> WidgetProps {
        WidgetProps {
            minimized: self.minimized,
            undocked: self.undocked,
            expanded: self.expanded,
            iframe: IframeState {
                visible: self.iframe_visible,
            },
            sound: SoundState {
                enabled: self.sound_enabled,
                ..SoundState::default()
            },
            gdpr: livechat_core::config::GdprState {
                accepted: self.gdpr_accepted,
            },
            location: self.location.clone(),
            ..WidgetProps::default()
        }
    }
}

impl Default for WidgetSettings {
    fn default() -> Self {
        Self {
            minimized: true,
            undocked: false,
            expanded: false,
            iframe_visible: true,
            sound_enabled: true,
            gdpr_accepted: false,
            location: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceSettings {
    /// Inactivity before the visitor is reported away.
    pub away_after_ms: u64,
}

impl PresenceSettings {
    pub fn away_after(&self) -> Duration {
        Duration::from_millis(self.away_after_ms)
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            away_after_ms: 300_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerSettings {
    pub handler_timeout_ms: u64,
    /// Consecutive handler failures before it is skipped.
    pub circuit_threshold: u32,
    pub circuit_cooldown_secs: u64,
}

impl TriggerSettings {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_secs)
    }
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            handler_timeout_ms: 5_000,
            circuit_threshold: 3,
            circuit_cooldown_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` wins when set.
    pub level: String,
    /// Per-module overrides, e.g. `{"livechat_engine": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
    /// Persist warn+ events to SQLite.
    pub log_to_sqlite: bool,
    /// Empty means `~/.livechat/logs.db`.
    pub log_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            module_levels: BTreeMap::new(),
            log_to_sqlite: true,
            log_db_path: String::new(),
        }
    }
}
