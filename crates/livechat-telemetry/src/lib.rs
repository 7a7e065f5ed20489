//! Tracing setup for the widget runtime: JSON or plain stdout logs, per-module
//! levels adjustable at runtime, and an optional SQLite sink for warn+ events.

mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid filter directive: {0}")]
    InvalidDirective(String),
    #[error("filter reload failed: {0}")]
    Reload(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default level. Overridden by `RUST_LOG` when set.
    pub log_level: String,
    /// Per-module overrides (e.g. `livechat_engine` => `debug`).
    pub module_levels: BTreeMap<String, String>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            module_levels: BTreeMap::new(),
            json: true,
            log_to_sqlite: true,
            log_db_path: dirs_fallback().join("logs.db"),
        }
    }
}

/// Handle kept alive for the process lifetime.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    base_level: String,
    module_levels: Arc<RwLock<BTreeMap<String, String>>>,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: &str) -> Result<(), TelemetryError> {
        let mut levels = self.module_levels.write();
        let mut next = levels.clone();
        let _ = next.insert(module.to_string(), level.to_lowercase());
        let filter = EnvFilter::try_new(filter_directives(&self.base_level, &next))
            .map_err(|e| TelemetryError::InvalidDirective(e.to_string()))?;
        *levels = next;
        if let Some(handle) = &self.reload {
            handle
                .reload(filter)
                .map_err(|e| TelemetryError::Reload(e.to_string()))?;
        }
        Ok(())
    }

    /// Current per-module level overrides.
    pub fn module_levels(&self) -> BTreeMap<String, String> {
        self.module_levels.read().clone()
    }

    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Build an `EnvFilter` directive string, e.g. `info,livechat_engine=debug`.
pub fn filter_directives(level: &str, module_levels: &BTreeMap<String, String>) -> String {
    let mut filter = level.to_lowercase();
    for (module, level) in module_levels {
        filter.push_str(&format!(",{module}={}", level.to_lowercase()));
    }
    filter
}

/// Initialize tracing. Call once at startup; a second call leaves the first
/// subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let directives = filter_directives(&config.log_level, &config.module_levels);
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&directives))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, reload_handle) = reload::Layer::new(env_filter);

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(Arc::clone(&sink))), Some(sink))
            }
            Err(e) => {
                eprintln!("livechat-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .with(sqlite_layer)
        .try_init()
        .is_ok();
    if !installed {
        eprintln!("livechat-telemetry: a global subscriber is already installed");
    }

    TelemetryGuard {
        log_sink: sqlite_sink,
        base_level: config.log_level,
        module_levels: Arc::new(RwLock::new(config.module_levels)),
        reload: installed.then_some(reload_handle),
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".livechat")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let mut modules = BTreeMap::new();
        let _ = modules.insert("livechat_engine".to_string(), "DEBUG".to_string());
        let _ = modules.insert("hyper".to_string(), "warn".to_string());
        assert_eq!(
            filter_directives("INFO", &modules),
            "info,hyper=warn,livechat_engine=debug"
        );
    }

    #[test]
    fn directives_without_overrides() {
        assert_eq!(filter_directives("warn", &BTreeMap::new()), "warn");
    }

    #[test]
    fn default_config_points_into_livechat_dir() {
        let config = TelemetryConfig::default();
        assert!(config.log_db_path.ends_with(".livechat/logs.db"));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn guard_tracks_module_levels() {
        let guard = TelemetryGuard {
            log_sink: None,
            base_level: "info".into(),
            module_levels: Arc::new(RwLock::new(BTreeMap::new())),
            reload: None,
        };
        guard.set_module_level("livechat_server", "TRACE").unwrap();
        assert_eq!(
            guard.module_levels().get("livechat_server").map(String::as_str),
            Some("trace")
        );
        assert!(guard.logs().is_none());
    }

    #[test]
    fn guard_rejects_bad_directive() {
        let guard = TelemetryGuard {
            log_sink: None,
            base_level: "info".into(),
            module_levels: Arc::new(RwLock::new(BTreeMap::new())),
            reload: None,
        };
        let result = guard.set_module_level("livechat_server", "verbose");
        assert!(matches!(result, Err(TelemetryError::InvalidDirective(_))));
        assert!(guard.module_levels().is_empty());
    }
}
