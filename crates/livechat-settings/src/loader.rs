//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LivechatSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `LIVECHAT_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::LivechatSettings;

/// Resolve the path to the settings file (`~/.livechat/settings.json`).
pub fn settings_path() -> PathBuf {
    livechat_dir().join("settings.json")
}

/// `~/.livechat`, falling back to `/tmp/.livechat` without a home directory.
pub fn livechat_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".livechat")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LivechatSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or invalid values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<LivechatSettings> {
    let defaults = serde_json::to_value(LivechatSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: LivechatSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides read through `lookup` (the process environment in production).
///
/// Invalid values are ignored with a warning and the file/default value stays.
pub fn apply_overrides(settings: &mut LivechatSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("LIVECHAT_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64_in("LIVECHAT_PORT", 0, u64::from(u16::MAX)) {
        settings.server.port = v as u16;
    }

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = env.string("LIVECHAT_SERVER_URL") {
        settings.connection.server_url = v;
    }
    if let Some(v) = env.string("LIVECHAT_TOKEN") {
        settings.connection.token = Some(v);
    }
    if let Some(v) = env.u64_in("LIVECHAT_CONNECT_TIMEOUT_MS", 100, 300_000) {
        settings.connection.connect_timeout_ms = v;
    }
    if let Some(v) = env.u64_in("LIVECHAT_MAX_RETRIES", 0, 20) {
        settings.connection.max_retries = v as u32;
    }

    // ── Widget ──────────────────────────────────────────────────────
    if let Some(v) = env.bool("LIVECHAT_MINIMIZED") {
        settings.widget.minimized = v;
    }
    if let Some(v) = env.bool("LIVECHAT_IFRAME_VISIBLE") {
        settings.widget.iframe_visible = v;
    }
    if let Some(v) = env.string("LIVECHAT_LOCATION") {
        settings.widget.location = v;
    }

    // ── Presence / logging ──────────────────────────────────────────
    if let Some(v) = env.u64_in("LIVECHAT_AWAY_AFTER_MS", 1_000, 86_400_000) {
        settings.presence.away_after_ms = v;
    }
    if let Some(v) = env.string("LIVECHAT_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("LIVECHAT_LOG_TO_SQLITE") {
        settings.logging.log_to_sqlite = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}
