//! # livechat-settings
//!
//! Configuration for the livechat widget runtime.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`LivechatSettings::default()`]
//! 2. **User file**: `~/.livechat/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `LIVECHAT_*` overrides (highest priority)
//!
//! Settings are passed explicitly to whoever needs them; there is no global.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, livechat_dir, load_settings, load_settings_from_path, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_re_exported() {
        let a = serde_json::json!({"x": 1});
        let b = serde_json::json!({"y": 2});
        let merged = deep_merge(a, b);
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = LivechatSettings::default();
        assert_eq!(settings.server.port, 9092);
        assert_eq!(settings.connection.server_url, "http://localhost:3000");
        assert_eq!(settings.connection.max_retries, 3);
        assert!(settings.connection.token.is_none());
        assert_eq!(settings.presence.away_after_ms, 300_000);
        assert_eq!(settings.triggers.handler_timeout_ms, 5_000);
        assert!(settings.widget.iframe_visible);
        assert!(settings.validate().is_ok());
    }
}
