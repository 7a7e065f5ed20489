use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use livechat_core::errors::SubsystemError;
use livechat_core::lifecycle::Subsystem;

/// Session metadata attached to the visitor.
pub trait CustomFieldStore: Subsystem {
    /// Set `key`. Without `overwrite`, an existing value wins.
    fn set_field(&self, key: &str, value: &str, overwrite: bool) -> FieldWrite;
    /// The visitor became known; queued writes are flushed.
    fn attach_visitor(&self, token: &str);
    fn get(&self, key: &str) -> Option<String>;
}

/// Outcome of [`CustomFieldStore::set_field`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldWrite {
    Stored,
    /// No visitor yet; applied when one is attached.
    Queued,
    /// Key already set and `overwrite` was false.
    Kept,
}

#[derive(Debug)]
struct PendingField {
    key: String,
    value: String,
    overwrite: bool,
}

#[derive(Debug, Default)]
struct FieldState {
    initialized: bool,
    visitor_token: Option<String>,
    fields: BTreeMap<String, String>,
    pending: Vec<PendingField>,
}

impl FieldState {
    fn write(&mut self, key: &str, value: &str, overwrite: bool) -> FieldWrite {
        if !overwrite && self.fields.contains_key(key) {
            return FieldWrite::Kept;
        }
        let _ = self.fields.insert(key.to_string(), value.to_string());
        FieldWrite::Stored
    }
}

/// In-memory custom field registry for one mount.
#[derive(Default)]
pub struct CustomFieldRegistry {
    state: Mutex<FieldState>,
}

impl CustomFieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn fields(&self) -> BTreeMap<String, String> {
        self.state.lock().fields.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }
}

impl CustomFieldStore for CustomFieldRegistry {
    fn set_field(&self, key: &str, value: &str, overwrite: bool) -> FieldWrite {
        let mut state = self.state.lock();
        if state.visitor_token.is_none() {
            state.pending.push(PendingField {
                key: key.to_string(),
                value: value.to_string(),
                overwrite,
            });
            debug!(key, "custom field queued until a visitor is known");
            return FieldWrite::Queued;
        }
        state.write(key, value, overwrite)
    }

    fn attach_visitor(&self, token: &str) {
        let mut state = self.state.lock();
        state.visitor_token = Some(token.to_string());
        let pending = std::mem::take(&mut state.pending);
        if !pending.is_empty() {
            debug!(count = pending.len(), "flushing queued custom fields");
        }
        for field in pending {
            let _ = state.write(&field.key, &field.value, field.overwrite);
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.state.lock().fields.get(key).cloned()
    }
}

#[async_trait]
impl Subsystem for CustomFieldRegistry {
    fn name(&self) -> &'static str {
        "custom_fields"
    }

    async fn init(&self) -> Result<(), SubsystemError> {
        self.state.lock().initialized = true;
        Ok(())
    }

    async fn reset(&self) -> Result<(), SubsystemError> {
        *self.state.lock() = FieldState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_until_visitor_attached() {
        let registry = CustomFieldRegistry::new();
        assert_eq!(registry.set_field("plan", "pro", true), FieldWrite::Queued);
        assert_eq!(registry.get("plan"), None);
        assert_eq!(registry.pending_count(), 1);

        registry.attach_visitor("visitor-token");
        assert_eq!(registry.get("plan").as_deref(), Some("pro"));
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn overwrite_flag_is_respected() {
        let registry = CustomFieldRegistry::new();
        registry.attach_visitor("t");
        assert_eq!(registry.set_field("plan", "free", true), FieldWrite::Stored);
        assert_eq!(registry.set_field("plan", "pro", false), FieldWrite::Kept);
        assert_eq!(registry.get("plan").as_deref(), Some("free"));
        assert_eq!(registry.set_field("plan", "pro", true), FieldWrite::Stored);
        assert_eq!(registry.get("plan").as_deref(), Some("pro"));
    }

    #[test]
    fn queued_writes_flush_in_order() {
        let registry = CustomFieldRegistry::new();
        let _ = registry.set_field("plan", "free", true);
        let _ = registry.set_field("plan", "pro", false);
        let _ = registry.set_field("region", "eu", true);
        registry.attach_visitor("t");

        let fields = registry.fields();
        assert_eq!(fields.get("plan").map(String::as_str), Some("free"));
        assert_eq!(fields.get("region").map(String::as_str), Some("eu"));
    }

    #[tokio::test]
    async fn reset_clears_everything_and_is_idempotent() {
        let registry = CustomFieldRegistry::new();
        registry.init().await.unwrap();
        assert!(registry.is_initialized());
        registry.attach_visitor("t");
        let _ = registry.set_field("plan", "pro", true);

        registry.reset().await.unwrap();
        registry.reset().await.unwrap();
        assert!(!registry.is_initialized());
        assert!(registry.fields().is_empty());
        assert_eq!(registry.set_field("plan", "pro", true), FieldWrite::Queued);
    }

    #[tokio::test]
    async fn reset_before_init_is_ok() {
        let registry = CustomFieldRegistry::new();
        registry.reset().await.unwrap();
        assert_eq!(registry.name(), "custom_fields");
    }
}
