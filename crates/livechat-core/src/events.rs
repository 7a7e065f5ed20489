use serde::{Deserialize, Serialize};

/// Normalized visibility of the host document.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Visible,
    Hidden,
}

impl Visibility {
    pub fn from_hidden(hidden: bool) -> Self {
        if hidden {
            Self::Hidden
        } else {
            Self::Visible
        }
    }

    pub fn is_hidden(&self) -> bool {
        matches!(self, Self::Hidden)
    }
}

/// Events the host frame reports to the widget.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostEvent {
    /// Document visibility changed (tab switched, window minimized, ...).
    Visibility { hidden: bool },
    /// The widget window is being unloaded.
    Unload,
    /// The widget navigated to another screen path.
    Navigate { path: String },
    /// Shared storage caught up after a pop-out window closed.
    StorageSynced,
    /// User activity (pointer, keyboard) in the widget.
    Activity,
}

impl HostEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Visibility { .. } => "visibility",
            Self::Unload => "unload",
            Self::Navigate { .. } => "navigate",
            Self::StorageSynced => "storage-synced",
            Self::Activity => "activity",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_from_hidden_flag() {
        assert_eq!(Visibility::from_hidden(true), Visibility::Hidden);
        assert_eq!(Visibility::from_hidden(false), Visibility::Visible);
        assert!(Visibility::Hidden.is_hidden());
        assert!(!Visibility::Visible.is_hidden());
    }

    #[test]
    fn parses_host_events() {
        let ev: HostEvent = serde_json::from_str(r#"{"type":"visibility","hidden":true}"#).unwrap();
        assert_eq!(ev, HostEvent::Visibility { hidden: true });

        let ev: HostEvent = serde_json::from_str(r#"{"type":"storage-synced"}"#).unwrap();
        assert_eq!(ev, HostEvent::StorageSynced);

        let ev: HostEvent = serde_json::from_str(r#"{"type":"navigate","path":"/gdpr"}"#).unwrap();
        assert_eq!(ev.event_type(), "navigate");
    }

    #[test]
    fn rejects_unknown_event_type() {
        assert!(serde_json::from_str::<HostEvent>(r#"{"type":"resize"}"#).is_err());
    }
}
