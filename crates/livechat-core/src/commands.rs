use serde::{Deserialize, Serialize};

/// Source tag the host page filters widget messages by.
pub const MESSAGE_SOURCE: &str = "rocketchat";

/// Outbound, fire-and-forget commands from the widget to the host frame.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HostCommand {
    MinimizeWindow,
    RestoreWindow,
    ShowWidget,
    HideWidget,
    /// Sent exactly once, after initialization completes.
    Ready,
    OpenPopout,
    /// Named callback the host page may subscribe to (e.g. `no-agent-online`).
    Callback(String),
}

impl HostCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MinimizeWindow => "minimizeWindow",
            Self::RestoreWindow => "restoreWindow",
            Self::ShowWidget => "showWidget",
            Self::HideWidget => "hideWidget",
            Self::Ready => "ready",
            Self::OpenPopout => "openPopout",
            Self::Callback(_) => "callback",
        }
    }

    pub fn args(&self) -> Vec<serde_json::Value> {
        match self {
            Self::Callback(name) => vec![serde_json::Value::String(name.clone())],
            _ => Vec::new(),
        }
    }

    pub fn minimize_or_restore(minimized: bool) -> Self {
        if minimized {
            Self::MinimizeWindow
        } else {
            Self::RestoreWindow
        }
    }

    pub fn show_or_hide(visible: bool) -> Self {
        if visible {
            Self::ShowWidget
        } else {
            Self::HideWidget
        }
    }

    pub fn to_message(&self) -> HostMessage {
        HostMessage {
            src: MESSAGE_SOURCE.to_string(),
            function: self.name().to_string(),
            args: self.args(),
        }
    }
}

impl std::fmt::Display for HostCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callback(name) => write!(f, "callback({name})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Wire form of a host command, as posted to the embedding page.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostMessage {
    pub src: String,
    #[serde(rename = "fn")]
    pub function: String,
    pub args: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_matches_host_contract() {
        let json = serde_json::to_value(HostCommand::MinimizeWindow.to_message()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"src": "rocketchat", "fn": "minimizeWindow", "args": []})
        );
    }

    #[test]
    fn callback_carries_its_name() {
        let msg = HostCommand::Callback("no-agent-online".into()).to_message();
        assert_eq!(msg.function, "callback");
        assert_eq!(msg.args, vec![serde_json::json!("no-agent-online")]);
    }

    #[test]
    fn state_selectors() {
        assert_eq!(HostCommand::minimize_or_restore(true), HostCommand::MinimizeWindow);
        assert_eq!(HostCommand::minimize_or_restore(false), HostCommand::RestoreWindow);
        assert_eq!(HostCommand::show_or_hide(true), HostCommand::ShowWidget);
        assert_eq!(HostCommand::show_or_hide(false), HostCommand::HideWidget);
    }

    #[test]
    fn display_names() {
        assert_eq!(HostCommand::Ready.to_string(), "ready");
        assert_eq!(HostCommand::Callback("x".into()).to_string(), "callback(x)");
    }
}
