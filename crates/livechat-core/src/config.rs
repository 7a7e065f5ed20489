//! Server-provided widget configuration and the props a mount starts from.
//!
//! The JSON shapes follow the livechat `config` endpoint (camelCase keys, `_id`
//! identifiers), so a fetched payload deserializes straight into these types.

use serde::{Deserialize, Serialize};

use crate::ids::TriggerId;
use crate::state::{Alert, Modal, SoundState};

/// Widget configuration as returned by the backend handshake.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LivechatConfig {
    pub enabled: bool,
    pub online: bool,
    pub settings: ConfigSettings,
    pub departments: Vec<Department>,
    pub triggers: Vec<TriggerDefinition>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigSettings {
    pub registration_form: bool,
    pub name_field_registration_form: bool,
    pub email_field_registration_form: bool,
    pub force_accept_data_processing_consent: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Department {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub show_on_registration: bool,
}

/// A configured automated-message rule.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDefinition {
    #[serde(rename = "_id")]
    pub id: TriggerId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub run_once: bool,
    #[serde(default)]
    pub conditions: Vec<TriggerCondition>,
    #[serde(default)]
    pub actions: Vec<TriggerAction>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionKind {
    PageUrl,
    TimeOnSite,
    ChatOpenedByVisitor,
    AfterGuestRegistration,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TriggerCondition {
    pub name: ConditionKind,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl TriggerCondition {
    /// Delay for `time-on-site`; the backend sends either a number or a numeric string.
    pub fn seconds(&self) -> Option<u64> {
        match self.value.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Pattern for `page-url`.
    pub fn pattern(&self) -> Option<&str> {
        self.value.as_ref()?.as_str()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    SendMessage,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerAction {
    pub name: ActionKind,
    #[serde(default)]
    pub params: MessageParams,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageSender {
    #[default]
    Queue,
    Custom,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageParams {
    #[serde(default)]
    pub sender: MessageSender,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GdprState {
    pub accepted: bool,
}

/// The visitor as known to the widget. A token means the visitor is registered.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Visitor {
    pub token: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IframeState {
    pub visible: bool,
}

impl Default for IframeState {
    fn default() -> Self {
        Self { visible: true }
    }
}

/// Everything a mount is constructed from.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WidgetProps {
    pub config: LivechatConfig,
    pub gdpr: GdprState,
    pub triggered: bool,
    pub user: Option<Visitor>,
    pub sound: SoundState,
    pub undocked: bool,
    pub minimized: bool,
    pub expanded: bool,
    pub alerts: Vec<Alert>,
    pub modal: Option<Modal>,
    pub iframe: IframeState,
    /// Location of the widget document; its query decides pop-out mode.
    pub location: String,
}
