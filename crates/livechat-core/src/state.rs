//! Widget-level UI state and its reducer.
//!
//! `SessionState` is owned by the orchestrator and only ever changed by applying a
//! `StatePatch`. Screens read it through the derived `ScreenProps`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::WidgetProps;
use crate::ids::AlertId;

/// Notification sound settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SoundState {
    pub enabled: bool,
    pub src: Option<String>,
    pub play: bool,
}

impl Default for SoundState {
    fn default() -> Self {
        Self {
            enabled: true,
            src: None,
            play: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Info,
    Success,
    Warning,
    Error,
}

/// A toast shown above the current screen until dismissed by id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: AlertId,
    pub message: String,
    pub kind: AlertKind,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            id: AlertId::new(),
            message: message.into(),
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(AlertKind::Error, message)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Modal {
    pub title: Option<String>,
    pub text: String,
    pub dismissable: bool,
}

/// The single source of truth for widget-level UI state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub initialized: bool,
    pub popped_out: bool,
    pub minimized: bool,
    pub undocked: bool,
    pub expanded: bool,
    pub visible: bool,
    pub triggered: bool,
    pub sound: SoundState,
    pub alerts: Vec<Alert>,
    pub modal: Option<Modal>,
}

impl SessionState {
    /// Fresh state for a new mount: never initialized, never popped out, the
    /// rest taken from the widget props.
    pub fn seeded(props: &WidgetProps) -> Self {
        Self {
            initialized: false,
            popped_out: false,
            minimized: props.minimized,
            undocked: props.undocked,
            expanded: props.expanded,
            visible: true,
            triggered: props.triggered,
            sound: props.sound.clone(),
            alerts: props.alerts.clone(),
            modal: props.modal.clone(),
        }
    }

    /// Merge a patch into the state. Returns whether anything changed.
    ///
    /// `initialized` is monotonic: a patch can raise it but never lower it.
    pub fn apply(&mut self, patch: StatePatch) -> bool {
        let before = self.clone();

        if patch.initialized == Some(true) {
            self.initialized = true;
        }
        if let Some(v) = patch.popped_out {
            self.popped_out = v;
        }
        if let Some(v) = patch.minimized {
            self.minimized = v;
        }
        if let Some(v) = patch.undocked {
            self.undocked = v;
        }
        if let Some(v) = patch.expanded {
            self.expanded = v;
        }
        if let Some(v) = patch.visible {
            self.visible = v;
        }
        if let Some(v) = patch.triggered {
            self.triggered = v;
        }
        if let Some(sound) = patch.sound {
            self.sound = sound;
        }
        if let Some(alerts) = patch.alerts {
            self.alerts = alerts;
        }
        if let Some(modal) = patch.modal {
            self.modal = modal;
        }

        *self != before
    }

    /// Props shared by every screen.
    pub fn screen_props(&self) -> ScreenProps {
        let minimized = !self.popped_out && (self.minimized || self.undocked);
        ScreenProps {
            notifications_enabled: self.sound.enabled,
            minimized,
            expanded: !self.minimized && self.expanded,
            windowed: !self.minimized && self.popped_out,
            sound: self.sound.clone(),
            alerts: self.alerts.clone(),
            modal: self.modal.clone(),
        }
    }

    /// Alerts with `id` removed, others in their original order.
    pub fn alerts_without(&self, id: &AlertId) -> Vec<Alert> {
        self.alerts.iter().filter(|a| &a.id != id).cloned().collect()
    }
}

/// A partial update to `SessionState`. Unset fields are left untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct StatePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub popped_out: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub undocked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<SoundState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts: Option<Vec<Alert>>,
    #[serde(skip)]
    pub modal: Option<Option<Modal>>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialized(mut self) -> Self {
        self.initialized = Some(true);
        self
    }

    pub fn popped_out(mut self, v: bool) -> Self {
        self.popped_out = Some(v);
        self
    }

    pub fn minimized(mut self, v: bool) -> Self {
        self.minimized = Some(v);
        self
    }

    pub fn undocked(mut self, v: bool) -> Self {
        self.undocked = Some(v);
        self
    }

    pub fn expanded(mut self, v: bool) -> Self {
        self.expanded = Some(v);
        self
    }

    pub fn visible(mut self, v: bool) -> Self {
        self.visible = Some(v);
        self
    }

    pub fn triggered(mut self, v: bool) -> Self {
        self.triggered = Some(v);
        self
    }

    pub fn sound(mut self, sound: SoundState) -> Self {
        self.sound = Some(sound);
        self
    }

    pub fn alerts(mut self, alerts: Vec<Alert>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn modal(mut self, modal: Option<Modal>) -> Self {
        self.modal = Some(modal);
        self
    }
}

/// The shared props object handed to whichever screen is mounted.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScreenProps {
    pub notifications_enabled: bool,
    pub minimized: bool,
    pub expanded: bool,
    pub windowed: bool,
    pub sound: SoundState,
    pub alerts: Vec<Alert>,
    pub modal: Option<Modal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::seeded(&WidgetProps::default())
    }

    #[test]
    fn seeded_state_is_uninitialized() {
        let props = WidgetProps {
            minimized: true,
            expanded: true,
            ..Default::default()
        };
        let s = SessionState::seeded(&props);
        assert!(!s.initialized);
        assert!(!s.popped_out);
        assert!(s.minimized);
        assert!(s.expanded);
    }

    #[test]
    fn initialized_never_reverts() {
        let mut s = state();
        assert!(s.apply(StatePatch::new().initialized()));
        assert!(s.initialized);

        let patch = StatePatch {
            initialized: Some(false),
            ..Default::default()
        };
        assert!(!s.apply(patch));
        assert!(s.initialized);
    }

    #[test]
    fn apply_touches_only_set_fields() {
        let mut s = state();
        s.expanded = true;
        let changed = s.apply(StatePatch::new().minimized(true).undocked(false));
        assert!(changed);
        assert!(s.minimized);
        assert!(!s.undocked);
        assert!(s.expanded);
    }

    #[test]
    fn apply_reports_no_change() {
        let mut s = state();
        let minimized = s.minimized;
        assert!(!s.apply(StatePatch::new().minimized(minimized)));
        assert!(!s.apply(StatePatch::new()));
    }

    #[test]
    fn modal_can_be_cleared() {
        let mut s = state();
        s.apply(StatePatch::new().modal(Some(Modal {
            title: None,
            text: "Chat ended".into(),
            dismissable: true,
        })));
        assert!(s.modal.is_some());
        s.apply(StatePatch::new().modal(None));
        assert!(s.modal.is_none());
    }

    #[test]
    fn alerts_without_keeps_order() {
        let mut s = state();
        let a = Alert::error("a");
        let b = Alert::new(AlertKind::Info, "b");
        let c = Alert::new(AlertKind::Warning, "c");
        s.alerts = vec![a.clone(), b.clone(), c.clone()];

        assert_eq!(s.alerts_without(&b.id), vec![a.clone(), c.clone()]);
        assert_eq!(s.alerts_without(&AlertId::new()), vec![a, b, c]);
    }

    #[test]
    fn screen_props_minimized_when_undocked() {
        let mut s = state();
        s.undocked = true;
        assert!(s.screen_props().minimized);

        s.popped_out = true;
        assert!(!s.screen_props().minimized);
    }

    #[test]
    fn screen_props_expanded_and_windowed_need_restored_widget() {
        let mut s = state();
        s.expanded = true;
        s.popped_out = true;
        s.minimized = false;
        let props = s.screen_props();
        assert!(props.expanded);
        assert!(props.windowed);

        s.minimized = true;
        let props = s.screen_props();
        assert!(!props.expanded);
        assert!(!props.windowed);
    }

    #[test]
    fn screen_props_notifications_follow_sound() {
        let mut s = state();
        s.sound.enabled = false;
        assert!(!s.screen_props().notifications_enabled);
    }

    #[test]
    fn patch_serializes_only_set_fields() {
        let patch = StatePatch::new().minimized(true).undocked(false);
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({"minimized": true, "undocked": false}));
    }
}
