use serde::Serialize;

use livechat_core::config::{LivechatConfig, Visitor};
use livechat_core::state::ScreenProps;

/// Screens the widget can show, one per path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Route {
    /// `/`: the chat itself.
    #[default]
    Connector,
    ChatFinished,
    Gdpr,
    LeaveMessage,
    Register,
    SwitchDepartment,
    TriggerMessages,
}

impl Route {
    /// Resolve a path; unknown paths fall back to the chat screen.
    pub fn resolve(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let path = path.trim_end_matches('/');
        match path {
            "/chat-finished" => Self::ChatFinished,
            "/gdpr" => Self::Gdpr,
            "/leave-message" => Self::LeaveMessage,
            "/register" => Self::Register,
            "/switch-department" => Self::SwitchDepartment,
            "/trigger-messages" => Self::TriggerMessages,
            _ => Self::Connector,
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Self::Connector => "/",
            Self::ChatFinished => "/chat-finished",
            Self::Gdpr => "/gdpr",
            Self::LeaveMessage => "/leave-message",
            Self::Register => "/register",
            Self::SwitchDepartment => "/switch-department",
            Self::TriggerMessages => "/trigger-messages",
        }
    }
}

/// The mounted screen and the props it renders from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Screen {
    pub route: Route,
    pub path: &'static str,
    pub props: ScreenProps,
}

impl Screen {
    pub fn new(route: Route, props: ScreenProps) -> Self {
        Self {
            route,
            path: route.path(),
            props,
        }
    }
}

/// What the route guard sees on every navigation.
pub struct RouteContext<'a> {
    pub config: &'a LivechatConfig,
    pub gdpr_accepted: bool,
    pub triggered: bool,
    pub user: Option<&'a Visitor>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteDecision {
    pub redirect: Option<Route>,
    /// Host callback to fire alongside the redirect.
    pub callback: Option<&'static str>,
}

/// Decide whether a navigation must be redirected.
///
/// Consent comes first, then agent availability, then registration.
pub fn route_guard(ctx: &RouteContext<'_>) -> RouteDecision {
    let settings = &ctx.config.settings;

    if settings.force_accept_data_processing_consent && !ctx.gdpr_accepted {
        return RouteDecision {
            redirect: Some(Route::Gdpr),
            callback: None,
        };
    }

    if !ctx.config.online {
        return RouteDecision {
            redirect: Some(Route::LeaveMessage),
            callback: Some("no-agent-online"),
        };
    }

    let show_department = ctx.config.departments.iter().any(|d| d.show_on_registration);
    let has_token = ctx.user.is_some_and(|u| u.token.is_some());
    let show_registration = settings.registration_form
        && (settings.name_field_registration_form
            || settings.email_field_registration_form
            || show_department)
        && !ctx.triggered
        && !has_token;
    if show_registration {
        return RouteDecision {
            redirect: Some(Route::Register),
            callback: None,
        };
    }

    RouteDecision::default()
}
