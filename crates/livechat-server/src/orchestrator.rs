//! Session lifecycle for one widget mount.
//!
//! `mount` brings the session from uninitialized to ready:
//! 1. connection handshake (the only fatal step)
//! 2. custom fields, 3. presence, 4. triggers (evaluation runs in the background)
//! 5. window commands to the host (`minimizeWindow`/`restoreWindow`, then
//!    `showWidget`/`hideWidget`)
//! 6. visibility listener, 7. unload handler
//! 8. pop-out detection
//! 9. `initialized`, then `ready` to the host
//!
//! Teardown may run at any await point of `mount`. After every await the phase is
//! checked: once torn down the sequence stops, and a subsystem whose `init`
//! finished after teardown is reset on the spot.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

use livechat_core::commands::HostCommand;
use livechat_core::config::{ConditionKind, LivechatConfig, WidgetProps};
use livechat_core::errors::SubsystemError;
use livechat_core::events::{HostEvent, Visibility};
use livechat_core::ids::{AlertId, MountId};
use livechat_core::state::{Alert, SessionState, StatePatch};
use livechat_engine::{
    is_popped_out, ConnectionManager, CustomFieldStore, FieldWrite, HostBridge, ListenerId,
    PresenceService, TriggerFired, TriggerHandler, TriggerService, VisibilityWatcher,
};

use crate::router::{route_guard, Route, RouteContext, Screen};

static DISPATCHERS: AtomicU64 = AtomicU64::new(1);

/// The services a session coordinates.
pub struct Subsystems {
    pub connection: Arc<dyn ConnectionManager>,
    pub custom_fields: Arc<dyn CustomFieldStore>,
    pub presence: Arc<dyn PresenceService>,
    pub triggers: Arc<dyn TriggerService>,
    pub visibility: Arc<VisibilityWatcher>,
    pub bridge: Arc<HostBridge>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    Initializing,
    Ready,
    /// The connection handshake failed; the widget stays inert.
    Failed,
    TornDown,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("session initialization failed: {0}")]
    Init(#[from] SubsystemError),
    #[error("session is already mounted")]
    AlreadyMounted,
    #[error("session was torn down")]
    TornDown,
}

/// Owner of `SessionState`; every change goes through `dispatch`.
struct StateStore {
    /// Identity of this dispatcher, part of the listener fingerprint.
    generation: u64,
    state: Mutex<SessionState>,
    tx: watch::Sender<SessionState>,
}

impl StateStore {
    fn new(initial: SessionState) -> Self {
        let (tx, _) = watch::channel(initial.clone());
        Self {
            generation: DISPATCHERS.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(initial),
            tx,
        }
    }

    fn dispatch(&self, patch: StatePatch) -> bool {
        self.dispatch_with(|_| patch)
    }

    /// Build the patch from the current state under the store lock.
    fn dispatch_with(&self, build: impl FnOnce(&SessionState) -> StatePatch) -> bool {
        let mut state = self.state.lock();
        let patch = build(&state);
        let changed = state.apply(patch);
        if changed {
            let _ = self.tx.send_replace(state.clone());
        }
        changed
    }

    fn snapshot(&self) -> SessionState {
        self.state.lock().clone()
    }
}

/// Dependencies the visibility callback captures when registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ListenerFingerprint {
    dispatcher: u64,
    minimized: bool,
    iframe_visible: bool,
}

struct ActiveListener {
    id: ListenerId,
    fingerprint: ListenerFingerprint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnloadHandler {
    Unregistered,
    Armed,
    Fired,
}

struct Inner {
    mount_id: MountId,
    subsystems: Subsystems,
    props: RwLock<WidgetProps>,
    store: StateStore,
    phase: Mutex<Phase>,
    route: Mutex<Route>,
    listener: Mutex<Option<ActiveListener>>,
    unload: Mutex<UnloadHandler>,
    restore_pending: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
    /// Registered with the trigger service for the life of the session.
    route_handler: Arc<dyn TriggerHandler>,
}

/// Drives one widget mount. Clones share the same session.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    pub fn new(props: WidgetProps, subsystems: Subsystems) -> Self {
        let store = StateStore::new(SessionState::seeded(&props));
        let inner = Arc::new_cyclic(|weak| Inner {
            mount_id: MountId::new(),
            subsystems,
            props: RwLock::new(props),
            store,
            phase: Mutex::new(Phase::Created),
            route: Mutex::new(Route::Connector),
            listener: Mutex::new(None),
            unload: Mutex::new(UnloadHandler::Unregistered),
            restore_pending: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
            route_handler: Arc::new(TriggerRouteHandler {
                inner: Weak::clone(weak),
            }),
        });
        inner
            .subsystems
            .triggers
            .register(Arc::clone(&inner.route_handler));
        Self { inner }
    }

    pub fn mount_id(&self) -> &MountId {
        &self.inner.mount_id
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.lock()
    }

    pub fn state(&self) -> SessionState {
        self.inner.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.store.tx.subscribe()
    }

    pub fn route(&self) -> Route {
        *self.inner.route.lock()
    }

    pub fn listener_id(&self) -> Option<ListenerId> {
        self.inner.listener.lock().as_ref().map(|l| l.id)
    }

    /// Run the initialization sequence. Fails only when the connection does, or
    /// when the session is already mounted or torn down.
    pub async fn mount(&self) -> Result<(), OrchestratorError> {
        {
            let mut phase = self.inner.phase.lock();
            match *phase {
                Phase::Created => *phase = Phase::Initializing,
                Phase::TornDown => return Err(OrchestratorError::TornDown),
                _ => return Err(OrchestratorError::AlreadyMounted),
            }
        }
        let span = tracing::info_span!("mount", mount_id = %self.inner.mount_id);
        self.run_mount().instrument(span).await
    }

    async fn run_mount(&self) -> Result<(), OrchestratorError> {
        let inner = &self.inner;
        let subs = &inner.subsystems;

        if let Err(e) = subs.connection.init().await {
            if inner.is_torn_down() {
                debug!(error = %e, "connection failed after teardown");
                return Err(OrchestratorError::TornDown);
            }
            {
                let mut phase = inner.phase.lock();
                if *phase == Phase::Initializing {
                    *phase = Phase::Failed;
                }
            }
            error!(subsystem = subs.connection.name(), error = %e, "session initialization failed");
            return Err(OrchestratorError::Init(e));
        }
        inner
            .checkpoint(subs.connection.name(), subs.connection.reset())
            .await?;

        log_init(subs.custom_fields.name(), subs.custom_fields.init().await);
        inner
            .checkpoint(subs.custom_fields.name(), subs.custom_fields.reset())
            .await?;
        if let Some(token) = inner.visitor_token() {
            subs.custom_fields.attach_visitor(&token);
        }

        log_init(subs.presence.name(), subs.presence.init().await);
        inner
            .checkpoint(subs.presence.name(), subs.presence.reset())
            .await?;

        log_init(subs.triggers.name(), subs.triggers.init().await);
        inner
            .checkpoint(subs.triggers.name(), subs.triggers.reset())
            .await?;
        inner.spawn_trigger_evaluation();

        let (iframe_visible, location) = {
            let props = inner.props.read();
            (props.iframe.visible, props.location.clone())
        };
        let minimized = inner.store.snapshot().minimized;
        subs.bridge.send(HostCommand::minimize_or_restore(minimized));
        subs.bridge.send(HostCommand::show_or_hide(iframe_visible));

        inner.reconcile_listener();
        *inner.unload.lock() = UnloadHandler::Armed;

        let popped_out = is_popped_out(&location);
        let mut patch = StatePatch::new().popped_out(popped_out);
        if popped_out {
            patch = patch.minimized(false);
        }
        let _ = inner.store.dispatch(patch);

        let ready = {
            let mut phase = inner.phase.lock();
            if *phase == Phase::Initializing {
                *phase = Phase::Ready;
                true
            } else {
                false
            }
        };
        if !ready {
            inner.remove_listener();
            return Err(OrchestratorError::TornDown);
        }
        let _ = inner.store.dispatch(StatePatch::new().initialized());
        subs.bridge.send(HostCommand::Ready);
        info!(popped_out, "session ready");

        inner.apply_route_guard();
        Ok(())
    }

    /// Reset every subsystem and drop the visibility listener. Safe to call any
    /// number of times, before or during `mount`.
    pub async fn teardown(&self) {
        let inner = &self.inner;
        let previous = std::mem::replace(&mut *inner.phase.lock(), Phase::TornDown);
        if previous == Phase::TornDown {
            debug!(mount_id = %inner.mount_id, "teardown: already torn down");
            return;
        }
        info!(mount_id = %inner.mount_id, from = ?previous, "tearing down session");

        for task in inner.background.lock().drain(..) {
            task.abort();
        }
        inner.restore_pending.store(false, Ordering::SeqCst);

        let subs = &inner.subsystems;
        reset_isolated(subs.custom_fields.name(), subs.custom_fields.reset()).await;
        reset_isolated(subs.presence.name(), subs.presence.reset()).await;
        inner.remove_listener();
        reset_isolated(subs.triggers.name(), subs.triggers.reset()).await;
        if !subs.triggers.unregister(&inner.route_handler) {
            debug!("trigger route handler was not registered");
        }
        reset_isolated(subs.connection.name(), subs.connection.reset()).await;
    }

    /// The screen to show, or nothing until the session is initialized.
    pub fn render(&self) -> Option<Screen> {
        if self.phase() == Phase::TornDown {
            return None;
        }
        let state = self.inner.store.snapshot();
        if !state.initialized {
            return None;
        }
        Some(Screen::new(self.route(), state.screen_props()))
    }

    pub fn actions(&self) -> ScreenActions {
        ScreenActions {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Navigate to `path` and run the route guard. Ignored until initialized.
    pub fn navigate(&self, path: &str) -> Option<Route> {
        if !self.inner.store.snapshot().initialized || self.inner.is_torn_down() {
            return None;
        }
        *self.inner.route.lock() = Route::resolve(path);
        self.inner.apply_route_guard();
        Some(self.route())
    }

    /// New props from the embedding page. Window props flow into the session
    /// state first; host commands follow the state, never the raw props.
    pub fn update_props(&self, props: WidgetProps) {
        let inner = &self.inner;
        let new_token = props.user.as_ref().and_then(|u| u.token.clone());
        let (minimized, undocked, expanded, iframe_visible) =
            (props.minimized, props.undocked, props.expanded, props.iframe.visible);
        let previous = std::mem::replace(&mut *inner.props.write(), props);
        let old_token = previous.user.as_ref().and_then(|u| u.token.clone());

        let phase = self.phase();
        if phase == Phase::TornDown {
            return;
        }
        if matches!(phase, Phase::Initializing | Phase::Ready) && new_token != old_token {
            if let Some(token) = &new_token {
                inner.subsystems.custom_fields.attach_visitor(token);
            }
        }

        let mut window = (false, false);
        let _ = inner.store.dispatch_with(|state| {
            let mut patch = StatePatch::new();
            if previous.minimized != minimized {
                // A pop-out window never minimizes.
                patch = patch.minimized(minimized && !state.popped_out);
            }
            if previous.undocked != undocked {
                patch = patch.undocked(undocked);
            }
            if previous.expanded != expanded {
                patch = patch.expanded(expanded);
            }
            window = (state.minimized, patch.minimized.unwrap_or(state.minimized));
            patch
        });
        let (was_minimized, now_minimized) = window;

        if phase != Phase::Ready {
            return;
        }
        if was_minimized != now_minimized {
            inner
                .subsystems
                .bridge
                .send(HostCommand::minimize_or_restore(now_minimized));
        }
        if previous.iframe.visible != iframe_visible {
            inner
                .subsystems
                .bridge
                .send(HostCommand::show_or_hide(iframe_visible));
        }
        inner.reconcile_listener();
    }

    /// Route an inbound host-frame event.
    pub fn handle_host_event(&self, event: HostEvent) {
        debug!(mount_id = %self.inner.mount_id, event = event.event_type(), "host event");
        match event {
            HostEvent::Visibility { hidden } => {
                let _ = self.inner.subsystems.visibility.notify(hidden);
            }
            HostEvent::Unload => self.handle_unload(),
            HostEvent::Navigate { path } => {
                let _ = self.navigate(&path);
            }
            HostEvent::StorageSynced => self.handle_storage_synced(),
            HostEvent::Activity => self.inner.subsystems.presence.touch(),
        }
    }

    /// The widget window is unloading. Fires at most once, and only after
    /// `mount` registered the handler.
    pub fn handle_unload(&self) {
        {
            let mut unload = self.inner.unload.lock();
            match *unload {
                UnloadHandler::Armed => *unload = UnloadHandler::Fired,
                UnloadHandler::Unregistered => {
                    debug!("unload before handler registration, ignoring");
                    return;
                }
                UnloadHandler::Fired => return,
            }
        }
        self.inner.remove_listener();
        self.inner.restore_pending.store(false, Ordering::SeqCst);
        let _ = self
            .inner
            .store
            .dispatch(StatePatch::new().minimized(true).undocked(false));
    }

    /// Shared storage caught up after the pop-out closed; completes a deferred restore.
    pub fn handle_storage_synced(&self) {
        if self.inner.restore_pending.swap(false, Ordering::SeqCst) {
            let _ = self
                .inner
                .store
                .dispatch(StatePatch::new().minimized(false).undocked(false));
        }
    }

    pub fn set_custom_field(&self, key: &str, value: &str, overwrite: bool) -> FieldWrite {
        self.inner
            .subsystems
            .custom_fields
            .set_field(key, value, overwrite)
    }

    /// Surface a user-visible problem as an alert.
    pub fn push_alert(&self, alert: Alert) {
        let _ = self.inner.store.dispatch_with(|state| {
            let mut alerts = state.alerts.clone();
            alerts.push(alert);
            StatePatch::new().alerts(alerts)
        });
    }
}

impl Inner {
    fn is_torn_down(&self) -> bool {
        *self.phase.lock() == Phase::TornDown
    }

    /// Stop the sequence if torn down, resetting the subsystem that just finished.
    async fn checkpoint(
        &self,
        subsystem: &'static str,
        reset: impl Future<Output = Result<(), SubsystemError>>,
    ) -> Result<(), OrchestratorError> {
        if !self.is_torn_down() {
            return Ok(());
        }
        warn!(subsystem, "torn down during initialization, resetting late subsystem");
        reset_isolated(subsystem, reset).await;
        Err(OrchestratorError::TornDown)
    }

    fn visitor_token(&self) -> Option<String> {
        self.props.read().user.as_ref().and_then(|u| u.token.clone())
    }

    fn effective_config(&self) -> LivechatConfig {
        self.subsystems
            .connection
            .config()
            .unwrap_or_else(|| self.props.read().config.clone())
    }

    fn spawn_trigger_evaluation(&self) {
        let triggers = Arc::clone(&self.subsystems.triggers);
        let config = self.effective_config();
        let location = self.props.read().location.clone();
        let task = tokio::spawn(
            async move {
                match triggers.evaluate(&config, &location).await {
                    Ok(evaluation) => debug!(?evaluation, "trigger evaluation finished"),
                    Err(e) => warn!(subsystem = "triggers", error = %e, "trigger evaluation failed"),
                }
            }
            .in_current_span(),
        );
        let mut background = self.background.lock();
        background.retain(|t| !t.is_finished());
        background.push(task);
    }

    fn fingerprint(&self) -> ListenerFingerprint {
        ListenerFingerprint {
            dispatcher: self.store.generation,
            minimized: self.store.state.lock().minimized,
            iframe_visible: self.props.read().iframe.visible,
        }
    }

    /// Make sure exactly one listener, built for the current fingerprint, is registered.
    fn reconcile_listener(self: &Arc<Self>) {
        let fingerprint = self.fingerprint();
        let mut active = self.listener.lock();
        if self.is_torn_down() {
            return;
        }
        if active.as_ref().is_some_and(|l| l.fingerprint == fingerprint) {
            return;
        }
        if let Some(old) = active.take() {
            let _ = self.subsystems.visibility.remove_listener(old.id);
        }

        let weak = Arc::downgrade(self);
        let id = self
            .subsystems
            .visibility
            .add_listener(Arc::new(move |visibility: Visibility| {
                if let Some(inner) = weak.upgrade() {
                    trace!(?fingerprint, ?visibility, "visibility listener");
                    inner.on_visibility(visibility);
                }
            }));
        *active = Some(ActiveListener { id, fingerprint });
    }

    fn remove_listener(&self) {
        if let Some(listener) = self.listener.lock().take() {
            let _ = self.subsystems.visibility.remove_listener(listener.id);
        }
    }

    fn on_visibility(&self, visibility: Visibility) {
        let visible = !visibility.is_hidden();
        let _ = self.store.dispatch(StatePatch::new().visible(visible));
        if visible {
            self.subsystems.presence.touch();
        }
    }

    fn apply_route_guard(&self) {
        let config = self.effective_config();
        let state_triggered = self.store.snapshot().triggered;
        let decision = {
            let props = self.props.read();
            route_guard(&RouteContext {
                config: &config,
                gdpr_accepted: props.gdpr.accepted,
                triggered: props.triggered || state_triggered,
                user: props.user.as_ref(),
            })
        };
        if let Some(callback) = decision.callback {
            self.subsystems
                .bridge
                .send(HostCommand::Callback(callback.to_string()));
        }
        if let Some(route) = decision.redirect {
            debug!(to = route.path(), "route guard redirect");
            *self.route.lock() = route;
        }
    }
}

fn log_init(subsystem: &'static str, result: Result<(), SubsystemError>) {
    match result {
        Ok(()) => debug!(subsystem, "subsystem initialized"),
        Err(e) => warn!(subsystem, error = %e, "subsystem init failed, continuing"),
    }
}

async fn reset_isolated(
    subsystem: &'static str,
    reset: impl Future<Output = Result<(), SubsystemError>>,
) {
    if let Err(e) = reset.await {
        warn!(subsystem, error = %e, "subsystem reset failed");
    }
}

/// Actions every screen receives, bound to the session's dispatcher.
#[derive(Clone)]
pub struct ScreenActions {
    inner: Arc<Inner>,
}

impl ScreenActions {
    pub fn enable_notifications(&self) {
        self.set_sound_enabled(true);
    }

    pub fn disable_notifications(&self) {
        self.set_sound_enabled(false);
    }

    fn set_sound_enabled(&self, enabled: bool) {
        let _ = self.inner.store.dispatch_with(|state| {
            let mut sound = state.sound.clone();
            sound.enabled = enabled;
            StatePatch::new().sound(sound)
        });
    }

    pub fn minimize(&self) {
        self.inner.subsystems.bridge.send(HostCommand::MinimizeWindow);
        let _ = self.inner.store.dispatch(StatePatch::new().minimized(true));
    }

    /// Restore the widget. An undocked session stays undocked until the host
    /// reports `storage-synced`.
    pub async fn restore(&self) {
        self.inner.subsystems.bridge.send(HostCommand::RestoreWindow);
        if self.inner.store.snapshot().undocked {
            debug!("restore deferred until storage sync");
            self.inner.restore_pending.store(true, Ordering::SeqCst);
        } else {
            let _ = self
                .inner
                .store
                .dispatch(StatePatch::new().minimized(false).undocked(false));
        }
        let _ = self
            .inner
            .subsystems
            .triggers
            .handle_event(ConditionKind::ChatOpenedByVisitor)
            .await;
    }

    /// Move the chat into a pop-out window.
    pub fn open_window(&self) {
        self.inner.subsystems.bridge.send(HostCommand::OpenPopout);
        let _ = self
            .inner
            .store
            .dispatch(StatePatch::new().undocked(true).minimized(false));
    }

    /// Remove the alert with `id`; other alerts keep their order.
    pub fn dismiss_alert(&self, id: &AlertId) {
        let _ = self
            .inner
            .store
            .dispatch_with(|state| StatePatch::new().alerts(state.alerts_without(id)));
    }
}

/// Shows fired trigger messages: marks the session triggered and routes to them.
struct TriggerRouteHandler {
    inner: Weak<Inner>,
}

#[async_trait]
impl TriggerHandler for TriggerRouteHandler {
    fn name(&self) -> &str {
        "trigger-router"
    }

    async fn on_fired(&self, fired: &TriggerFired) -> Result<(), SubsystemError> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        if inner.is_torn_down() {
            return Ok(());
        }
        let _ = inner.store.dispatch(StatePatch::new().triggered(true));
        *inner.route.lock() = Route::TriggerMessages;
        info!(trigger = %fired.trigger_id, "showing trigger message");
        Ok(())
    }
}
