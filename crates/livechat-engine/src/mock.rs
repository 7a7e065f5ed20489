//! Test doubles for driving a session without a backend or host frame.
//!
//! Every double writes `"<subsystem>.<call>"` entries into a shared [`CallLog`],
//! so tests can assert on the cross-subsystem call order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use livechat_core::commands::HostMessage;
use livechat_core::config::{ConditionKind, LivechatConfig};
use livechat_core::errors::{BridgeError, ConnectionError, SubsystemError};
use livechat_core::lifecycle::Subsystem;

use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::custom_fields::{CustomFieldStore, FieldWrite};
use crate::host_bridge::HostTransport;
use crate::presence::{PresenceService, PresenceStatus};
use crate::triggers::{Evaluation, TriggerFired, TriggerHandler, TriggerService};

/// Ordered record of lifecycle calls, shared between doubles.
#[derive(Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries.lock().iter().filter(|e| *e == entry).count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }
}

/// Connection double with a fixed outcome and an optional gate that holds
/// `init` until released.
pub struct MockConnection {
    log: CallLog,
    outcome: Result<LivechatConfig, ConnectionError>,
    gate: Option<Arc<Notify>>,
    session: Mutex<(ConnectionStatus, Option<LivechatConfig>)>,
}

impl MockConnection {
    pub fn ready(config: LivechatConfig, log: CallLog) -> Self {
        Self::with_outcome(Ok(config), log, None)
    }

    pub fn failing(error: ConnectionError, log: CallLog) -> Self {
        Self::with_outcome(Err(error), log, None)
    }

    /// `init` blocks until the returned `Notify` is signalled.
    pub fn gated(config: LivechatConfig, log: CallLog) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (Self::with_outcome(Ok(config), log, Some(Arc::clone(&gate))), gate)
    }

    fn with_outcome(
        outcome: Result<LivechatConfig, ConnectionError>,
        log: CallLog,
        gate: Option<Arc<Notify>>,
    ) -> Self {
        Self {
            log,
            outcome,
            gate,
            session: Mutex::new((ConnectionStatus::Idle, None)),
        }
    }
}

impl ConnectionManager for MockConnection {
    fn status(&self) -> ConnectionStatus {
        self.session.lock().0
    }

    fn config(&self) -> Option<LivechatConfig> {
        self.session.lock().1.clone()
    }
}

#[async_trait]
impl Subsystem for MockConnection {
    fn name(&self) -> &'static str {
        "connection"
    }

    async fn init(&self) -> Result<(), SubsystemError> {
        self.log.record("connection.init");
        self.session.lock().0 = ConnectionStatus::Connecting;
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let mut session = self.session.lock();
        match &self.outcome {
            Ok(config) => {
                *session = (ConnectionStatus::Ready, Some(config.clone()));
                Ok(())
            }
            Err(e) => {
                session.0 = ConnectionStatus::Failed;
                Err(SubsystemError::Connection {
                    subsystem: "connection",
                    source: e.clone(),
                })
            }
        }
    }

    async fn reset(&self) -> Result<(), SubsystemError> {
        self.log.record("connection.reset");
        *self.session.lock() = (ConnectionStatus::Idle, None);
        Ok(())
    }
}

/// Records every call and stands in for custom fields, presence or triggers.
pub struct RecordingSubsystem {
    name: &'static str,
    log: CallLog,
    fail_init: bool,
    fail_reset: bool,
    gate: Option<Arc<Notify>>,
    fields: Mutex<BTreeMap<String, String>>,
    visitor: Mutex<Option<String>>,
    touches: AtomicUsize,
    handlers: Mutex<Vec<Arc<dyn TriggerHandler>>>,
    events: Mutex<Vec<ConditionKind>>,
}

impl RecordingSubsystem {
    pub fn new(name: &'static str, log: CallLog) -> Self {
        Self {
            name,
            log,
            fail_init: false,
            fail_reset: false,
            gate: None,
            fields: Mutex::new(BTreeMap::new()),
            visitor: Mutex::new(None),
            touches: AtomicUsize::new(0),
            handlers: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn failing_reset(mut self) -> Self {
        self.fail_reset = true;
        self
    }

    /// `init` blocks until the returned `Notify` is signalled.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn touches(&self) -> usize {
        self.touches.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<ConditionKind> {
        self.events.lock().clone()
    }

    pub fn visitor(&self) -> Option<String> {
        self.visitor.lock().clone()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Hand `fired` to every registered handler, as a real engine would.
    pub async fn fire(&self, fired: &TriggerFired) {
        let handlers: Vec<Arc<dyn TriggerHandler>> = self.handlers.lock().clone();
        for handler in handlers {
            let _ = handler.on_fired(fired).await;
        }
    }
}

#[async_trait]
impl Subsystem for RecordingSubsystem {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn init(&self) -> Result<(), SubsystemError> {
        self.log.record(format!("{}.init", self.name));
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail_init {
            return Err(SubsystemError::failed(self.name, "init failed"));
        }
        Ok(())
    }

    async fn reset(&self) -> Result<(), SubsystemError> {
        self.log.record(format!("{}.reset", self.name));
        if self.fail_reset {
            return Err(SubsystemError::failed(self.name, "reset failed"));
        }
        Ok(())
    }
}

impl CustomFieldStore for RecordingSubsystem {
    fn set_field(&self, key: &str, value: &str, overwrite: bool) -> FieldWrite {
        let mut fields = self.fields.lock();
        if !overwrite && fields.contains_key(key) {
            return FieldWrite::Kept;
        }
        let _ = fields.insert(key.to_string(), value.to_string());
        FieldWrite::Stored
    }

    fn attach_visitor(&self, token: &str) {
        self.log.record(format!("{}.attach_visitor", self.name));
        *self.visitor.lock() = Some(token.to_string());
    }

    fn get(&self, key: &str) -> Option<String> {
        self.fields.lock().get(key).cloned()
    }
}

impl PresenceService for RecordingSubsystem {
    fn touch(&self) {
        let _ = self.touches.fetch_add(1, Ordering::SeqCst);
    }

    fn status(&self) -> PresenceStatus {
        PresenceStatus::Online
    }
}

#[async_trait]
impl TriggerService for RecordingSubsystem {
    fn register(&self, handler: Arc<dyn TriggerHandler>) {
        self.handlers.lock().push(handler);
    }

    fn unregister(&self, handler: &Arc<dyn TriggerHandler>) -> bool {
        self.log.record(format!("{}.unregister", self.name));
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        handlers.len() != before
    }

    async fn evaluate(
        &self,
        _config: &LivechatConfig,
        _location: &str,
    ) -> Result<Evaluation, SubsystemError> {
        self.log.record(format!("{}.evaluate", self.name));
        Ok(Evaluation::default())
    }

    async fn handle_event(&self, kind: ConditionKind) -> usize {
        self.events.lock().push(kind);
        0
    }
}

/// Host transport that keeps every posted message.
pub struct RecordingTransport {
    messages: Mutex<Vec<HostMessage>>,
    fail: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// Rejects every message, as a detached host would.
    pub fn failing() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Function names of the delivered messages, in order.
    pub fn commands(&self) -> Vec<String> {
        self.messages.lock().iter().map(|m| m.function.clone()).collect()
    }

    pub fn messages(&self) -> Vec<HostMessage> {
        self.messages.lock().clone()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTransport for RecordingTransport {
    fn post(&self, message: &HostMessage) -> Result<(), BridgeError> {
        if self.fail {
            return Err(BridgeError::ChannelClosed);
        }
        self.messages.lock().push(message.clone());
        Ok(())
    }
}
