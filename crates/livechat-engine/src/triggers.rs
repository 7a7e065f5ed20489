//! Automated-message triggers.
//!
//! A trigger fires when any one of its conditions is met:
//! - `page-url`: the pattern (a regex) matches the widget location at evaluation
//! - `time-on-site`: the configured number of seconds elapses after evaluation
//! - `chat-opened-by-visitor` / `after-guest-registration`: the matching event is
//!   reported through [`TriggerService::handle_event`]
//!
//! Each `send-message` action of a fired trigger becomes one [`TriggerFired`]
//! handed to every registered [`TriggerHandler`]. Handlers run with a timeout
//! behind a per-handler circuit breaker, so a broken handler cannot stall the
//! widget.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use livechat_core::config::{
    ActionKind, ConditionKind, LivechatConfig, MessageParams, TriggerDefinition,
};
use livechat_core::errors::SubsystemError;
use livechat_core::ids::TriggerId;
use livechat_core::lifecycle::Subsystem;

const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// A trigger action ready to be carried out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerFired {
    pub trigger_id: TriggerId,
    pub trigger_name: String,
    pub cause: ConditionKind,
    pub message: MessageParams,
}

/// Receives fired triggers.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn on_fired(&self, fired: &TriggerFired) -> Result<(), SubsystemError>;
}

/// Result of evaluating the configured triggers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Triggers that fired immediately.
    pub fired: usize,
    /// `time-on-site` timers started.
    pub scheduled: usize,
    /// Triggers waiting on a visitor event.
    pub waiting: usize,
}

/// Trigger evaluation as seen by the orchestrator.
#[async_trait]
pub trait TriggerService: Subsystem {
    fn register(&self, handler: Arc<dyn TriggerHandler>);
    /// Drop a handler added by `register`, matched by pointer. Returns whether
    /// it was registered.
    fn unregister(&self, handler: &Arc<dyn TriggerHandler>) -> bool;
    async fn evaluate(
        &self,
        config: &LivechatConfig,
        location: &str,
    ) -> Result<Evaluation, SubsystemError>;
    /// Fire the stored triggers listening for `kind`. Returns how many fired.
    async fn handle_event(&self, kind: ConditionKind) -> usize;
}

struct CircuitBreaker {
    failures: AtomicU32,
    threshold: u32,
    last_trip: Mutex<Option<Instant>>,
    cooldown: Duration,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            failures: AtomicU32::new(0),
            threshold,
            last_trip: Mutex::new(None),
            cooldown,
        }
    }

    fn is_open(&self) -> bool {
        if self.failures.load(Ordering::Relaxed) < self.threshold {
            return false;
        }
        self.last_trip
            .lock()
            .is_some_and(|tripped_at| tripped_at.elapsed() < self.cooldown)
    }

    fn record_failure(&self, handler_name: &str) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.threshold {
            let mut last_trip = self.last_trip.lock();
            if last_trip.is_none() {
                warn!(
                    handler = handler_name,
                    failures,
                    threshold = self.threshold,
                    cooldown_secs = self.cooldown.as_secs(),
                    "trigger handler circuit breaker tripped"
                );
            }
            *last_trip = Some(Instant::now());
        }
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
        *self.last_trip.lock() = None;
    }
}

struct HandlerEntry {
    handler: Arc<dyn TriggerHandler>,
    breaker: CircuitBreaker,
}

#[derive(Default)]
struct MountState {
    initialized: bool,
    triggers: Vec<TriggerDefinition>,
    fired_once: HashSet<TriggerId>,
}

struct Inner {
    handlers: RwLock<Vec<Arc<HandlerEntry>>>,
    state: Mutex<MountState>,
    timers: Mutex<CancellationToken>,
    handler_timeout: Duration,
    circuit_threshold: u32,
    circuit_cooldown: Duration,
}

/// Trigger engine for one mount. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TriggerEngine {
    inner: Arc<Inner>,
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_HANDLER_TIMEOUT, 3, Duration::from_secs(60))
    }

    /// `timeout` bounds each handler call; `threshold` consecutive failures open
    /// that handler's breaker for `cooldown`.
    pub fn with_limits(timeout: Duration, threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(Vec::new()),
                state: Mutex::new(MountState::default()),
                timers: Mutex::new(CancellationToken::new()),
                handler_timeout: timeout,
                circuit_threshold: threshold.max(1),
                circuit_cooldown: cooldown,
            }),
        }
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }
}

impl Default for TriggerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    /// Fire `trigger` unless it is `runOnce` and already fired this mount.
    async fn fire(&self, trigger: &TriggerDefinition, cause: ConditionKind) -> bool {
        {
            let mut state = self.state.lock();
            if !state.initialized {
                return false;
            }
            if trigger.run_once && !state.fired_once.insert(trigger.id.clone()) {
                debug!(trigger = %trigger.id, "runOnce trigger already fired");
                return false;
            }
        }

        info!(trigger = %trigger.id, name = %trigger.name, cause = ?cause, "trigger fired");
        for action in &trigger.actions {
            match action.name {
                ActionKind::SendMessage => {
                    let fired = TriggerFired {
                        trigger_id: trigger.id.clone(),
                        trigger_name: trigger.name.clone(),
                        cause,
                        message: action.params.clone(),
                    };
                    self.dispatch(&fired).await;
                }
            }
        }
        true
    }

    async fn dispatch(&self, fired: &TriggerFired) {
        let entries: Vec<Arc<HandlerEntry>> = self.handlers.read().iter().cloned().collect();
        for entry in entries {
            if entry.breaker.is_open() {
                continue;
            }
            let handler_name = entry.handler.name().to_string();
            let call = std::panic::AssertUnwindSafe(entry.handler.on_fired(fired)).catch_unwind();
            match tokio::time::timeout(self.handler_timeout, call).await {
                Ok(Ok(Ok(()))) => entry.breaker.record_success(),
                Ok(Ok(Err(e))) => {
                    warn!(handler = %handler_name, error = %e, "trigger handler failed");
                    entry.breaker.record_failure(&handler_name);
                }
                Ok(Err(_panic)) => {
                    warn!(handler = %handler_name, "trigger handler panicked");
                    entry.breaker.record_failure(&handler_name);
                }
                Err(_timeout) => {
                    warn!(
                        handler = %handler_name,
                        timeout_ms = self.handler_timeout.as_millis() as u64,
                        "trigger handler timed out"
                    );
                    entry.breaker.record_failure(&handler_name);
                }
            }
        }
    }
}

#[async_trait]
impl TriggerService for TriggerEngine {
    fn register(&self, handler: Arc<dyn TriggerHandler>) {
        let entry = HandlerEntry {
            handler,
            breaker: CircuitBreaker::new(self.inner.circuit_threshold, self.inner.circuit_cooldown),
        };
        self.inner.handlers.write().push(Arc::new(entry));
    }

    fn unregister(&self, handler: &Arc<dyn TriggerHandler>) -> bool {
        let mut handlers = self.inner.handlers.write();
        let before = handlers.len();
        handlers.retain(|entry| !Arc::ptr_eq(&entry.handler, handler));
        handlers.len() != before
    }

    async fn evaluate(
        &self,
        config: &LivechatConfig,
        location: &str,
    ) -> Result<Evaluation, SubsystemError> {
        let triggers: Vec<TriggerDefinition> =
            config.triggers.iter().filter(|t| t.enabled).cloned().collect();
        {
            let mut state = self.inner.state.lock();
            if !state.initialized {
                return Err(SubsystemError::NotInitialized {
                    subsystem: self.name(),
                });
            }
            state.triggers.clone_from(&triggers);
        }
        let cancel = self.inner.timers.lock().child_token();

        let mut evaluation = Evaluation::default();
        for trigger in &triggers {
            let mut waiting = false;
            for condition in &trigger.conditions {
                match condition.name {
                    ConditionKind::PageUrl => {
                        let Some(pattern) = condition.pattern() else {
                            continue;
                        };
                        match Regex::new(pattern) {
                            Ok(re) if re.is_match(location) => {
                                if self.inner.fire(trigger, ConditionKind::PageUrl).await {
                                    evaluation.fired += 1;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(trigger = %trigger.id, error = %e, "invalid page-url pattern");
                            }
                        }
                    }
                    ConditionKind::TimeOnSite => {
                        let Some(seconds) = condition.seconds() else {
                            warn!(trigger = %trigger.id, "time-on-site without a delay");
                            continue;
                        };
                        let inner = Arc::clone(&self.inner);
                        let trigger = trigger.clone();
                        let cancel = cancel.clone();
                        drop(tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {
                                    let _ = inner.fire(&trigger, ConditionKind::TimeOnSite).await;
                                }
                            }
                        }));
                        evaluation.scheduled += 1;
                    }
                    ConditionKind::ChatOpenedByVisitor | ConditionKind::AfterGuestRegistration => {
                        waiting = true;
                    }
                }
            }
            if waiting {
                evaluation.waiting += 1;
            }
        }

        debug!(
            fired = evaluation.fired,
            scheduled = evaluation.scheduled,
            waiting = evaluation.waiting,
            "triggers evaluated"
        );
        Ok(evaluation)
    }

    async fn handle_event(&self, kind: ConditionKind) -> usize {
        let listening: Vec<TriggerDefinition> = self
            .inner
            .state
            .lock()
            .triggers
            .iter()
            .filter(|t| t.conditions.iter().any(|c| c.name == kind))
            .cloned()
            .collect();

        let mut fired = 0;
        for trigger in &listening {
            if self.inner.fire(trigger, kind).await {
                fired += 1;
            }
        }
        fired
    }
}

#[async_trait]
impl Subsystem for TriggerEngine {
    fn name(&self) -> &'static str {
        "triggers"
    }

    async fn init(&self) -> Result<(), SubsystemError> {
        self.inner.state.lock().initialized = true;
        Ok(())
    }

    /// Cancels pending timers and forgets triggers and runOnce history.
    /// Registered handlers stay until their owner unregisters them.
    async fn reset(&self) -> Result<(), SubsystemError> {
        let previous = std::mem::replace(&mut *self.inner.timers.lock(), CancellationToken::new());
        previous.cancel();
        *self.inner.state.lock() = MountState::default();
        Ok(())
    }
}
