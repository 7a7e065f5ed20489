//! Session subsystems of the livechat widget: the backend connection, custom
//! visitor fields, presence, the trigger engine, host-frame messaging and
//! visibility tracking. Each lifecycle-scoped service implements
//! [`livechat_core::lifecycle::Subsystem`] and sits behind a trait so the
//! orchestrator can be driven by the doubles in [`mock`].

pub mod connection;
pub mod custom_fields;
pub mod host_bridge;
pub mod mock;
pub mod popout;
pub mod presence;
pub mod triggers;
pub mod visibility;

pub use connection::{ConnectionManager, ConnectionStatus, RestConnection, RetryPolicy};
pub use custom_fields::{CustomFieldRegistry, CustomFieldStore, FieldWrite};
pub use host_bridge::{BroadcastTransport, HostBridge, HostTransport, NoHostTransport};
pub use popout::is_popped_out;
pub use presence::{PresenceService, PresenceStatus, PresenceTracker};
pub use triggers::{Evaluation, TriggerEngine, TriggerFired, TriggerHandler, TriggerService};
pub use visibility::{ListenerId, VisibilityListener, VisibilityWatcher};
