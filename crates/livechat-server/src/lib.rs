//! The widget session: the orchestrator that mounts and tears down the engine
//! subsystems, the screen router, and the socket server the host frame talks to.

pub mod client;
pub mod event_bridge;
pub mod orchestrator;
pub mod router;
pub mod server;

pub use orchestrator::{OrchestratorError, Phase, ScreenActions, SessionOrchestrator, Subsystems};
pub use router::{Route, Screen};
pub use server::{start, ServerConfig, ServerHandle};
