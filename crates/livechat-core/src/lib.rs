//! Shared vocabulary for the livechat widget runtime: identifiers, session state
//! and its reducer, host-frame commands and events, the subsystem lifecycle
//! contract, and the error types every other crate speaks.

pub mod commands;
pub mod config;
pub mod errors;
pub mod events;
pub mod ids;
pub mod lifecycle;
pub mod state;
