//! Session layer: target registry, request correlation, heartbeat.
//!
//! The [`SessionManager`] is the single owner of all targets and pending
//! requests, and the only component application code talks to for sending.
//! Registry mutations are applied synchronously before any asynchronous
//! continuation resumes, so reentrant sends from inside a handler observe a
//! consistent registry.

pub mod manager;
pub mod target;
pub mod types;

pub use manager::SessionManager;
pub use target::{Target, TargetState};
pub use types::{
    BroadcastOutcome, BroadcastResult, Delivery, HandlerId, RegisterOptions, Responder,
    SendOptions,
};
