//! portlink engine library entry.
//!
//! This crate wires channels, the session manager, the event bus, and the
//! config layer into a cohesive messaging engine. It is consumed through the
//! `portlink` facade crate and by integration tests.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod bus;
pub mod channel;
pub mod config;
pub mod session;
pub mod sink;
pub mod transport;

pub use bus::{SubscriptionId, SystemEvent, SystemEventKind};
pub use channel::{Channel, ChannelOptions, ChannelState, FrameChannel, FrameSide, WindowChannel, WindowRole};
pub use config::EngineConfig;
pub use session::{
    BroadcastResult, Delivery, HandlerId, RegisterOptions, Responder, SendOptions, SessionManager,
    TargetState,
};
pub use sink::{init_tracing, AnalyticsSink, LogSink, NullAnalyticsSink, TracingLogSink};
pub use transport::{PortEvent, PortKind, RawPort};
