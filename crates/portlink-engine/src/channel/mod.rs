//! Channels: handshake and raw send/receive plumbing.
//!
//! A channel owns exactly one raw port, runs the connection handshake over
//! it, and filters inbound traffic (origin allow-list, protocol marker)
//! before anything reaches the session layer. Control frames for the
//! handshake are intercepted here; heartbeats, replies, and application
//! messages are forwarded upward.

pub mod base;
pub mod frame;
pub mod window;

use async_trait::async_trait;
use portlink_core::envelope::Envelope;
use portlink_core::Result;
use tokio::sync::{mpsc, watch};

use crate::transport::PortKind;

pub use frame::{FrameChannel, FrameSide};
pub use window::{WindowChannel, WindowRole};

/// Channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Per-channel options supplied at construction.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Origins trusted for inbound traffic on this channel.
    pub allowed_origins: Vec<String>,
    /// Handshake deadline in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Explicitly configured counterparty origin. Required when the port is
    /// cross-origin (no readable origin hint); ignored otherwise.
    pub remote_origin: Option<String>,
}

/// The seam between the session manager and a transport endpoint.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Run the handshake. Idempotent and race-safe: concurrent calls while an
    /// attempt is in flight observe that attempt's outcome.
    async fn connect(&self) -> Result<()>;

    /// Transmit one envelope to the resolved counterparty origin.
    async fn send(&self, env: &Envelope) -> Result<()>;

    /// Tear down. No-op when already disconnected.
    async fn disconnect(&self);

    fn state(&self) -> ChannelState;

    /// Watch state transitions. Each transition is published exactly once.
    fn state_changes(&self) -> watch::Receiver<ChannelState>;

    /// Resolved counterparty origin, once known.
    fn remote_origin(&self) -> Option<String>;

    fn kind(&self) -> PortKind;

    /// Whether the underlying window/frame has been torn down.
    fn is_peer_closed(&self) -> bool;

    /// Take the filtered inbound stream (heartbeats, replies, application
    /// messages). Yields `Some` exactly once.
    fn take_inbound(&self) -> Option<mpsc::Receiver<Envelope>>;
}
