//! Raw transport seam.
//!
//! The engine is layered over a single fire-and-forget message primitive with
//! no connection concept: a port you can post a string into, and a stream of
//! inbound events each stamped with the host-environment-attached origin of
//! its sender. [`RawPort`] models exactly that surface and nothing more;
//! everything above it (handshake, correlation, liveness) lives in the
//! channel and session layers.

pub mod pair;

use async_trait::async_trait;
use portlink_core::Result;
use tokio::sync::mpsc;

pub use pair::{InProcPort, PortPair};

/// Transport kind behind a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// Host page to embedded frame.
    EmbeddedFrame,
    /// Window to a window it opened (or was opened by).
    OpenedWindow,
}

/// One raw inbound event: the sender's origin as attached by the host
/// environment, plus the opaque data string.
#[derive(Debug, Clone)]
pub struct PortEvent {
    pub origin: String,
    pub data: String,
}

/// A raw message port endpoint.
///
/// `post` is fire-and-forget best-effort: a returned `Ok` means the data was
/// handed to the primitive, not that anyone received it.
#[async_trait]
pub trait RawPort: Send + Sync {
    /// Post raw data toward `target_origin`. Implementations drop the message
    /// when the counterparty's origin does not match.
    async fn post(&self, data: &str, target_origin: &str) -> Result<()>;

    /// Transport kind of this endpoint.
    fn kind(&self) -> PortKind;

    /// Origin of the local execution context.
    fn local_origin(&self) -> &str;

    /// The counterparty origin when it is directly readable (same-origin
    /// frame). `None` means cross-origin: the location hint is attacker
    /// controllable and must not be trusted, so the caller has to supply an
    /// explicitly configured origin instead.
    fn remote_origin_hint(&self) -> Option<String>;

    /// Resolves once the counterparty context has finished loading.
    async fn ready(&self);

    /// Whether the underlying window/frame has been torn down.
    fn is_closed(&self) -> bool;

    /// Take the inbound event stream. Yields `Some` exactly once; a port has
    /// a single consumer.
    fn take_events(&self) -> Option<mpsc::Receiver<PortEvent>>;
}
