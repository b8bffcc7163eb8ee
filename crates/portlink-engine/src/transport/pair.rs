//! In-process port pair.
//!
//! Two linked [`RawPort`] endpoints with fixed origins, backed by mpsc
//! queues. This is the reference transport used by the test suite and by
//! embedders that host both endpoints in one process. It reproduces the
//! primitive's semantics: unordered best-effort delivery, origin stamping by
//! the "environment" (the pair itself, never the sender), and silent dropping
//! when the posted target origin does not match the counterparty.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use portlink_core::security::normalize_origin;
use portlink_core::{PortLinkError, Result};
use tokio::sync::mpsc;

use super::{PortEvent, PortKind, RawPort};

const PORT_QUEUE_DEPTH: usize = 256;

/// One endpoint of an in-process pair.
pub struct InProcPort {
    kind: PortKind,
    local_origin: String,
    peer_origin: String,
    /// Whether the peer origin is readable from this side (same-origin).
    same_origin: bool,
    peer_tx: mpsc::Sender<PortEvent>,
    /// Sender into this endpoint's own queue, used by [`InProcPort::inject`].
    self_tx: mpsc::Sender<PortEvent>,
    events: Mutex<Option<mpsc::Receiver<PortEvent>>>,
    closed: Arc<AtomicBool>,
    fail_sends: AtomicBool,
}

/// Builder for a linked pair of ports.
pub struct PortPair;

impl PortPair {
    /// Link two endpoints with the given origins. `same_origin` controls
    /// whether each side may read the other's origin directly (frame
    /// embedding on the same origin) or must rely on configuration.
    pub fn linked(
        kind: PortKind,
        origin_a: &str,
        origin_b: &str,
        same_origin: bool,
    ) -> (Arc<InProcPort>, Arc<InProcPort>) {
        let (tx_a, rx_a) = mpsc::channel(PORT_QUEUE_DEPTH);
        let (tx_b, rx_b) = mpsc::channel(PORT_QUEUE_DEPTH);
        let closed = Arc::new(AtomicBool::new(false));

        let a = Arc::new(InProcPort {
            kind,
            local_origin: origin_a.to_string(),
            peer_origin: origin_b.to_string(),
            same_origin,
            peer_tx: tx_b.clone(),
            self_tx: tx_a.clone(),
            events: Mutex::new(Some(rx_a)),
            closed: Arc::clone(&closed),
            fail_sends: AtomicBool::new(false),
        });
        let b = Arc::new(InProcPort {
            kind,
            local_origin: origin_b.to_string(),
            peer_origin: origin_a.to_string(),
            same_origin,
            peer_tx: tx_a,
            self_tx: tx_b.clone(),
            events: Mutex::new(Some(rx_b)),
            closed,
            fail_sends: AtomicBool::new(false),
        });
        (a, b)
    }
}

impl InProcPort {
    /// Tear the pair down, as a closed window would.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Make subsequent `post` calls fail (test hook for dead transports).
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    /// Deliver raw data to this endpoint as if it came from `origin`.
    /// Simulates unrelated or hostile traffic sharing the primitive.
    pub async fn inject(&self, origin: &str, data: &str) {
        let _ = self
            .self_tx
            .send(PortEvent {
                origin: origin.to_string(),
                data: data.to_string(),
            })
            .await;
    }
}

#[async_trait]
impl RawPort for InProcPort {
    async fn post(&self, data: &str, target_origin: &str) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(PortLinkError::Connection("port closed".into()));
        }
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(PortLinkError::Connection("port send failure".into()));
        }
        // The environment drops mismatched target origins silently.
        let matches = normalize_origin(target_origin)
            .map(|t| normalize_origin(&self.peer_origin).as_deref() == Some(t.as_str()))
            .unwrap_or(false);
        if !matches {
            return Ok(());
        }
        let event = PortEvent {
            origin: self.local_origin.clone(),
            data: data.to_string(),
        };
        self.peer_tx
            .send(event)
            .await
            .map_err(|_| PortLinkError::Connection("peer port gone".into()))
    }

    fn kind(&self) -> PortKind {
        self.kind
    }

    fn local_origin(&self) -> &str {
        &self.local_origin
    }

    fn remote_origin_hint(&self) -> Option<String> {
        if self.same_origin {
            Some(self.peer_origin.clone())
        } else {
            None
        }
    }

    async fn ready(&self) {
        // In-process peers are loaded as soon as they exist.
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn take_events(&self) -> Option<mpsc::Receiver<PortEvent>> {
        self.events.lock().ok().and_then(|mut g| g.take())
    }
}
