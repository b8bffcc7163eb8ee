//! Session-level request/handler types.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use portlink_core::envelope::Envelope;
use portlink_core::schema::Schema;
use portlink_core::{ErrorCode, PortLinkError, Result};
use serde_json::Value;
use uuid::Uuid;

use super::manager::SessionManager;

/// Handle identifying one registered handler, for removal via
/// [`SessionManager::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(pub(crate) u64);

/// Handler callback. Runs on the dispatch turn; long work should be spawned.
pub type Handler = Arc<dyn Fn(Delivery, Responder) + Send + Sync>;

/// Per-type error hook, the only surface inbound validation errors reach.
pub type ErrorHook = Arc<dyn Fn(&PortLinkError) + Send + Sync>;

/// Options for [`SessionManager::on`].
#[derive(Default)]
pub struct RegisterOptions {
    /// Structural contract validated once per inbound message of this type.
    pub schema: Option<Schema>,
    /// Per-type send timeout override.
    pub timeout_ms: Option<u64>,
    /// Per-type retry override.
    pub retries: Option<u32>,
    /// Receives validation/dispatch errors for this type.
    pub on_error: Option<ErrorHook>,
}

/// Options for [`SessionManager::send`].
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Whether to correlate a reply. Defaults to true.
    pub expects_response: bool,
    /// Override the default/per-type timeout.
    pub timeout_ms: Option<u64>,
    /// Override the default/per-type retry count.
    pub retries: Option<u32>,
    /// Structural-clone the payload before transmission. Defaults to true.
    pub sanitize: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            expects_response: true,
            timeout_ms: None,
            retries: None,
            sanitize: true,
        }
    }
}

impl SendOptions {
    /// No correlation bookkeeping; the call resolves once transmitted.
    pub fn fire_and_forget() -> Self {
        Self {
            expects_response: false,
            ..Self::default()
        }
    }
}

/// One inbound application message as handed to handlers.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    pub msg_type: String,
    pub payload: Value,
    pub origin: String,
    pub target_id: String,
    pub ts: u64,
}

impl Delivery {
    pub(crate) fn from_envelope(env: &Envelope, target_id: &str) -> Self {
        Self {
            id: env.id,
            msg_type: env.msg_type.clone(),
            payload: env.payload.clone(),
            origin: env.origin.clone(),
            target_id: target_id.to_string(),
            ts: env.ts,
        }
    }
}

/// Bound respond-once callback handed to every handler of a message.
///
/// The first `ok`/`err` call constructs and transmits the reply envelope;
/// every subsequent call on any clone is a no-op. Responding to a message
/// that did not ask for a response is also a no-op.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

struct ResponderInner {
    replied: AtomicBool,
    manager: Weak<SessionManager>,
    target_id: String,
    original: Envelope,
    local_origin: String,
}

impl Responder {
    pub(crate) fn new(
        manager: Weak<SessionManager>,
        target_id: &str,
        original: Envelope,
        local_origin: &str,
    ) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                replied: AtomicBool::new(false),
                manager,
                target_id: target_id.to_string(),
                original,
                local_origin: local_origin.to_string(),
            }),
        }
    }

    /// Reply with a success payload.
    pub fn ok(&self, payload: Value) {
        let reply = Envelope::reply_ok(&self.inner.original, payload, &self.inner.local_origin);
        self.transmit(reply);
    }

    /// Reply with a failure code and message.
    pub fn err(&self, code: ErrorCode, message: &str) {
        let reply = Envelope::reply_err(
            &self.inner.original,
            code.as_str(),
            message,
            &self.inner.local_origin,
        );
        self.transmit(reply);
    }

    fn transmit(&self, reply: Envelope) {
        if !self.inner.original.expects_response {
            return;
        }
        if self.inner.replied.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(manager) = self.inner.manager.upgrade() else {
            return;
        };
        let target_id = self.inner.target_id.clone();
        tokio::spawn(async move {
            manager.transmit_reply(&target_id, reply).await;
        });
    }
}

/// Per-target outcome of a broadcast.
#[derive(Debug)]
pub struct BroadcastOutcome {
    pub target_id: String,
    pub result: Result<()>,
}

/// Aggregate broadcast result; per-target failures are isolated.
#[derive(Debug, Default)]
pub struct BroadcastResult {
    pub outcomes: Vec<BroadcastOutcome>,
}

impl BroadcastResult {
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.target_id.as_str())
            .collect()
    }

    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}
