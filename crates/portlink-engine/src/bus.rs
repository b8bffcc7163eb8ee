//! System event bus.
//!
//! A small publish/subscribe registry for lifecycle notifications. Handlers
//! are keyed by event kind and invoked synchronously on the emitting turn;
//! one subscriber's behavior never affects another's delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

/// Lifecycle event kinds observable through [`crate::session::SessionManager::on_system`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemEventKind {
    /// Target completed its handshake.
    Connected,
    /// Target left the connected state (reason attached).
    Disconnected,
    /// Handshake or connect attempt failed.
    ConnectFailed,
    /// A response-expecting send exhausted its retries.
    MessageTimeout,
    /// An inbound message failed validation or a handler reported an error.
    HandlerError,
}

impl SystemEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SystemEventKind::Connected => "connected",
            SystemEventKind::Disconnected => "disconnected",
            SystemEventKind::ConnectFailed => "connect_failed",
            SystemEventKind::MessageTimeout => "message_timeout",
            SystemEventKind::HandlerError => "handler_error",
        }
    }
}

/// One lifecycle notification.
#[derive(Debug, Clone)]
pub struct SystemEvent {
    pub kind: SystemEventKind,
    pub target_id: Option<String>,
    pub reason: Option<String>,
    pub detail: Option<Value>,
}

impl SystemEvent {
    pub fn new(kind: SystemEventKind) -> Self {
        Self {
            kind,
            target_id: None,
            reason: None,
            detail: None,
        }
    }

    pub fn target(mut self, id: &str) -> Self {
        self.target_id = Some(id.to_string());
        self
    }

    pub fn reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Subscription handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type EventHandler = Arc<dyn Fn(&SystemEvent) + Send + Sync>;

/// Registry and dispatcher for system events.
#[derive(Default)]
pub struct EventBus {
    subs: DashMap<SystemEventKind, Vec<(SubscriptionId, EventHandler)>>,
    next: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subs: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    pub fn subscribe(
        &self,
        kind: SystemEventKind,
        handler: impl Fn(&SystemEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next.fetch_add(1, Ordering::Relaxed));
        self.subs
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, kind: SystemEventKind, id: SubscriptionId) {
        if let Some(mut list) = self.subs.get_mut(&kind) {
            list.retain(|(sid, _)| *sid != id);
        }
    }

    pub fn emit(&self, event: &SystemEvent) {
        // Clone handlers out before invoking so a subscriber that re-enters
        // subscribe/unsubscribe does not deadlock on the shard lock.
        let handlers: Vec<EventHandler> = match self.subs.get(&event.kind) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };
        for h in handlers {
            h(event);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn subscribe_emit_unsubscribe() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let id = bus.subscribe(SystemEventKind::Connected, move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(&SystemEvent::new(SystemEventKind::Connected).target("t1"));
        bus.emit(&SystemEvent::new(SystemEventKind::Disconnected).target("t1"));
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        bus.unsubscribe(SystemEventKind::Connected, id);
        bus.emit(&SystemEvent::new(SystemEventKind::Connected));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reentrant_subscribe_does_not_deadlock() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        bus.subscribe(SystemEventKind::Connected, move |_| {
            inner.subscribe(SystemEventKind::Disconnected, |_| {});
        });
        bus.emit(&SystemEvent::new(SystemEventKind::Connected));
    }
}
