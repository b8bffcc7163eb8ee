//! Target records.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use portlink_core::envelope::now_ms;
use tokio::task::JoinHandle;

use crate::channel::Channel;
use crate::transport::PortKind;

/// Target lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// One remote endpoint reached through one channel. Owned exclusively by the
/// session manager; the channel holds no target knowledge.
pub struct Target {
    pub id: String,
    pub kind: PortKind,
    channel: Arc<dyn Channel>,
    state: Mutex<TargetState>,
    connected_at_ms: AtomicU64,
    last_activity_ms: AtomicU64,
    last_heartbeat_ms: AtomicU64,
    missed_heartbeats: AtomicU32,
    send_failures: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Target {
    pub fn new(id: &str, kind: PortKind, channel: Arc<dyn Channel>) -> Self {
        Self {
            id: id.to_string(),
            kind,
            channel,
            state: Mutex::new(TargetState::Connecting),
            connected_at_ms: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(now_ms()),
            last_heartbeat_ms: AtomicU64::new(0),
            missed_heartbeats: AtomicU32::new(0),
            send_failures: AtomicU32::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn state(&self) -> TargetState {
        self.state
            .lock()
            .map(|g| *g)
            .unwrap_or(TargetState::Disconnected)
    }

    /// Transition to `next`. Returns false when already there, so callers can
    /// keep "exactly once per transition" notifications.
    pub fn set_state(&self, next: TargetState) -> bool {
        match self.state.lock() {
            Ok(mut g) => {
                if *g == next {
                    false
                } else {
                    *g = next;
                    true
                }
            }
            Err(_) => false,
        }
    }

    pub fn mark_connected(&self) {
        self.set_state(TargetState::Connected);
        self.connected_at_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn connected_at_ms(&self) -> u64 {
        self.connected_at_ms.load(Ordering::Relaxed)
    }

    /// Record activity on any recognized inbound envelope.
    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn record_heartbeat(&self) {
        self.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);
        self.missed_heartbeats.store(0, Ordering::Relaxed);
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        self.last_heartbeat_ms.load(Ordering::Relaxed)
    }

    /// Increment the missed-heartbeat counter, returning the new value.
    pub fn miss_heartbeat(&self) -> u32 {
        self.missed_heartbeats.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats.load(Ordering::Relaxed)
    }

    /// Increment the consecutive-send-failure counter, returning the new value.
    pub fn note_send_failure(&self) -> u32 {
        self.send_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_send_failures(&self) {
        self.send_failures.store(0, Ordering::Relaxed);
    }

    pub fn track_task(&self, handle: JoinHandle<()>) {
        if let Ok(mut g) = self.tasks.lock() {
            g.push(handle);
        }
    }

    /// Abort heartbeat/inbound tasks. Called last during teardown; aborting
    /// the calling task itself only takes effect at its next await point.
    pub fn abort_tasks(&self) {
        if let Ok(mut g) = self.tasks.lock() {
            for handle in g.drain(..) {
                handle.abort();
            }
        }
    }
}
