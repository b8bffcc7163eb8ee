//! Shared channel machinery.
//!
//! `ChannelCore` owns the raw port, the reader task, the handshake signals,
//! and the state machine. The frame/window channels wrap it with their
//! role-specific connect sequence.
//!
//! Inbound filtering invariant: traffic failing the origin check or lacking
//! the protocol marker is dropped with no observable side effect, not even a
//! log line. Surfacing those drops would turn the engine into an oracle for
//! probing the allow-list.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portlink_core::envelope::{classify, ControlKind, Envelope, Inbound};
use portlink_core::security::{normalize_origin, require_safe_target_origin, validate_origin};
use portlink_core::{PortLinkError, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::transport::{PortEvent, RawPort};

use super::{ChannelOptions, ChannelState};

const INBOUND_QUEUE_DEPTH: usize = 256;
/// Initiator re-posts HANDSHAKE_INIT on this cadence until acknowledged, so a
/// counterparty that registers its listener late still sees one.
const INIT_RESEND_MS: u64 = 50;

/// Which side of the handshake this channel plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Sends HANDSHAKE_INIT and awaits the ack.
    Initiator,
    /// Awaits HANDSHAKE_INIT and replies with the ack.
    Acceptor,
}

pub struct ChannelCore {
    port: Arc<dyn RawPort>,
    allowed_origins: Vec<String>,
    handshake_timeout: Duration,
    configured_remote: Option<String>,

    state_tx: watch::Sender<ChannelState>,
    remote_origin: Mutex<Option<String>>,

    inbound_tx: mpsc::Sender<Envelope>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,

    connect_gate: tokio::sync::Mutex<()>,
    attempt_seq: AtomicU64,
    last_failure: Mutex<Option<String>>,

    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelCore {
    pub fn new(port: Arc<dyn RawPort>, opts: ChannelOptions) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        Self {
            port,
            allowed_origins: opts.allowed_origins,
            handshake_timeout: Duration::from_millis(opts.handshake_timeout_ms),
            configured_remote: opts.remote_origin,
            state_tx,
            remote_origin: Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            connect_gate: tokio::sync::Mutex::new(()),
            attempt_seq: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn remote_origin(&self) -> Option<String> {
        self.remote_origin.lock().ok().and_then(|g| g.clone())
    }

    pub fn local_origin(&self) -> &str {
        self.port.local_origin()
    }

    pub fn is_peer_closed(&self) -> bool {
        self.port.is_closed()
    }

    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.inbound_rx.lock().ok().and_then(|mut g| g.take())
    }

    pub fn port_kind(&self) -> crate::transport::PortKind {
        self.port.kind()
    }

    /// Publish a state transition exactly once (no-op when unchanged).
    fn set_state(&self, next: ChannelState) {
        self.state_tx.send_if_modified(|s| {
            if *s != next {
                *s = next;
                true
            } else {
                false
            }
        });
    }

    fn set_remote_if_unset(&self, origin: &str) {
        if let Ok(mut g) = self.remote_origin.lock() {
            if g.is_none() {
                *g = normalize_origin(origin);
            }
        }
    }

    /// Resolve the counterparty origin for sending.
    ///
    /// Same-origin ports expose a readable hint; cross-origin ports require an
    /// explicitly configured origin that is also allow-listed. A missing
    /// configuration is a fatal setup error, never trust a location hint the
    /// counterparty controls.
    fn resolve_remote(&self) -> Result<String> {
        if let Some(r) = self.remote_origin() {
            return Ok(r);
        }
        if let Some(hint) = self.port.remote_origin_hint() {
            let origin = require_safe_target_origin(&hint)?;
            self.set_remote_if_unset(&origin);
            return Ok(origin);
        }
        let Some(configured) = &self.configured_remote else {
            return Err(PortLinkError::Config(
                "cross-origin target requires an explicitly configured remote origin".into(),
            ));
        };
        if !validate_origin(configured, &self.allowed_origins) {
            return Err(PortLinkError::Config(format!(
                "configured remote origin {configured} is not in the allowed origins list"
            )));
        }
        let origin = require_safe_target_origin(configured)?;
        self.set_remote_if_unset(&origin);
        Ok(origin)
    }

    /// Run the handshake for `role`. Race-safe: a call that arrives while an
    /// attempt is in flight waits and observes that attempt's outcome instead
    /// of starting a second handshake.
    pub async fn connect_as(self: &Arc<Self>, role: HandshakeRole) -> Result<()> {
        let seq_at_entry = self.attempt_seq.load(Ordering::Acquire);
        let _gate = self.connect_gate.lock().await;

        if self.state() == ChannelState::Connected {
            return Ok(());
        }
        if self.attempt_seq.load(Ordering::Acquire) != seq_at_entry {
            // An attempt settled while we waited on the gate: same outcome.
            let msg = self
                .last_failure
                .lock()
                .ok()
                .and_then(|g| g.clone())
                .unwrap_or_else(|| "handshake failed".into());
            return Err(PortLinkError::Connection(msg));
        }

        let result = self.run_handshake(role).await;
        self.attempt_seq.fetch_add(1, Ordering::Release);
        if let Err(e) = &result {
            if let Ok(mut g) = self.last_failure.lock() {
                *g = Some(e.to_string());
            }
            // connecting -> error -> cleanup -> disconnected, no partial
            // state: the reader goes down with the attempt, releasing the
            // port it holds.
            self.set_state(ChannelState::Error);
            self.stop_reader();
            self.set_state(ChannelState::Disconnected);
        }
        result
    }

    async fn run_handshake(self: &Arc<Self>, role: HandshakeRole) -> Result<()> {
        self.set_state(ChannelState::Connecting);
        self.ensure_reader();

        match role {
            HandshakeRole::Initiator => {
                // Frame hosts must wait for the embedded context to load
                // before the counterparty can possibly be listening.
                self.port.ready().await;
                let remote = self.resolve_remote()?;
                let mut state_rx = self.state_tx.subscribe();
                let outcome = tokio::time::timeout(self.handshake_timeout, async {
                    loop {
                        let init = Envelope::control(
                            ControlKind::HandshakeInit,
                            self.port.local_origin(),
                        );
                        // Post failures surface as a timeout; the resend loop
                        // keeps trying until the deadline.
                        if let Ok(data) = init.encode() {
                            let _ = self.port.post(&data, &remote).await;
                        }
                        tokio::select! {
                            changed = state_rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                                if *state_rx.borrow() == ChannelState::Connected {
                                    return;
                                }
                            }
                            _ = tokio::time::sleep(Duration::from_millis(INIT_RESEND_MS)) => {}
                        }
                    }
                })
                .await;

                if outcome.is_err() || self.state() != ChannelState::Connected {
                    return Err(PortLinkError::Connection(
                        "handshake not acknowledged within timeout".into(),
                    ));
                }
                Ok(())
            }
            HandshakeRole::Acceptor => {
                // Resolution may legitimately fail here: the acceptor learns
                // the counterparty origin from the validated HANDSHAKE_INIT.
                let _ = self.resolve_remote();
                let mut state_rx = self.state_tx.subscribe();
                let outcome = tokio::time::timeout(self.handshake_timeout, async {
                    loop {
                        if *state_rx.borrow() == ChannelState::Connected {
                            return;
                        }
                        if state_rx.changed().await.is_err() {
                            return;
                        }
                    }
                })
                .await;

                if outcome.is_err() || self.state() != ChannelState::Connected {
                    return Err(PortLinkError::Connection(
                        "no handshake init received within timeout".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn ensure_reader(self: &Arc<Self>) {
        let Ok(mut guard) = self.reader.lock() else {
            return;
        };
        if guard.is_some() {
            return;
        }
        let Some(rx) = self.port.take_events() else {
            return;
        };
        let core = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            core.run_reader(rx).await;
        }));
    }

    async fn run_reader(self: Arc<Self>, mut rx: mpsc::Receiver<PortEvent>) {
        while let Some(ev) = rx.recv().await {
            // Logical listener teardown: while disconnected, events vanish.
            if matches!(
                self.state(),
                ChannelState::Disconnected | ChannelState::Error
            ) {
                continue;
            }
            if !validate_origin(&ev.origin, &self.allowed_origins) {
                continue;
            }
            let env = match classify(&ev.data) {
                Inbound::Foreign => continue,
                Inbound::Message(env) | Inbound::Reply(env) => {
                    if self.declared_origin_mismatch(&env, &ev) {
                        continue;
                    }
                    if self.state() != ChannelState::Connected {
                        continue;
                    }
                    env
                }
                Inbound::Control(kind, env) => {
                    if self.declared_origin_mismatch(&env, &ev) {
                        continue;
                    }
                    match kind {
                        ControlKind::HandshakeInit => {
                            self.on_handshake_init(&ev).await;
                            continue;
                        }
                        ControlKind::HandshakeAck => {
                            if self.state() == ChannelState::Connecting {
                                self.set_state(ChannelState::Connected);
                            }
                            continue;
                        }
                        // Heartbeats and disconnects are session concerns.
                        _ => {
                            if self.state() != ChannelState::Connected {
                                continue;
                            }
                            env
                        }
                    }
                }
            };
            // Queue saturation drops the frame; the transport is best-effort
            // and callers recover through retry.
            let _ = self.inbound_tx.send(env).await;
        }
    }

    /// Abort and drop the reader task. The port's event stream was consumed
    /// by this reader, so the channel cannot be revived afterwards; callers
    /// discard it and build a fresh channel over a fresh port.
    fn stop_reader(&self) {
        if let Ok(mut guard) = self.reader.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }

    fn declared_origin_mismatch(&self, env: &Envelope, ev: &PortEvent) -> bool {
        normalize_origin(&env.origin) != normalize_origin(&ev.origin)
    }

    async fn on_handshake_init(&self, ev: &PortEvent) {
        // The event origin already passed the allow-list; learn it as the
        // counterparty if resolution has not settled yet.
        self.set_remote_if_unset(&ev.origin);
        let target = match self.remote_origin() {
            Some(t) => t,
            None => return,
        };
        let ack = Envelope::control(ControlKind::HandshakeAck, self.port.local_origin());
        if let Ok(data) = ack.encode() {
            let _ = self.port.post(&data, &target).await;
        }
        if self.state() == ChannelState::Connecting {
            self.set_state(ChannelState::Connected);
        }
    }

    /// Transmit one envelope to the resolved counterparty.
    pub async fn send(&self, env: &Envelope) -> Result<()> {
        if self.state() != ChannelState::Connected {
            return Err(PortLinkError::NotConnected(
                "channel is not connected".into(),
            ));
        }
        let remote = self
            .remote_origin()
            .ok_or_else(|| PortLinkError::Internal("connected without resolved origin".into()))?;
        // Hard failure on wildcard/opaque origins: transmitting would leak the
        // message to every listener.
        let remote = require_safe_target_origin(&remote)?;
        let data = env.encode()?;
        self.port.post(&data, &remote).await
    }

    /// Tear down. No-op when already disconnected.
    pub async fn disconnect(&self) {
        if self.state() == ChannelState::Disconnected {
            return;
        }
        // Best-effort notify so the counterparty can drop its target record.
        if self.state() == ChannelState::Connected {
            if let Some(remote) = self.remote_origin() {
                let bye = Envelope::control(ControlKind::Disconnect, self.port.local_origin());
                if let Ok(data) = bye.encode() {
                    let _ = self.port.post(&data, &remote).await;
                }
            }
        }
        self.set_state(ChannelState::Disconnected);
        self.stop_reader();
    }
}
