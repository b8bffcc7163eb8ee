//! Session manager: the single owner of targets and pending requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::{FuturesUnordered, StreamExt};
use portlink_core::envelope::{ControlKind, Envelope};
use portlink_core::schema::validate;
use portlink_core::security::sanitize_payload;
use portlink_core::{ErrorCode, PortLinkError, Result};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::bus::{EventBus, SubscriptionId, SystemEvent, SystemEventKind};
use crate::channel::{Channel, ChannelOptions, FrameChannel, FrameSide, WindowChannel, WindowRole};
use crate::config::EngineConfig;
use crate::sink::{AnalyticsSink, LogSink, NullAnalyticsSink, TracingLogSink};
use crate::transport::{PortKind, RawPort};

use super::target::{Target, TargetState};
use super::types::{
    BroadcastOutcome, BroadcastResult, Delivery, ErrorHook, Handler, HandlerId, RegisterOptions,
    Responder, SendOptions,
};

/// Disconnect reasons surfaced in [`SystemEventKind::Disconnected`] events.
pub const REASON_HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";
pub const REASON_SEND_FAILURES: &str = "send_failures";
pub const REASON_LOCAL_DISCONNECT: &str = "local_disconnect";
pub const REASON_REMOTE_DISCONNECT: &str = "remote_disconnect";
pub const REASON_PEER_CLOSED: &str = "peer_closed";
pub const REASON_CHANNEL_CLOSED: &str = "channel_closed";

struct PendingRequest {
    target_id: String,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct RegisteredType {
    schema: Option<portlink_core::schema::Schema>,
    timeout_ms: Option<u64>,
    retries: Option<u32>,
    on_error: Option<ErrorHook>,
    handlers: Vec<(HandlerId, Handler)>,
}

/// Orchestrates channels: connection lifecycle, correlation, heartbeat,
/// broadcast, and inbound dispatch.
pub struct SessionManager {
    cfg: EngineConfig,
    local_origin: String,
    targets: DashMap<String, Arc<Target>>,
    pending: DashMap<Uuid, PendingRequest>,
    types: DashMap<String, RegisteredType>,
    bus: EventBus,
    log: Arc<dyn LogSink>,
    analytics: Arc<dyn AnalyticsSink>,
    next_handler: AtomicU64,
}

impl SessionManager {
    /// Build a manager with default sinks. Fails synchronously on config
    /// mistakes; those are setup errors, not transient conditions.
    pub fn new(cfg: EngineConfig, local_origin: &str) -> Result<Arc<Self>> {
        Self::with_sinks(
            cfg,
            local_origin,
            Arc::new(TracingLogSink),
            Arc::new(NullAnalyticsSink),
        )
    }

    pub fn with_sinks(
        cfg: EngineConfig,
        local_origin: &str,
        log: Arc<dyn LogSink>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let local_origin = portlink_core::security::normalize_origin(local_origin)
            .ok_or_else(|| {
                PortLinkError::Config(format!("local origin is not a valid origin: {local_origin}"))
            })?;
        Ok(Arc::new(Self {
            cfg,
            local_origin,
            targets: DashMap::new(),
            pending: DashMap::new(),
            types: DashMap::new(),
            bus: EventBus::new(),
            log,
            analytics,
            next_handler: AtomicU64::new(1),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn local_origin(&self) -> &str {
        &self.local_origin
    }

    fn channel_options(&self, remote_origin: Option<String>) -> ChannelOptions {
        ChannelOptions {
            allowed_origins: self.cfg.engine.allowed_origins.clone(),
            handshake_timeout_ms: self.cfg.engine.handshake_timeout_ms,
            remote_origin,
        }
    }

    // ---- connection lifecycle ----

    /// Connect an embedded-frame target.
    pub async fn connect_frame(
        self: &Arc<Self>,
        target_id: &str,
        port: Arc<dyn RawPort>,
        side: FrameSide,
        remote_origin: Option<String>,
    ) -> Result<()> {
        let opts = self.channel_options(remote_origin);
        let channel = Arc::new(FrameChannel::new(port, side, opts));
        self.connect_channel(target_id, PortKind::EmbeddedFrame, channel)
            .await
    }

    /// Connect an opened-window target.
    pub async fn connect_window(
        self: &Arc<Self>,
        target_id: &str,
        port: Arc<dyn RawPort>,
        role: WindowRole,
        remote_origin: Option<String>,
    ) -> Result<()> {
        let opts = self.channel_options(remote_origin);
        let channel = Arc::new(WindowChannel::new(port, role, opts));
        self.connect_channel(target_id, PortKind::OpenedWindow, channel)
            .await
    }

    /// Register a target and drive its channel handshake.
    pub async fn connect_channel(
        self: &Arc<Self>,
        target_id: &str,
        kind: PortKind,
        channel: Arc<dyn Channel>,
    ) -> Result<()> {
        if self.targets.contains_key(target_id) {
            return Err(PortLinkError::Config(format!(
                "target id already registered: {target_id}"
            )));
        }
        let target = Arc::new(Target::new(target_id, kind, channel.clone()));
        // Inserted in connecting state before the first await so reentrant
        // observers see a consistent registry.
        self.targets.insert(target_id.to_string(), Arc::clone(&target));

        if let Err(e) = channel.connect().await {
            self.targets.remove(target_id);
            self.bus.emit(
                &SystemEvent::new(SystemEventKind::ConnectFailed)
                    .target(target_id)
                    .reason(&e.to_string()),
            );
            self.analytics
                .record(&SystemEvent::new(SystemEventKind::ConnectFailed).target(target_id));
            return Err(e);
        }

        target.mark_connected();
        if let Some(rx) = channel.take_inbound() {
            let mgr = Arc::clone(self);
            let t = Arc::clone(&target);
            target.track_task(tokio::spawn(async move {
                mgr.run_inbound(t, rx).await;
            }));
        }
        if self.cfg.heartbeat.enabled {
            let mgr = Arc::clone(self);
            let t = Arc::clone(&target);
            target.track_task(tokio::spawn(async move {
                mgr.run_heartbeat(t).await;
            }));
        }

        self.log.info(
            "target connected",
            Some(&json!({ "target": target_id, "origin": channel.remote_origin() })),
        );
        let event = SystemEvent::new(SystemEventKind::Connected).target(target_id);
        self.bus.emit(&event);
        self.analytics.record(&event);
        Ok(())
    }

    /// Explicitly disconnect a target.
    pub async fn disconnect(self: &Arc<Self>, target_id: &str) -> Result<()> {
        if !self.targets.contains_key(target_id) {
            return Err(PortLinkError::TargetNotFound(target_id.to_string()));
        }
        self.force_disconnect(target_id, REASON_LOCAL_DISCONNECT)
            .await;
        Ok(())
    }

    /// Disconnect every target.
    pub async fn shutdown(self: &Arc<Self>) {
        let ids: Vec<String> = self.targets.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.force_disconnect(&id, REASON_LOCAL_DISCONNECT).await;
        }
    }

    pub fn connected_targets(&self) -> Vec<String> {
        self.targets
            .iter()
            .filter(|e| e.value().state() == TargetState::Connected)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn target_state(&self, target_id: &str) -> Option<TargetState> {
        self.targets.get(target_id).map(|t| t.state())
    }

    /// Tear a target down: reject its pending requests, close its channel,
    /// and emit exactly one disconnected notification.
    async fn force_disconnect(self: &Arc<Self>, target_id: &str, reason: &str) {
        let Some((_, target)) = self.targets.remove(target_id) else {
            return;
        };
        if !target.set_state(TargetState::Disconnecting) {
            return;
        }

        // Reject outstanding requests synchronously, before any await, so no
        // caller can observe a half-torn-down target.
        let ids: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|e| e.value().target_id == target_id)
            .map(|e| *e.key())
            .collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(PortLinkError::Connection(format!(
                    "target disconnected: {reason}"
                ))));
            }
        }

        target.channel().disconnect().await;
        target.set_state(TargetState::Disconnected);

        self.log.info(
            "target disconnected",
            Some(&json!({ "target": target_id, "reason": reason })),
        );
        let event = SystemEvent::new(SystemEventKind::Disconnected)
            .target(target_id)
            .reason(reason);
        self.bus.emit(&event);
        self.analytics.record(&event);

        // Last: may abort the task this runs on; that only takes effect at
        // the next await point, after cleanup is done.
        target.abort_tasks();
    }

    // ---- registration ----

    /// Register a handler (plus optional schema and overrides) for a type.
    pub fn on(
        &self,
        msg_type: &str,
        handler: impl Fn(Delivery, Responder) + Send + Sync + 'static,
        opts: RegisterOptions,
    ) -> Result<HandlerId> {
        if is_reserved_type(msg_type) {
            return Err(PortLinkError::Config(format!(
                "message type is reserved for protocol control: {msg_type}"
            )));
        }
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        let mut entry = self.types.entry(msg_type.to_string()).or_default();
        if opts.schema.is_some() {
            entry.schema = opts.schema;
        }
        if opts.timeout_ms.is_some() {
            entry.timeout_ms = opts.timeout_ms;
        }
        if opts.retries.is_some() {
            entry.retries = opts.retries;
        }
        if opts.on_error.is_some() {
            entry.on_error = opts.on_error;
        }
        entry.handlers.push((id, Arc::new(handler)));
        Ok(id)
    }

    /// Remove one registered handler.
    pub fn off(&self, msg_type: &str, id: HandlerId) {
        if let Some(mut entry) = self.types.get_mut(msg_type) {
            entry.handlers.retain(|(hid, _)| *hid != id);
        }
    }

    /// Subscribe to lifecycle events.
    pub fn on_system(
        &self,
        kind: SystemEventKind,
        handler: impl Fn(&SystemEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.bus.subscribe(kind, handler)
    }

    pub fn off_system(&self, kind: SystemEventKind, id: SubscriptionId) {
        self.bus.unsubscribe(kind, id);
    }

    // ---- sending ----

    /// Send a typed message to one target.
    ///
    /// Response-expecting sends create a pending request and retry on
    /// timeout: the identical payload is retransmitted under a fresh message
    /// id with the same timeout, until retries are exhausted.
    pub async fn send(
        self: &Arc<Self>,
        target_id: &str,
        msg_type: &str,
        payload: Value,
        opts: SendOptions,
    ) -> Result<Value> {
        if is_reserved_type(msg_type) {
            return Err(PortLinkError::Validation(format!(
                "message type is reserved for protocol control: {msg_type}"
            )));
        }
        let target = self
            .targets
            .get(target_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| PortLinkError::TargetNotFound(target_id.to_string()))?;
        if target.state() != TargetState::Connected {
            return Err(PortLinkError::NotConnected(target_id.to_string()));
        }

        let (schema, type_timeout, type_retries) = match self.types.get(msg_type) {
            Some(reg) => (reg.schema.clone(), reg.timeout_ms, reg.retries),
            None => (None, None, None),
        };
        if let Some(schema) = &schema {
            let outcome = validate(&payload, schema);
            if !outcome.valid {
                // Fail fast: no transmission attempt on a contract mismatch.
                return Err(PortLinkError::Validation(join_errors(&outcome.errors)));
            }
        }
        let payload = if opts.sanitize {
            sanitize_payload(&payload)
        } else {
            payload
        };
        let timeout_ms = opts
            .timeout_ms
            .or(type_timeout)
            .unwrap_or(self.cfg.engine.send_timeout_ms);
        let retries = opts
            .retries
            .or(type_retries)
            .unwrap_or(self.cfg.engine.send_retries);

        if !opts.expects_response {
            let env = Envelope::message(msg_type, payload, &self.local_origin, false)
                .with_target(target_id);
            return match target.channel().send(&env).await {
                Ok(()) => {
                    target.reset_send_failures();
                    Ok(Value::Null)
                }
                Err(e) => {
                    self.record_send_failure(&target).await;
                    Err(e)
                }
            };
        }

        let total_attempts = retries.saturating_add(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            // Fresh id per attempt; the stale pending entry is removed before
            // the retransmit, so ids are never live twice.
            let env = Envelope::message(msg_type, payload.clone(), &self.local_origin, true)
                .with_target(target_id);
            let (tx, rx) = oneshot::channel();
            self.pending.insert(
                env.id,
                PendingRequest {
                    target_id: target_id.to_string(),
                    tx,
                },
            );

            if let Err(e) = target.channel().send(&env).await {
                self.pending.remove(&env.id);
                self.record_send_failure(&target).await;
                return Err(e);
            }

            match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
                Ok(Ok(result)) => {
                    target.reset_send_failures();
                    return result;
                }
                Ok(Err(_)) => {
                    // Pending entry was consumed by a disconnect rejection
                    // whose error we can no longer retrieve.
                    return Err(PortLinkError::Connection(format!(
                        "target disconnected: {target_id}"
                    )));
                }
                Err(_) => {
                    self.pending.remove(&env.id);
                    if attempt >= total_attempts {
                        let event = SystemEvent::new(SystemEventKind::MessageTimeout)
                            .target(target_id)
                            .detail(json!({ "type": msg_type, "attempts": attempt }));
                        self.bus.emit(&event);
                        self.analytics.record(&event);
                        self.record_send_failure(&target).await;
                        return Err(PortLinkError::Timeout { attempts: attempt });
                    }
                    self.log.debug(
                        "send timed out, retrying",
                        Some(&json!({ "type": msg_type, "attempt": attempt })),
                    );
                }
            }
        }
    }

    /// Fan a fire-and-forget send out to every connected target. Per-target
    /// failures are isolated; the aggregate reports each outcome.
    pub async fn broadcast(
        self: &Arc<Self>,
        msg_type: &str,
        payload: Value,
    ) -> Result<BroadcastResult> {
        if is_reserved_type(msg_type) {
            return Err(PortLinkError::Validation(format!(
                "message type is reserved for protocol control: {msg_type}"
            )));
        }
        if let Some(reg) = self.types.get(msg_type) {
            if let Some(schema) = &reg.schema {
                let outcome = validate(&payload, schema);
                if !outcome.valid {
                    return Err(PortLinkError::Validation(join_errors(&outcome.errors)));
                }
            }
        }
        let payload = sanitize_payload(&payload);

        let targets: Vec<Arc<Target>> = self
            .targets
            .iter()
            .filter(|e| e.value().state() == TargetState::Connected)
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut futs = FuturesUnordered::new();
        for target in targets {
            let env = Envelope::message(msg_type, payload.clone(), &self.local_origin, false)
                .with_target(&target.id);
            futs.push(async move {
                let result = target.channel().send(&env).await;
                BroadcastOutcome {
                    target_id: target.id.clone(),
                    result,
                }
            });
        }

        let mut out = BroadcastResult::default();
        while let Some(outcome) = futs.next().await {
            out.outcomes.push(outcome);
        }
        Ok(out)
    }

    async fn record_send_failure(self: &Arc<Self>, target: &Arc<Target>) {
        let failures = target.note_send_failure();
        if failures >= self.cfg.engine.max_send_failures {
            self.force_disconnect(&target.id, REASON_SEND_FAILURES).await;
        }
    }

    pub(crate) async fn transmit_reply(self: &Arc<Self>, target_id: &str, reply: Envelope) {
        let Some(target) = self.targets.get(target_id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        if let Err(e) = target.channel().send(&reply).await {
            self.log.warn(
                "reply transmission failed",
                Some(&json!({ "target": target_id, "error": e.to_string() })),
            );
        }
    }

    // ---- inbound ----

    async fn run_inbound(self: Arc<Self>, target: Arc<Target>, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(env) = rx.recv().await {
            target.touch();
            match env.control_kind() {
                Some(ControlKind::HeartbeatPing) => {
                    let mut pong =
                        Envelope::control(ControlKind::HeartbeatPong, &self.local_origin);
                    pong.reply_to = Some(env.id);
                    pong.ok = Some(true);
                    let _ = target.channel().send(&pong).await;
                }
                Some(ControlKind::HeartbeatPong) => {
                    target.record_heartbeat();
                    self.resolve_reply(env);
                }
                Some(ControlKind::Disconnect) => {
                    self.force_disconnect(&target.id, REASON_REMOTE_DISCONNECT)
                        .await;
                    break;
                }
                // Handshake control never crosses the channel boundary.
                Some(_) => {}
                None if env.is_reply() => self.resolve_reply(env),
                None => self.dispatch_message(&target, env),
            }
        }
        // Inbound stream gone with the target still registered: the channel
        // collapsed underneath us.
        if self.targets.contains_key(&target.id) {
            self.force_disconnect(&target.id, REASON_CHANNEL_CLOSED).await;
        }
    }

    /// Resolve or reject the pending request a reply refers to. Late and
    /// duplicate replies have no pending entry and are discarded silently.
    fn resolve_reply(&self, env: Envelope) {
        let Some(reply_to) = env.reply_to else {
            return;
        };
        let Some((_, pending)) = self.pending.remove(&reply_to) else {
            return;
        };
        let result = match env.ok {
            Some(true) => Ok(env.payload),
            _ => {
                let (code, message) = env
                    .error
                    .map(|e| (e.code, e.message))
                    .unwrap_or_else(|| ("INTERNAL".to_string(), "unspecified failure".into()));
                Err(error_from_wire(&code, message))
            }
        };
        let _ = pending.tx.send(result);
    }

    /// Dispatch one application envelope: validate once, then run every
    /// handler with a shared respond-once callback. Errors here are contained
    /// per message; they reach the per-type error hook and nothing else.
    fn dispatch_message(self: &Arc<Self>, target: &Arc<Target>, env: Envelope) {
        let (schema, handlers, hook) = match self.types.get(&env.msg_type) {
            Some(reg) => (
                reg.schema.clone(),
                reg.handlers
                    .iter()
                    .map(|(_, h)| Arc::clone(h))
                    .collect::<Vec<_>>(),
                reg.on_error.clone(),
            ),
            None => return,
        };

        if let Some(schema) = &schema {
            let outcome = validate(&env.payload, schema);
            if !outcome.valid {
                let err = PortLinkError::Validation(join_errors(&outcome.errors));
                if let Some(hook) = hook {
                    hook(&err);
                }
                let event = SystemEvent::new(SystemEventKind::HandlerError)
                    .target(&target.id)
                    .detail(json!({ "type": env.msg_type, "error": err.to_string() }));
                self.analytics.record(&event);
                return;
            }
        }

        let delivery = Delivery::from_envelope(&env, &target.id);
        let responder = Responder::new(Arc::downgrade(self), &target.id, env, &self.local_origin);
        for handler in handlers {
            handler(delivery.clone(), responder.clone());
        }
    }

    // ---- heartbeat ----

    /// Periodic ping/pong liveness probe for one target.
    async fn run_heartbeat(self: Arc<Self>, target: Arc<Target>) {
        let interval = Duration::from_millis(self.cfg.heartbeat.interval_ms);
        let ping_timeout = Duration::from_millis(self.cfg.heartbeat.timeout_ms);
        loop {
            tokio::time::sleep(interval).await;
            if !self.targets.contains_key(&target.id) || target.state() != TargetState::Connected {
                break;
            }
            if target.channel().is_peer_closed() {
                self.force_disconnect(&target.id, REASON_PEER_CLOSED).await;
                break;
            }

            let mut ping = Envelope::control(ControlKind::HeartbeatPing, &self.local_origin)
                .with_target(&target.id);
            ping.expects_response = true;
            let (tx, rx) = oneshot::channel();
            self.pending.insert(
                ping.id,
                PendingRequest {
                    target_id: target.id.clone(),
                    tx,
                },
            );

            let ponged = match target.channel().send(&ping).await {
                Ok(()) => matches!(
                    tokio::time::timeout(ping_timeout, rx).await,
                    Ok(Ok(Ok(_)))
                ),
                Err(_) => false,
            };
            if ponged {
                target.record_heartbeat();
                continue;
            }

            self.pending.remove(&ping.id);
            let missed = target.miss_heartbeat();
            self.log.debug(
                "heartbeat missed",
                Some(&json!({ "target": target.id, "missed": missed })),
            );
            if missed >= self.cfg.heartbeat.max_missed {
                self.force_disconnect(&target.id, REASON_HEARTBEAT_TIMEOUT)
                    .await;
                break;
            }
        }
    }
}

fn is_reserved_type(msg_type: &str) -> bool {
    ControlKind::from_type(msg_type).is_some() || msg_type.starts_with("__portlink")
}

fn join_errors(errors: &[portlink_core::schema::ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.path, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Map a wire failure code back to the matching typed error.
fn error_from_wire(code: &str, message: String) -> PortLinkError {
    match code {
        c if c == ErrorCode::Validation.as_str() => PortLinkError::Validation(message),
        // The remote's attempt count does not travel on the wire; 0 marks a
        // relayed timeout as distinct from a locally counted one.
        c if c == ErrorCode::Timeout.as_str() => PortLinkError::Timeout { attempts: 0 },
        c if c == ErrorCode::TargetNotFound.as_str() => PortLinkError::TargetNotFound(message),
        c if c == ErrorCode::NotConnected.as_str() => PortLinkError::NotConnected(message),
        c if c == ErrorCode::Security.as_str() => PortLinkError::Security(message),
        c if c == ErrorCode::Serialization.as_str() => PortLinkError::Serialization(message),
        c if c == ErrorCode::Connection.as_str() => PortLinkError::Connection(message),
        c if c == ErrorCode::Config.as_str() => PortLinkError::Config(message),
        _ => PortLinkError::Internal(message),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn wire_codes_map_back_to_typed_errors() {
        assert!(matches!(
            error_from_wire("TIMEOUT", "remote timed out".into()),
            PortLinkError::Timeout { attempts: 0 }
        ));
        assert_eq!(
            error_from_wire("VALIDATION_FAILED", "bad".into()).code(),
            ErrorCode::Validation
        );
        assert_eq!(
            error_from_wire("SECURITY", "origin".into()).code(),
            ErrorCode::Security
        );
        // Unknown codes collapse to internal rather than erroring.
        assert_eq!(
            error_from_wire("NO_SUCH_CODE", "??".into()).code(),
            ErrorCode::Internal
        );
    }
}
