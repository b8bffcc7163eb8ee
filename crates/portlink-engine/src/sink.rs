//! Collaborator sinks.
//!
//! Logging and analytics are opaque, fire-and-forget collaborators: nothing
//! they do can fail back into the engine. They are injected at session-manager
//! construction rather than held as process-wide singletons, so lifecycle is
//! scoped to the instance.

use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

use crate::bus::SystemEvent;

/// Install the default `tracing` subscriber (env-filtered fmt output).
/// Embedders that run their own subscriber skip this.
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Logging sink. Implementations must never fail.
pub trait LogSink: Send + Sync {
    fn debug(&self, message: &str, data: Option<&Value>);
    fn info(&self, message: &str, data: Option<&Value>);
    fn warn(&self, message: &str, data: Option<&Value>);
    fn error(&self, message: &str, data: Option<&Value>);
}

/// Default sink forwarding to `tracing`.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn debug(&self, message: &str, data: Option<&Value>) {
        match data {
            Some(d) => tracing::debug!(data = %d, "{message}"),
            None => tracing::debug!("{message}"),
        }
    }
    fn info(&self, message: &str, data: Option<&Value>) {
        match data {
            Some(d) => tracing::info!(data = %d, "{message}"),
            None => tracing::info!("{message}"),
        }
    }
    fn warn(&self, message: &str, data: Option<&Value>) {
        match data {
            Some(d) => tracing::warn!(data = %d, "{message}"),
            None => tracing::warn!("{message}"),
        }
    }
    fn error(&self, message: &str, data: Option<&Value>) {
        match data {
            Some(d) => tracing::error!(data = %d, "{message}"),
            None => tracing::error!("{message}"),
        }
    }
}

/// Analytics sink. Record-only; the engine ignores anything it does.
pub trait AnalyticsSink: Send + Sync {
    fn record(&self, event: &SystemEvent);
}

/// Drops every event.
#[derive(Debug, Default)]
pub struct NullAnalyticsSink;

impl AnalyticsSink for NullAnalyticsSink {
    fn record(&self, _event: &SystemEvent) {}
}
