use serde::Deserialize;
use portlink_core::{PortLinkError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub version: u32,

    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub heartbeat: HeartbeatSection,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(PortLinkError::Config("unsupported config version".into()));
        }
        self.engine.validate()?;
        self.heartbeat.validate()?;
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            engine: EngineSection::default(),
            heartbeat: HeartbeatSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    /// Origins trusted for inbound traffic. Empty means deny everything.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_send_retries")]
    pub send_retries: u32,

    /// Consecutive response-expecting send failures that force a disconnect.
    #[serde(default = "default_max_send_failures")]
    pub max_send_failures: u32,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            send_retries: default_send_retries(),
            max_send_failures: default_max_send_failures(),
        }
    }
}

impl EngineSection {
    pub fn validate(&self) -> Result<()> {
        if !(50..=120_000).contains(&self.handshake_timeout_ms) {
            return Err(PortLinkError::Config(
                "engine.handshake_timeout_ms must be between 50 and 120000".into(),
            ));
        }
        if !(50..=600_000).contains(&self.send_timeout_ms) {
            return Err(PortLinkError::Config(
                "engine.send_timeout_ms must be between 50 and 600000".into(),
            ));
        }
        if self.send_retries > 10 {
            return Err(PortLinkError::Config(
                "engine.send_retries must be at most 10".into(),
            ));
        }
        if self.max_send_failures == 0 {
            return Err(PortLinkError::Config(
                "engine.max_send_failures must be at least 1".into(),
            ));
        }
        for origin in &self.allowed_origins {
            if portlink_core::security::normalize_origin(origin).is_none() {
                return Err(PortLinkError::Config(format!(
                    "engine.allowed_origins entry is not a valid origin: {origin}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatSection {
    #[serde(default = "default_heartbeat_enabled")]
    pub enabled: bool,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            enabled: default_heartbeat_enabled(),
            interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_heartbeat_timeout_ms(),
            max_missed: default_max_missed(),
        }
    }
}

impl HeartbeatSection {
    pub fn validate(&self) -> Result<()> {
        if !(20..=300_000).contains(&self.interval_ms) {
            return Err(PortLinkError::Config(
                "heartbeat.interval_ms must be between 20 and 300000".into(),
            ));
        }
        if self.timeout_ms == 0 || self.timeout_ms >= self.interval_ms {
            return Err(PortLinkError::Config(
                "heartbeat.timeout_ms must be positive and below interval_ms".into(),
            ));
        }
        if self.max_missed == 0 {
            return Err(PortLinkError::Config(
                "heartbeat.max_missed must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_send_timeout_ms() -> u64 {
    10_000
}
fn default_send_retries() -> u32 {
    1
}
fn default_max_send_failures() -> u32 {
    3
}
fn default_heartbeat_enabled() -> bool {
    true
}
fn default_heartbeat_interval_ms() -> u64 {
    15_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}
fn default_max_missed() -> u32 {
    3
}
