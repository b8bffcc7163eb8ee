//! Embedded-frame channel.
//!
//! The host side owns the frame: it waits for the frame to finish loading,
//! resolves the frame's origin (directly when same-origin, from explicit
//! configuration when cross-origin), then initiates the handshake. The
//! embedded side answers inits.

use std::sync::Arc;

use async_trait::async_trait;
use portlink_core::envelope::Envelope;
use portlink_core::Result;
use tokio::sync::{mpsc, watch};

use crate::transport::{PortKind, RawPort};

use super::base::{ChannelCore, HandshakeRole};
use super::{Channel, ChannelOptions, ChannelState};

/// Which end of the frame embedding this channel sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSide {
    /// The host page embedding the frame. Initiates the handshake.
    Host,
    /// The embedded frame. Answers the handshake.
    Embedded,
}

pub struct FrameChannel {
    core: Arc<ChannelCore>,
    side: FrameSide,
}

impl FrameChannel {
    pub fn new(port: Arc<dyn RawPort>, side: FrameSide, opts: ChannelOptions) -> Self {
        Self {
            core: Arc::new(ChannelCore::new(port, opts)),
            side,
        }
    }

    fn role(&self) -> HandshakeRole {
        match self.side {
            FrameSide::Host => HandshakeRole::Initiator,
            FrameSide::Embedded => HandshakeRole::Acceptor,
        }
    }
}

#[async_trait]
impl Channel for FrameChannel {
    async fn connect(&self) -> Result<()> {
        self.core.connect_as(self.role()).await
    }

    async fn send(&self, env: &Envelope) -> Result<()> {
        self.core.send(env).await
    }

    async fn disconnect(&self) {
        self.core.disconnect().await;
    }

    fn state(&self) -> ChannelState {
        self.core.state()
    }

    fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.core.state_changes()
    }

    fn remote_origin(&self) -> Option<String> {
        self.core.remote_origin()
    }

    fn kind(&self) -> PortKind {
        PortKind::EmbeddedFrame
    }

    fn is_peer_closed(&self) -> bool {
        self.core.is_peer_closed()
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.core.take_inbound()
    }
}
