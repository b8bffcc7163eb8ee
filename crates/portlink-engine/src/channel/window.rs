//! Opened-window channel.
//!
//! Symmetric handshake: the opener initiates, the opened window answers. The
//! opened side usually cannot read its opener's origin, so it learns it from
//! the validated HANDSHAKE_INIT (or from explicit configuration).

use std::sync::Arc;

use async_trait::async_trait;
use portlink_core::envelope::Envelope;
use portlink_core::Result;
use tokio::sync::{mpsc, watch};

use crate::transport::{PortKind, RawPort};

use super::base::{ChannelCore, HandshakeRole};
use super::{Channel, ChannelOptions, ChannelState};

/// Which end of the window relationship this channel sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowRole {
    /// The window that called open. Initiates the handshake.
    Opener,
    /// The opened window. Answers the handshake.
    Opened,
}

pub struct WindowChannel {
    core: Arc<ChannelCore>,
    role: WindowRole,
}

impl WindowChannel {
    pub fn new(port: Arc<dyn RawPort>, role: WindowRole, opts: ChannelOptions) -> Self {
        Self {
            core: Arc::new(ChannelCore::new(port, opts)),
            role,
        }
    }

    fn handshake_role(&self) -> HandshakeRole {
        match self.role {
            WindowRole::Opener => HandshakeRole::Initiator,
            WindowRole::Opened => HandshakeRole::Acceptor,
        }
    }
}

#[async_trait]
impl Channel for WindowChannel {
    async fn connect(&self) -> Result<()> {
        self.core.connect_as(self.handshake_role()).await
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
        PortKind::OpenedWindow
    }

    fn is_peer_closed(&self) -> bool {
        self.core.is_peer_closed()
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.core.take_inbound()
    }
}
