//! Transport provider seam.
//!
//! The negotiation state machine and the transfer pipelines only see these
//! traits. The production implementation is [`webrtc::WebRtcProvider`]; tests
//! use the loopback provider in `mock`.
//!
//! Provider callbacks (candidate gathered, state changed, channel opened,
//! message arrived…) are not delivered as closures. They are pushed as
//! [`SessionEvent`]s onto one unbounded channel per session so that the owner
//! can dispatch them in order from a single task.

pub mod webrtc;

#[cfg(test)]
pub mod mock;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::protocol::signaling::{IceCandidate, SessionDescription};

/// Connection state reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    /// Transient loss; the provider may still recover.
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Options for a new transport session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// STUN/TURN URLs.
    pub ice_servers: Vec<String>,
}

/// Per-channel notifications.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Close,
    Message(Bytes),
}

/// Everything a transport session reports to its owner.
pub enum SessionEvent {
    /// A local ICE candidate was gathered and should be sent to the peer.
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    /// The remote side created a channel.
    IncomingChannel(Arc<dyn DataChannel>),
    Channel { label: String, event: ChannelEvent },
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            Self::IncomingChannel(ch) => f.debug_tuple("IncomingChannel").field(&ch.label()).finish(),
            Self::Channel { label, event } => f
                .debug_struct("Channel")
                .field("label", label)
                .field("event", event)
                .finish(),
        }
    }
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Factory for transport sessions.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn create_session(
        &self,
        config: &SessionConfig,
    ) -> Result<(Arc<dyn TransportSession>, SessionEvents)>;
}

/// One peer-to-peer transport session (a peer connection).
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Create an ordered, reliable channel.
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;
    async fn close(&self) -> Result<()>;
}

/// One ordered, reliable message channel inside a session.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    async fn send(&self, data: Bytes) -> Result<()>;
    /// Bytes queued locally and not yet handed to the network.
    async fn buffered_amount(&self) -> usize;
    async fn set_buffered_amount_low_threshold(&self, threshold: usize);
    /// Resolves after the provider signals that the buffered amount fell to
    /// the low threshold. Callers must re-check [`buffered_amount`] afterwards.
    ///
    /// [`buffered_amount`]: DataChannel::buffered_amount
    async fn buffered_amount_low(&self);
    async fn close(&self) -> Result<()>;
}
