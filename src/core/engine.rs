//! Engine: the client-side coordinator.
//!
//! One task owns the engine and feeds it, in order, everything that can
//! change its state:
//!
//! - envelopes from the relay ([`RelayMessage`]),
//! - commands from the CLI ([`EngineCommand`]),
//! - transport events of every peer session, tagged with the session's
//!   generation so events of a replaced session are dropped,
//! - completions of sender tasks.
//!
//! Per remote peer it keeps at most one negotiation session (with its
//! channel pool), one outgoing transfer and one incoming transfer.
//!
//! A transfer starts with a relayed `file-transfer-request`. Once the
//! receiver accepts, both sides create their session for the pair; the
//! initiator offers and, after the transport connects, opens the channels.
//! The sender streams as soon as every channel is open. The receiver
//! acknowledges a finalized file with a `file-received` frame.
//!
//! Failures become status updates here. A fatal session failure, the peer
//! leaving presence, or the relay disappearing tears down the session and
//! whatever transfer rides on it. A user cancel stops the sender, tells the
//! receiver, and closes the session.

use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::core::config::{
    CHUNK_SIZE, DC_BUFFERED_AMOUNT_HIGH, DC_BUFFERED_AMOUNT_LOW, DEFAULT_CHANNEL_COUNT,
};
use crate::core::negotiation::registry::SessionRegistry;
use crate::core::negotiation::{
    NegotiationAction, NegotiationEvent, NegotiationSession, NegotiationState, Role,
};
use crate::core::pipeline::pool::TransferChannelPool;
use crate::core::pipeline::receiver::{ReceiveEvent, ReceiverPipeline};
use crate::core::pipeline::sender::{send_cancel, SenderPipeline};
use crate::core::pipeline::sink::SinkFactory;
use crate::core::pipeline::source::ChunkSource;
use crate::core::protocol::frame::{decode_frame, encode_control_frame, ControlFrame, Frame};
use crate::core::protocol::signaling::{FileDescriptor, PresenceRecord, RelayMessage};
use crate::core::transfer::{
    TransferDirection, TransferState, TransferStatus, TransferTracker,
};
use crate::core::transport::{ChannelEvent, SessionConfig, SessionEvent, TransportProvider};

// ── Public surface ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub channels: usize,
    pub chunk_size: usize,
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub ice_servers: Vec<String>,
    /// Accept every transfer request without asking.
    pub auto_accept: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNEL_COUNT,
            chunk_size: CHUNK_SIZE,
            high_watermark: DC_BUFFERED_AMOUNT_HIGH,
            low_watermark: DC_BUFFERED_AMOUNT_LOW,
            ice_servers: Vec::new(),
            auto_accept: false,
        }
    }
}

pub enum EngineCommand {
    /// Ask `peer` to accept `source` under `file_name`.
    SendFile {
        peer: String,
        file_name: String,
        mime: String,
        source: Arc<dyn ChunkSource>,
    },
    /// Answer a pending transfer request.
    Respond { peer: String, accept: bool },
    /// Cancel every transfer in progress.
    Cancel,
    Rename(String),
    Shutdown,
}

#[derive(Debug)]
pub enum EngineNotice {
    /// Presence snapshot without ourselves.
    Peers(Vec<PresenceRecord>),
    IncomingRequest { peer: String, file: FileDescriptor },
    TransferStarted {
        peer: String,
        progress: watch::Receiver<TransferState>,
    },
    TransferFinished { peer: String, state: TransferState },
    /// The receiver confirmed the file we sent.
    Acknowledged { peer: String },
    SessionClosed { peer: String, failed: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    Shutdown,
    RelayLost,
}

// ── Internals ────────────────────────────────────────────────────────────────

enum Internal {
    Session {
        peer: String,
        generation: u64,
        event: SessionEvent,
    },
    SendDone {
        peer: String,
        status: TransferStatus,
    },
}

struct Outgoing {
    source: Arc<dyn ChunkSource>,
    tracker: Arc<TransferTracker>,
    accepted: bool,
    task: Option<JoinHandle<()>>,
}

pub struct Engine {
    config: EngineConfig,
    local_id: String,
    provider: Arc<dyn TransportProvider>,
    sinks: Arc<dyn SinkFactory>,
    relay: mpsc::UnboundedSender<RelayMessage>,
    notices: mpsc::UnboundedSender<EngineNotice>,
    registry: SessionRegistry,
    outgoing: HashMap<String, Outgoing>,
    receivers: HashMap<String, ReceiverPipeline>,
    pending_requests: HashMap<String, FileDescriptor>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        local_id: impl Into<String>,
        provider: Arc<dyn TransportProvider>,
        sinks: Arc<dyn SinkFactory>,
        relay: mpsc::UnboundedSender<RelayMessage>,
        notices: mpsc::UnboundedSender<EngineNotice>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            config,
            local_id: local_id.into(),
            provider,
            sinks,
            relay,
            notices,
            registry: SessionRegistry::new(),
            outgoing: HashMap::new(),
            receivers: HashMap::new(),
            pending_requests: HashMap::new(),
            internal_tx,
            internal_rx: Some(internal_rx),
        }
    }

    /// Drive the engine until shutdown or until the relay goes away.
    pub async fn run(
        mut self,
        mut incoming: mpsc::UnboundedReceiver<RelayMessage>,
        mut commands: mpsc::UnboundedReceiver<EngineCommand>,
    ) -> Result<EngineExit> {
        let mut internal = self
            .internal_rx
            .take()
            .ok_or_else(|| anyhow!("engine event loop already started"))?;

        loop {
            tokio::select! {
                msg = incoming.recv() => match msg {
                    Some(msg) => self.handle_relay(msg).await,
                    None => {
                        warn!(event = "relay_lost", "Relay connection lost");
                        self.teardown_all("relay connection lost").await;
                        return Ok(EngineExit::RelayLost);
                    }
                },
                cmd = commands.recv() => match cmd {
                    Some(EngineCommand::Shutdown) | None => {
                        self.shutdown().await;
                        return Ok(EngineExit::Shutdown);
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(event) = internal.recv() => self.handle_internal(event).await,
            }
        }
    }

    fn notify(&self, notice: EngineNotice) {
        let _ = self.notices.send(notice);
    }

    fn signal(&self, msg: RelayMessage) {
        if self.relay.send(msg).is_err() {
            warn!(event = "relay_send_failure", "Relay writer is gone");
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::SendFile {
                peer,
                file_name,
                mime,
                source,
            } => self.request_send(peer, file_name, mime, source),
            EngineCommand::Respond { peer, accept } => {
                let Some(file) = self.pending_requests.remove(&peer) else {
                    warn!(event = "respond_without_request", peer = %peer);
                    return;
                };
                if accept {
                    self.accept_request(&peer, file).await;
                } else {
                    info!(event = "transfer_request_rejected", peer = %peer, file = %file.name);
                    self.signal(RelayMessage::reject_transfer(&peer));
                }
            }
            EngineCommand::Cancel => self.cancel_all().await,
            EngineCommand::Rename(nickname) => {
                self.signal(RelayMessage::NicknameUpdate { nickname });
            }
            EngineCommand::Shutdown => self.shutdown().await,
        }
    }

    fn request_send(
        &mut self,
        peer: String,
        file_name: String,
        mime: String,
        source: Arc<dyn ChunkSource>,
    ) {
        if self.outgoing.contains_key(&peer) {
            warn!(event = "send_already_active", peer = %peer);
            return;
        }
        let size = source.size();
        let tracker = Arc::new(TransferTracker::new(
            TransferDirection::Outbound,
            file_name.clone(),
            size,
        ));
        info!(event = "transfer_requested", peer = %peer, file = %file_name, size);
        self.signal(RelayMessage::transfer_request(
            &peer,
            FileDescriptor {
                name: file_name,
                size,
                mime,
            },
        ));
        self.outgoing.insert(
            peer,
            Outgoing {
                source,
                tracker,
                accepted: false,
                task: None,
            },
        );
    }

    async fn cancel_all(&mut self) {
        let peers: Vec<String> = self.outgoing.keys().cloned().collect();
        for peer in peers {
            let Some(out) = self.outgoing.get(&peer) else {
                continue;
            };
            if out.task.is_some() {
                // The sender task reports back through SendDone.
                out.tracker.cancel_handle().cancel();
            } else if let Some(out) = self.outgoing.remove(&peer) {
                out.tracker.finish(TransferStatus::Cancelled);
                self.notify(EngineNotice::TransferFinished {
                    peer: peer.clone(),
                    state: out.tracker.snapshot(),
                });
            }
        }

        let inbound: Vec<String> = self.receivers.keys().cloned().collect();
        for peer in inbound {
            if let Some(mut receiver) = self.receivers.remove(&peer) {
                if let Some(ReceiveEvent::Finished { progress, .. }) =
                    receiver.abort(TransferStatus::Cancelled).await
                {
                    let state = progress.borrow().clone();
                    self.notify(EngineNotice::TransferFinished { peer: peer.clone(), state });
                }
            }
            self.teardown(&peer, false, "transfer cancelled").await;
        }
    }

    async fn shutdown(&mut self) {
        info!(event = "engine_shutdown");
        for (peer, out) in &self.outgoing {
            let status = out.tracker.snapshot().status;
            if out.task.is_some() && matches!(status, TransferStatus::InProgress | TransferStatus::Cancelled) {
                out.tracker.cancel_handle().cancel();
                out.tracker.finish(TransferStatus::Cancelled);
                if let Some(session) = self.registry.get(peer) {
                    send_cancel(&session.pool).await;
                }
            }
        }
        self.teardown_all("shutting down").await;
    }

    // ── Relay ────────────────────────────────────────────────────────────────

    async fn handle_relay(&mut self, msg: RelayMessage) {
        match msg {
            RelayMessage::Users { users } => self.on_presence(users).await,
            RelayMessage::TransferRequest {
                sender_id: Some(peer),
                file,
                ..
            } => self.on_transfer_request(peer, file).await,
            RelayMessage::AcceptTransfer {
                sender_id: Some(peer),
                ..
            } => self.on_accepted(&peer).await,
            RelayMessage::RejectTransfer {
                sender_id: Some(peer),
                ..
            } => self.on_rejected(&peer),
            RelayMessage::Offer {
                sender_id: Some(peer),
                sdp,
                ..
            } => {
                if !self.has_live_session(&peer) && !self.open_session(&peer).await {
                    return;
                }
                self.negotiate(&peer, NegotiationEvent::RemoteOffer(sdp)).await;
            }
            RelayMessage::Answer {
                sender_id: Some(peer),
                sdp,
                ..
            } => {
                self.negotiate(&peer, NegotiationEvent::RemoteAnswer(sdp)).await;
            }
            RelayMessage::IceCandidate {
                sender_id: Some(peer),
                candidate,
                ..
            } => {
                self.negotiate(&peer, NegotiationEvent::RemoteCandidate(candidate))
                    .await;
            }
            RelayMessage::YourId { id, .. } => {
                debug!(event = "identity_repeated", id = %id);
            }
            other => {
                warn!(event = "relay_message_ignored", kind = other.kind());
            }
        }
    }

    async fn on_presence(&mut self, users: Vec<PresenceRecord>) {
        let peers: Vec<PresenceRecord> = users
            .into_iter()
            .filter(|u| u.id != self.local_id)
            .collect();
        let present: HashSet<&str> = peers.iter().map(|p| p.id.as_str()).collect();

        let mut departed: HashSet<String> = HashSet::new();
        let known = self
            .registry
            .peers()
            .into_iter()
            .chain(self.outgoing.keys().cloned())
            .chain(self.receivers.keys().cloned())
            .chain(self.pending_requests.keys().cloned());
        for peer in known {
            if !present.contains(peer.as_str()) {
                departed.insert(peer);
            }
        }
        debug!(event = "presence", peers = peers.len(), departed = departed.len());
        self.notify(EngineNotice::Peers(peers));

        for peer in departed {
            info!(event = "peer_departed", peer = %peer);
            self.pending_requests.remove(&peer);
            self.teardown(&peer, false, "peer left").await;
        }
    }

    async fn on_transfer_request(&mut self, peer: String, file: FileDescriptor) {
        info!(event = "transfer_request", peer = %peer, file = %file.name, size = file.size);
        if self.receivers.contains_key(&peer) || self.pending_requests.contains_key(&peer) {
            warn!(event = "transfer_request_busy", peer = %peer);
            self.signal(RelayMessage::reject_transfer(&peer));
            return;
        }
        if self.config.auto_accept {
            self.accept_request(&peer, file).await;
        } else {
            self.pending_requests.insert(peer.clone(), file.clone());
            self.notify(EngineNotice::IncomingRequest { peer, file });
        }
    }

    async fn accept_request(&mut self, peer: &str, file: FileDescriptor) {
        info!(event = "transfer_request_accepted", peer = %peer, file = %file.name);
        self.receivers
            .insert(peer.to_string(), ReceiverPipeline::new(self.sinks.clone()));
        self.signal(RelayMessage::accept_transfer(peer));
        if self.ensure_session(peer).await {
            self.kick_off(peer).await;
        }
    }

    async fn on_accepted(&mut self, peer: &str) {
        let Some(out) = self.outgoing.get_mut(peer) else {
            warn!(event = "unexpected_accept", peer = %peer);
            return;
        };
        out.accepted = true;
        info!(event = "transfer_accepted", peer = %peer);
        if !self.ensure_session(peer).await {
            self.fail_outgoing(peer, "cannot create transport session");
            return;
        }
        self.kick_off(peer).await;
        self.maybe_start_send(peer).await;
    }

    fn on_rejected(&mut self, peer: &str) {
        let Some(out) = self.outgoing.remove(peer) else {
            warn!(event = "unexpected_reject", peer = %peer);
            return;
        };
        info!(event = "transfer_rejected", peer = %peer);
        out.tracker.finish(TransferStatus::Rejected);
        self.notify(EngineNotice::TransferFinished {
            peer: peer.to_string(),
            state: out.tracker.snapshot(),
        });
    }

    fn fail_outgoing(&mut self, peer: &str, reason: &str) {
        if let Some(out) = self.outgoing.remove(peer) {
            out.tracker.finish(TransferStatus::Failed(reason.to_string()));
            self.notify(EngineNotice::TransferFinished {
                peer: peer.to_string(),
                state: out.tracker.snapshot(),
            });
        }
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    fn has_live_session(&self, peer: &str) -> bool {
        self.registry
            .get(peer)
            .is_some_and(|s| !s.negotiation.state().is_terminal())
    }

    /// Reuse a live session for `peer` or open a fresh one.
    async fn ensure_session(&mut self, peer: &str) -> bool {
        self.has_live_session(peer) || self.open_session(peer).await
    }

    async fn open_session(&mut self, peer: &str) -> bool {
        let config = SessionConfig {
            ice_servers: self.config.ice_servers.clone(),
        };
        let (transport, mut events) = match self.provider.create_session(&config).await {
            Ok(created) => created,
            Err(e) => {
                error!(event = "session_create_failure", peer = %peer, error = %e);
                return false;
            }
        };
        let negotiation = NegotiationSession::new(&self.local_id, peer, transport);
        let pool = Arc::new(TransferChannelPool::new(self.config.channels));
        pool.set_watermarks(self.config.high_watermark, self.config.low_watermark)
            .await;

        let (generation, stale) = self.registry.insert(negotiation, pool);
        if let Some(stale) = stale {
            stale.shutdown().await;
        }

        let tx = self.internal_tx.clone();
        let owner = peer.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let tagged = Internal::Session {
                    peer: owner.clone(),
                    generation,
                    event,
                };
                if tx.send(tagged).is_err() {
                    break;
                }
            }
        });
        true
    }

    /// Initiator: send the offer if the session has not started yet.
    async fn kick_off(&mut self, peer: &str) {
        let idle_initiator = self.registry.get(peer).is_some_and(|s| {
            s.negotiation.role() == Role::Initiator
                && s.negotiation.state() == NegotiationState::Idle
        });
        if idle_initiator {
            self.negotiate(peer, NegotiationEvent::Start).await;
        }
    }

    async fn negotiate(&mut self, peer: &str, event: NegotiationEvent) {
        let Some(session) = self.registry.get_mut(peer) else {
            debug!(event = "negotiation_without_session", peer = %peer);
            return;
        };
        let actions = session.negotiation.dispatch(event).await;
        for action in actions {
            match action {
                NegotiationAction::Signal(msg) => self.signal(msg),
                NegotiationAction::Connected => self.maybe_start_send(peer).await,
                NegotiationAction::OpenChannels => self.open_channels(peer).await,
                NegotiationAction::Teardown { failed } => {
                    let reason = if failed {
                        "transport session failed"
                    } else {
                        "transport session closed"
                    };
                    self.teardown(peer, failed, reason).await;
                }
            }
        }
    }

    async fn open_channels(&mut self, peer: &str) {
        let Some(session) = self.registry.get(peer) else {
            return;
        };
        let transport = session.negotiation.transport().clone();
        let pool = session.pool.clone();
        for index in 0..pool.len() {
            let label = TransferChannelPool::label(index);
            match transport.create_channel(&label).await {
                Ok(channel) => {
                    pool.register(channel).await;
                }
                Err(e) => {
                    error!(event = "channel_create_failure", peer = %peer, channel = %label, error = %e);
                    self.teardown(peer, true, "cannot open transfer channels").await;
                    return;
                }
            }
        }
        debug!(event = "channels_opened", peer = %peer, count = pool.len());
        self.maybe_start_send(peer).await;
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Session {
                peer,
                generation,
                event,
            } => {
                if self.registry.current_mut(&peer, generation).is_none() {
                    trace!(event = "stale_session_event", peer = %peer, generation);
                    return;
                }
                self.on_session_event(&peer, event).await;
            }
            Internal::SendDone { peer, status } => self.on_send_done(&peer, status).await,
        }
    }

    async fn on_session_event(&mut self, peer: &str, event: SessionEvent) {
        match event {
            SessionEvent::LocalCandidate(c) => {
                self.negotiate(peer, NegotiationEvent::LocalCandidate(c)).await;
            }
            SessionEvent::StateChanged(state) => {
                self.negotiate(peer, NegotiationEvent::Transport(state)).await;
            }
            SessionEvent::IncomingChannel(channel) => {
                if let Some(session) = self.registry.get(peer) {
                    session.pool.register(channel).await;
                }
                self.maybe_start_send(peer).await;
            }
            SessionEvent::Channel { label, event } => match event {
                ChannelEvent::Open => {
                    debug!(event = "channel_open", peer = %peer, channel = %label);
                    self.maybe_start_send(peer).await;
                }
                ChannelEvent::Close => {
                    debug!(event = "channel_closed", peer = %peer, channel = %label);
                }
                ChannelEvent::Message(data) => match decode_frame(data) {
                    Ok(frame) => self.on_frame(peer, frame).await,
                    Err(e) => warn!(event = "frame_decode_failure", peer = %peer, channel = %label, error = %e),
                },
            },
        }
    }

    // ── Transfers ────────────────────────────────────────────────────────────

    async fn maybe_start_send(&mut self, peer: &str) {
        let Some(out) = self.outgoing.get_mut(peer) else {
            return;
        };
        if !out.accepted || out.task.is_some() {
            return;
        }
        let Some(session) = self.registry.get(peer) else {
            return;
        };
        if session.negotiation.state() != NegotiationState::Connected
            || !session.pool.all_ready().await
        {
            return;
        }

        let sender = SenderPipeline::new(session.pool.clone(), self.config.chunk_size);
        let source = out.source.clone();
        let tracker = out.tracker.clone();
        let done = self.internal_tx.clone();
        let owner = peer.to_string();
        out.task = Some(tokio::spawn(async move {
            let status = match sender.send(source, &tracker).await {
                Ok(status) => status,
                Err(e) => {
                    tracker.finish(TransferStatus::Failed(e.to_string()));
                    tracker.snapshot().status
                }
            };
            let _ = done.send(Internal::SendDone {
                peer: owner,
                status,
            });
        }));
        let progress = out.tracker.subscribe();
        self.notify(EngineNotice::TransferStarted {
            peer: peer.to_string(),
            progress,
        });
    }

    async fn on_send_done(&mut self, peer: &str, status: TransferStatus) {
        let Some(out) = self.outgoing.get(peer) else {
            return;
        };
        self.notify(EngineNotice::TransferFinished {
            peer: peer.to_string(),
            state: out.tracker.snapshot(),
        });
        match status {
            // Kept until the receiver acknowledges.
            TransferStatus::Completed => {
                debug!(event = "awaiting_ack", peer = %peer);
            }
            TransferStatus::Cancelled => {
                self.outgoing.remove(peer);
                if let Some(session) = self.registry.get(peer) {
                    send_cancel(&session.pool).await;
                }
                self.teardown(peer, false, "transfer cancelled").await;
            }
            _ => {
                self.outgoing.remove(peer);
            }
        }
    }

    async fn on_frame(&mut self, peer: &str, frame: Frame) {
        if frame == Frame::Control(ControlFrame::FileReceived) {
            if let Some(out) = self.outgoing.remove(peer) {
                out.tracker.acknowledge();
                info!(event = "transfer_acknowledged", peer = %peer);
                self.notify(EngineNotice::Acknowledged {
                    peer: peer.to_string(),
                });
            } else {
                debug!(event = "ack_without_transfer", peer = %peer);
            }
            return;
        }

        let Some(receiver) = self.receivers.get_mut(peer) else {
            warn!(event = "frame_without_accepted_transfer", peer = %peer);
            return;
        };
        match receiver.handle(frame).await {
            ReceiveEvent::Ignored | ReceiveEvent::Progress => {}
            ReceiveEvent::Started(progress) => {
                self.notify(EngineNotice::TransferStarted {
                    peer: peer.to_string(),
                    progress,
                });
            }
            ReceiveEvent::Finished {
                status, progress, ..
            } => {
                self.receivers.remove(peer);
                if status == TransferStatus::Completed {
                    self.acknowledge(peer);
                }
                let state = progress.borrow().clone();
                self.notify(EngineNotice::TransferFinished {
                    peer: peer.to_string(),
                    state,
                });
            }
        }
    }

    /// Send `file-received` on channel 0 without blocking the event loop.
    fn acknowledge(&self, peer: &str) {
        let Some(session) = self.registry.get(peer) else {
            return;
        };
        let frame = match encode_control_frame(&ControlFrame::FileReceived) {
            Ok(f) => f,
            Err(e) => {
                warn!(event = "ack_encode_failure", error = %e);
                return;
            }
        };
        let pool = session.pool.clone();
        let owner = peer.to_string();
        tokio::spawn(async move {
            if let Err(e) = pool.send_control(frame).await {
                warn!(event = "ack_send_failure", peer = %owner, error = %e);
            }
        });
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    async fn teardown(&mut self, peer: &str, failed: bool, reason: &str) {
        let session = self.registry.remove(peer);
        if let Some(out) = self.outgoing.remove(peer) {
            let was_terminal = out.tracker.snapshot().status.is_terminal();
            out.tracker.finish(TransferStatus::Failed(reason.to_string()));
            out.tracker.cancel_handle().cancel();
            if !was_terminal {
                self.notify(EngineNotice::TransferFinished {
                    peer: peer.to_string(),
                    state: out.tracker.snapshot(),
                });
            }
        }
        if let Some(mut receiver) = self.receivers.remove(peer) {
            if let Some(ReceiveEvent::Finished { progress, .. }) = receiver
                .abort(TransferStatus::Failed(reason.to_string()))
                .await
            {
                let state = progress.borrow().clone();
                self.notify(EngineNotice::TransferFinished {
                    peer: peer.to_string(),
                    state,
                });
            }
        }
        if let Some(session) = session {
            if failed {
                error!(event = "session_torn_down", peer = %peer, reason);
            } else {
                info!(event = "session_torn_down", peer = %peer, reason);
            }
            session.shutdown().await;
            self.notify(EngineNotice::SessionClosed {
                peer: peer.to_string(),
                failed,
            });
        }
    }

    async fn teardown_all(&mut self, reason: &str) {
        let peers: HashSet<String> = self
            .registry
            .peers()
            .into_iter()
            .chain(self.outgoing.keys().cloned())
            .chain(self.receivers.keys().cloned())
            .collect();
        for peer in peers {
            self.teardown(&peer, false, reason).await;
        }
        self.pending_requests.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::pool::TransferChannelPool;
    use crate::core::pipeline::sink::DirectorySinkFactory;
    use crate::core::pipeline::source::tests::MemorySource;
    use crate::core::protocol::frame::{encode_chunk_frame, CHUNK_HEADER_LEN};
    use crate::core::protocol::signaling::SessionDescription;
    use crate::core::transport::mock::{MockCall, MockChannel, MockProvider};
    use crate::core::transport::{DataChannel, TransportState};
    use bytes::Bytes;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Harness {
        engine: Engine,
        provider: Arc<MockProvider>,
        relay: mpsc::UnboundedReceiver<RelayMessage>,
        notices: mpsc::UnboundedReceiver<EngineNotice>,
    }

    impl Harness {
        fn new(local: &str, config: EngineConfig, out_dir: PathBuf) -> Self {
            let provider = Arc::new(MockProvider::default());
            let (relay_tx, relay) = mpsc::unbounded_channel();
            let (notice_tx, notices) = mpsc::unbounded_channel();
            let engine = Engine::new(
                config,
                local,
                provider.clone(),
                Arc::new(DirectorySinkFactory::new(out_dir)),
                relay_tx,
                notice_tx,
            );
            Self {
                engine,
                provider,
                relay,
                notices,
            }
        }

        fn relayed(&mut self) -> Vec<RelayMessage> {
            std::iter::from_fn(|| self.relay.try_recv().ok()).collect()
        }

        fn notices(&mut self) -> Vec<EngineNotice> {
            std::iter::from_fn(|| self.notices.try_recv().ok()).collect()
        }

        async fn transport(&mut self, peer: &str, generation: u64, event: SessionEvent) {
            self.engine
                .handle_internal(Internal::Session {
                    peer: peer.into(),
                    generation,
                    event,
                })
                .await;
        }

        /// Handle the next engine-internal event (sender completion etc).
        async fn step(&mut self) {
            let rx = self.engine.internal_rx.as_mut().unwrap();
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            self.engine.handle_internal(event).await;
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("peerdrop_test")
            .join("engine")
            .join(name);
        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn one_channel() -> EngineConfig {
        EngineConfig {
            channels: 1,
            chunk_size: 4,
            ..Default::default()
        }
    }

    fn from(peer: &str, msg: RelayMessage) -> RelayMessage {
        let mut value = serde_json::to_value(msg).unwrap();
        value["senderId"] = serde_json::json!(peer);
        value.as_object_mut().unwrap().remove("targetId");
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn sender_as_initiator_streams_after_channels_open() {
        let mut h = Harness::new("a1", one_channel(), test_dir("sender"));
        h.engine
            .handle_command(EngineCommand::SendFile {
                peer: "b2".into(),
                file_name: "a.bin".into(),
                mime: String::new(),
                source: Arc::new(MemorySource(Bytes::from_static(b"0123456789"))),
            })
            .await;
        assert!(matches!(
            h.relayed().as_slice(),
            [RelayMessage::TransferRequest { file, .. }] if file.size == 10
        ));

        h.engine
            .handle_relay(from("b2", RelayMessage::accept_transfer("a1")))
            .await;
        assert_eq!(h.provider.session_count(), 1);
        assert!(matches!(h.relayed().as_slice(), [RelayMessage::Offer { .. }]));

        let session = h.provider.session(0);
        session.set_open_on_create(true);
        h.engine
            .handle_relay(from(
                "b2",
                RelayMessage::answer("a1", SessionDescription::answer("v=0")),
            ))
            .await;
        h.transport("b2", 1, SessionEvent::StateChanged(TransportState::Connected))
            .await;
        assert!(session
            .calls()
            .contains(&MockCall::CreateChannel("file-transfer-0".into())));

        // The sender task runs; wait for it to report back.
        h.step().await;
        let wire = session.channels()[0].clone();
        assert_eq!(wire.sent_count(), 1 + 3);
        let notices = h.notices();
        assert!(notices
            .iter()
            .any(|n| matches!(n, EngineNotice::TransferStarted { .. })));
        assert!(notices.iter().any(|n| matches!(
            n,
            EngineNotice::TransferFinished { state, .. } if state.status == TransferStatus::Completed && !state.acknowledged
        )));

        let ack = encode_control_frame(&ControlFrame::FileReceived).unwrap();
        h.transport(
            "b2",
            1,
            SessionEvent::Channel {
                label: "file-transfer-0".into(),
                event: ChannelEvent::Message(ack),
            },
        )
        .await;
        assert!(matches!(
            h.notices().as_slice(),
            [EngineNotice::Acknowledged { peer }] if peer == "b2"
        ));
        assert!(h.engine.outgoing.is_empty());
    }

    #[tokio::test]
    async fn receiver_as_responder_saves_and_acknowledges() {
        let dir = test_dir("receiver");
        let mut h = Harness::new(
            "b2",
            EngineConfig {
                auto_accept: true,
                ..one_channel()
            },
            dir.clone(),
        );
        h.engine
            .handle_relay(from(
                "a1",
                RelayMessage::transfer_request(
                    "b2",
                    FileDescriptor {
                        name: "notes.txt".into(),
                        size: 6,
                        mime: "text/plain".into(),
                    },
                ),
            ))
            .await;
        assert!(matches!(
            h.relayed().as_slice(),
            [RelayMessage::AcceptTransfer { .. }]
        ));
        // Responder: session exists but waits for the offer.
        assert!(h.provider.session(0).calls().is_empty());

        h.engine
            .handle_relay(from(
                "a1",
                RelayMessage::offer("b2", SessionDescription::offer("v=0")),
            ))
            .await;
        assert!(matches!(h.relayed().as_slice(), [RelayMessage::Answer { .. }]));

        let wire = MockChannel::open("file-transfer-0");
        h.transport("a1", 1, SessionEvent::IncomingChannel(wire.clone()))
            .await;
        let frames = [
            encode_control_frame(&ControlFrame::FileMetadata {
                name: "notes.txt".into(),
                size: 6,
            })
            .unwrap(),
            encode_chunk_frame(3, b"def"),
            encode_chunk_frame(0, b"abc"),
        ];
        for frame in frames {
            h.transport(
                "a1",
                1,
                SessionEvent::Channel {
                    label: "file-transfer-0".into(),
                    event: ChannelEvent::Message(frame),
                },
            )
            .await;
        }

        tokio::time::timeout(Duration::from_secs(1), wire.wait_sent(1))
            .await
            .unwrap();
        assert_eq!(
            decode_frame(wire.sent()[0].clone()).unwrap(),
            Frame::Control(ControlFrame::FileReceived)
        );
        assert_eq!(std::fs::read(dir.join("notes.txt")).unwrap(), b"abcdef");
        assert!(h.notices().iter().any(|n| matches!(
            n,
            EngineNotice::TransferFinished { state, .. } if state.status == TransferStatus::Completed && state.bytes_moved == 6
        )));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn sender_as_responder_streams_on_incoming_channel() {
        // "b2" > "a1": the sending side answers and never creates channels.
        let mut h = Harness::new("b2", one_channel(), test_dir("responder_sender"));
        h.engine
            .handle_command(EngineCommand::SendFile {
                peer: "a1".into(),
                file_name: "a.bin".into(),
                mime: String::new(),
                source: Arc::new(MemorySource(Bytes::from_static(b"0123456789"))),
            })
            .await;
        assert!(matches!(
            h.relayed().as_slice(),
            [RelayMessage::TransferRequest { .. }]
        ));

        h.engine
            .handle_relay(from("a1", RelayMessage::accept_transfer("b2")))
            .await;
        assert_eq!(h.provider.session_count(), 1);
        let session = h.provider.session(0);
        assert!(session.calls().is_empty());
        assert!(h.relayed().is_empty());

        h.engine
            .handle_relay(from(
                "a1",
                RelayMessage::offer("b2", SessionDescription::offer("v=0")),
            ))
            .await;
        assert!(matches!(h.relayed().as_slice(), [RelayMessage::Answer { .. }]));

        h.transport("a1", 1, SessionEvent::StateChanged(TransportState::Connected))
            .await;
        assert!(!session
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::CreateChannel(_))));
        assert!(!h
            .notices()
            .iter()
            .any(|n| matches!(n, EngineNotice::TransferStarted { .. })));

        let wire = MockChannel::open("file-transfer-0");
        h.transport("a1", 1, SessionEvent::IncomingChannel(wire.clone()))
            .await;
        h.step().await;

        assert_eq!(wire.sent_count(), 1 + 3);
        assert_eq!(
            decode_frame(wire.sent()[0].clone()).unwrap(),
            Frame::Control(ControlFrame::FileMetadata {
                name: "a.bin".into(),
                size: 10
            })
        );
        let notices = h.notices();
        assert!(notices
            .iter()
            .any(|n| matches!(n, EngineNotice::TransferStarted { peer, .. } if peer == "a1")));
        assert!(notices.iter().any(|n| matches!(
            n,
            EngineNotice::TransferFinished { state, .. } if state.status == TransferStatus::Completed
        )));

        let ack = encode_control_frame(&ControlFrame::FileReceived).unwrap();
        h.transport(
            "a1",
            1,
            SessionEvent::Channel {
                label: "file-transfer-0".into(),
                event: ChannelEvent::Message(ack),
            },
        )
        .await;
        assert!(matches!(
            h.notices().as_slice(),
            [EngineNotice::Acknowledged { peer }] if peer == "a1"
        ));
        assert!(h.engine.outgoing.is_empty());
    }

    #[tokio::test]
    async fn rejection_ends_the_attempt() {
        let mut h = Harness::new("a1", one_channel(), test_dir("reject"));
        h.engine
            .handle_command(EngineCommand::SendFile {
                peer: "b2".into(),
                file_name: "a.bin".into(),
                mime: String::new(),
                source: Arc::new(MemorySource(Bytes::from_static(b"x"))),
            })
            .await;
        h.engine
            .handle_relay(from("b2", RelayMessage::reject_transfer("a1")))
            .await;
        assert!(matches!(
            h.notices().as_slice(),
            [EngineNotice::TransferFinished { state, .. }] if state.status == TransferStatus::Rejected
        ));
        assert_eq!(h.provider.session_count(), 0);
    }

    #[tokio::test]
    async fn departed_peer_is_torn_down() {
        let mut h = Harness::new(
            "b2",
            EngineConfig {
                auto_accept: true,
                ..one_channel()
            },
            test_dir("departed"),
        );
        h.engine
            .handle_relay(from(
                "a1",
                RelayMessage::transfer_request(
                    "b2",
                    FileDescriptor {
                        name: "x".into(),
                        size: 1,
                        mime: String::new(),
                    },
                ),
            ))
            .await;
        h.notices();

        let me = PresenceRecord {
            id: "b2".into(),
            nickname: "me".into(),
        };
        h.engine
            .handle_relay(RelayMessage::Users {
                users: vec![me.clone()],
            })
            .await;
        let notices = h.notices();
        assert!(matches!(&notices[0], EngineNotice::Peers(p) if p.is_empty()));
        assert!(notices
            .iter()
            .any(|n| matches!(n, EngineNotice::SessionClosed { peer, failed: false } if peer == "a1")));
        assert_eq!(h.provider.session(0).calls().last(), Some(&MockCall::Close));
        assert!(h.engine.registry.is_empty());
        assert!(h.engine.receivers.is_empty());
    }

    #[tokio::test]
    async fn fatal_session_failure_fails_the_transfer() {
        let mut h = Harness::new("a1", one_channel(), test_dir("failure"));
        h.engine
            .handle_command(EngineCommand::SendFile {
                peer: "b2".into(),
                file_name: "a.bin".into(),
                mime: String::new(),
                source: Arc::new(MemorySource(Bytes::from_static(b"abc"))),
            })
            .await;
        h.engine
            .handle_relay(from("b2", RelayMessage::accept_transfer("a1")))
            .await;
        h.transport("b2", 1, SessionEvent::StateChanged(TransportState::Failed))
            .await;
        let notices = h.notices();
        assert!(notices.iter().any(|n| matches!(
            n,
            EngineNotice::TransferFinished { state, .. } if matches!(state.status, TransferStatus::Failed(_))
        )));
        assert!(notices
            .iter()
            .any(|n| matches!(n, EngineNotice::SessionClosed { failed: true, .. })));
    }

    #[tokio::test]
    async fn events_of_replaced_sessions_are_dropped() {
        let mut h = Harness::new("b2", one_channel(), test_dir("stale"));
        h.engine
            .handle_relay(from(
                "a1",
                RelayMessage::offer("b2", SessionDescription::offer("v=0")),
            ))
            .await;
        h.transport("a1", 1, SessionEvent::StateChanged(TransportState::Failed))
            .await;
        h.engine
            .handle_relay(from(
                "a1",
                RelayMessage::offer("b2", SessionDescription::offer("v=1")),
            ))
            .await;
        assert_eq!(h.provider.session_count(), 2);

        // Generation 1 is gone; its late events change nothing.
        h.transport("a1", 1, SessionEvent::StateChanged(TransportState::Connected))
            .await;
        let current = h.engine.registry.get("a1").unwrap();
        assert_eq!(current.generation, 2);
        assert_eq!(current.negotiation.state(), NegotiationState::Negotiating);
    }

    #[tokio::test]
    async fn cancel_stops_sender_and_notifies_receiver() {
        let mut h = Harness::new(
            "a1",
            EngineConfig {
                channels: 1,
                chunk_size: 262_144,
                high_watermark: 300_000,
                low_watermark: 100_000,
                ..Default::default()
            },
            test_dir("cancel"),
        );
        let data: Bytes = vec![7u8; 1_000_000].into();
        h.engine
            .handle_command(EngineCommand::SendFile {
                peer: "b2".into(),
                file_name: "big.bin".into(),
                mime: String::new(),
                source: Arc::new(MemorySource(data)),
            })
            .await;
        h.engine
            .handle_relay(from("b2", RelayMessage::accept_transfer("a1")))
            .await;
        let session = h.provider.session(0);
        h.engine
            .handle_relay(from(
                "b2",
                RelayMessage::answer("a1", SessionDescription::answer("v=0")),
            ))
            .await;
        h.transport("b2", 1, SessionEvent::StateChanged(TransportState::Connected))
            .await;

        // Channel comes up closed; make it accumulate before it opens.
        let wire = session.channels()[0].clone();
        assert_eq!(wire.sent_count(), 0);
        wire.set_accumulate(true);
        wire.set_open(true);
        h.transport(
            "b2",
            1,
            SessionEvent::Channel {
                label: "file-transfer-0".into(),
                event: ChannelEvent::Open,
            },
        )
        .await;
        tokio::time::timeout(Duration::from_secs(1), wire.wait_sent(3))
            .await
            .unwrap();

        h.engine.handle_command(EngineCommand::Cancel).await;
        h.step().await;

        let finished = h
            .notices()
            .into_iter()
            .find_map(|n| match n {
                EngineNotice::TransferFinished { state, .. } => Some(state),
                _ => None,
            })
            .unwrap();
        assert_eq!(finished.status, TransferStatus::Cancelled);
        assert!(finished.bytes_moved < finished.total_size);
        assert!(session.calls().contains(&MockCall::Close));
        assert!(h.engine.registry.is_empty());
        assert!(wire.sent()[1].len() == CHUNK_HEADER_LEN + 262_144);
        // The cancel frame went out even though the channel was still full.
        assert!(wire.buffered_amount().await > 300_000);
        let last = wire.sent().last().cloned().unwrap();
        assert_eq!(
            decode_frame(last).unwrap(),
            Frame::Control(ControlFrame::Cancel)
        );
    }

    #[test]
    fn label_prefix_matches_pool() {
        assert_eq!(TransferChannelPool::label(0), "file-transfer-0");
    }
}
