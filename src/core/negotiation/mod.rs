//! Per-peer session negotiation.
//!
//! One [`NegotiationSession`] exists per remote peer. It owns the transport
//! session and moves through
//!
//! ```text
//! idle ──► negotiating ──► connected
//!   │           │              │
//!   └───────────┴──────────────┴──► failed | closed
//! ```
//!
//! Every input (relay envelope or transport event) is a [`NegotiationEvent`]
//! handled by [`NegotiationSession::dispatch`], which matches on
//! `(state, event)` and returns the [`NegotiationAction`]s the owner must
//! carry out. The session never talks to the relay or the channel pool
//! itself.
//!
//! Which side offers is decided by [`Role::for_pair`]: the lexicographically
//! smaller identity is the initiator. The responder only ever answers.
//!
//! Remote ICE candidates that arrive before a remote description are queued
//! and applied, in arrival order and exactly once, right after the remote
//! description is set.

pub mod registry;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::core::protocol::signaling::{IceCandidate, RelayMessage, SessionDescription};
use crate::core::transport::{TransportSession, TransportState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Role of `local` when negotiating with `remote`.
    pub fn for_pair(local: &str, remote: &str) -> Self {
        if local < remote {
            Self::Initiator
        } else {
            Self::Responder
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum NegotiationEvent {
    /// Initiator only: create and send the offer.
    Start,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    LocalCandidate(IceCandidate),
    Transport(TransportState),
}

impl NegotiationEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::RemoteOffer(_) => "remote_offer",
            Self::RemoteAnswer(_) => "remote_answer",
            Self::RemoteCandidate(_) => "remote_candidate",
            Self::LocalCandidate(_) => "local_candidate",
            Self::Transport(_) => "transport_state",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationAction {
    /// Send this envelope through the relay.
    Signal(RelayMessage),
    /// The transport is up.
    Connected,
    /// Initiator only: create the transfer channels now.
    OpenChannels,
    /// Release the session and everything riding on it. `failed` is set when
    /// the provider reported a fatal failure.
    Teardown { failed: bool },
}

pub struct NegotiationSession {
    peer_id: String,
    role: Role,
    state: NegotiationState,
    transport: Arc<dyn TransportSession>,
    pending_candidates: VecDeque<IceCandidate>,
    has_remote_description: bool,
}

impl NegotiationSession {
    pub fn new(local_id: &str, peer_id: &str, transport: Arc<dyn TransportSession>) -> Self {
        let role = Role::for_pair(local_id, peer_id);
        debug!(event = "negotiation_created", peer = %peer_id, ?role);
        Self {
            peer_id: peer_id.to_string(),
            role,
            state: NegotiationState::Idle,
            transport,
            pending_candidates: VecDeque::new(),
            has_remote_description: false,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn transport(&self) -> &Arc<dyn TransportSession> {
        &self.transport
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Handle one event. Failures of individual provider calls are logged and
    /// leave the state unchanged; only a provider-reported `Failed` is fatal.
    pub async fn dispatch(&mut self, event: NegotiationEvent) -> Vec<NegotiationAction> {
        use NegotiationEvent as E;
        use NegotiationState as S;

        let kind = event.kind();
        match (self.state, event) {
            (S::Failed | S::Closed, _) => {
                debug!(event = "negotiation_event_after_end", peer = %self.peer_id, kind, state = %self.state);
                Vec::new()
            }

            (S::Idle, E::Start) if self.role == Role::Initiator => self.start_offer().await,
            (_, E::Start) => {
                warn!(event = "negotiation_unexpected_start", peer = %self.peer_id, state = %self.state, role = ?self.role);
                Vec::new()
            }

            (S::Idle | S::Negotiating, E::RemoteOffer(offer)) if self.role == Role::Responder => {
                self.answer_offer(offer).await
            }
            (_, E::RemoteOffer(_)) => {
                warn!(event = "negotiation_offer_ignored", peer = %self.peer_id, state = %self.state, role = ?self.role);
                Vec::new()
            }

            (S::Negotiating, E::RemoteAnswer(answer)) if self.role == Role::Initiator => {
                self.apply_answer(answer).await;
                Vec::new()
            }
            (_, E::RemoteAnswer(_)) => {
                warn!(event = "negotiation_answer_ignored", peer = %self.peer_id, state = %self.state, role = ?self.role);
                Vec::new()
            }

            (_, E::RemoteCandidate(candidate)) => {
                self.remote_candidate(candidate).await;
                Vec::new()
            }

            (_, E::LocalCandidate(candidate)) => {
                vec![NegotiationAction::Signal(RelayMessage::ice_candidate(
                    &self.peer_id,
                    candidate,
                ))]
            }

            (_, E::Transport(state)) => self.transport_state(state).await,
        }
    }

    /// Close the transport. No further events are processed.
    pub async fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = NegotiationState::Closed;
        if let Err(e) = self.transport.close().await {
            debug!(event = "transport_close_failure", peer = %self.peer_id, error = %e);
        }
    }

    async fn start_offer(&mut self) -> Vec<NegotiationAction> {
        let offer = match self.transport.create_offer().await {
            Ok(o) => o,
            Err(e) => {
                error!(event = "create_offer_failure", peer = %self.peer_id, error = %e);
                return Vec::new();
            }
        };
        if let Err(e) = self.transport.set_local_description(offer.clone()).await {
            error!(event = "set_local_offer_failure", peer = %self.peer_id, error = %e);
            return Vec::new();
        }
        self.state = NegotiationState::Negotiating;
        info!(event = "offer_sent", peer = %self.peer_id);
        vec![NegotiationAction::Signal(RelayMessage::offer(&self.peer_id, offer))]
    }

    async fn answer_offer(&mut self, offer: SessionDescription) -> Vec<NegotiationAction> {
        if let Err(e) = self.transport.set_remote_description(offer).await {
            warn!(event = "remote_offer_rejected", peer = %self.peer_id, error = %e);
            return Vec::new();
        }
        self.has_remote_description = true;
        self.drain_candidates().await;

        let answer = match self.transport.create_answer().await {
            Ok(a) => a,
            Err(e) => {
                error!(event = "create_answer_failure", peer = %self.peer_id, error = %e);
                return Vec::new();
            }
        };
        if let Err(e) = self.transport.set_local_description(answer.clone()).await {
            error!(event = "set_local_answer_failure", peer = %self.peer_id, error = %e);
            return Vec::new();
        }
        self.state = NegotiationState::Negotiating;
        info!(event = "answer_sent", peer = %self.peer_id);
        vec![NegotiationAction::Signal(RelayMessage::answer(&self.peer_id, answer))]
    }

    async fn apply_answer(&mut self, answer: SessionDescription) {
        if self.has_remote_description {
            warn!(event = "duplicate_answer", peer = %self.peer_id);
            return;
        }
        if let Err(e) = self.transport.set_remote_description(answer).await {
            warn!(event = "remote_answer_rejected", peer = %self.peer_id, error = %e);
            return;
        }
        self.has_remote_description = true;
        debug!(event = "answer_applied", peer = %self.peer_id);
        self.drain_candidates().await;
    }

    async fn remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.has_remote_description {
            self.pending_candidates.push_back(candidate);
            debug!(
                event = "ice_candidate_queued",
                peer = %self.peer_id,
                queued = self.pending_candidates.len()
            );
            return;
        }
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            warn!(event = "ice_candidate_rejected", peer = %self.peer_id, error = %e);
        }
    }

    async fn drain_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        debug!(
            event = "ice_candidates_drained",
            peer = %self.peer_id,
            count = self.pending_candidates.len()
        );
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!(event = "ice_candidate_rejected", peer = %self.peer_id, error = %e);
            }
        }
    }

    async fn transport_state(&mut self, state: TransportState) -> Vec<NegotiationAction> {
        match state {
            TransportState::Connected if self.state != NegotiationState::Connected => {
                self.state = NegotiationState::Connected;
                info!(event = "session_connected", peer = %self.peer_id, role = ?self.role);
                let mut actions = vec![NegotiationAction::Connected];
                if self.role == Role::Initiator {
                    actions.push(NegotiationAction::OpenChannels);
                }
                actions
            }
            TransportState::Failed => {
                error!(event = "session_failed", peer = %self.peer_id);
                self.state = NegotiationState::Failed;
                if let Err(e) = self.transport.close().await {
                    debug!(event = "transport_close_failure", peer = %self.peer_id, error = %e);
                }
                vec![NegotiationAction::Teardown { failed: true }]
            }
            TransportState::Closed => {
                info!(event = "session_closed", peer = %self.peer_id);
                self.state = NegotiationState::Closed;
                vec![NegotiationAction::Teardown { failed: false }]
            }
            TransportState::Disconnected => {
                warn!(event = "session_disconnected", peer = %self.peer_id);
                Vec::new()
            }
            other => {
                debug!(event = "transport_state", peer = %self.peer_id, state = %other);
                Vec::new()
            }
        }
    }
}
