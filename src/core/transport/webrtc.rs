//! Transport provider backed by webrtc-rs.
//!
//! Wraps `RTCPeerConnection` / `RTCDataChannel` behind the provider traits and
//! converts every webrtc callback into a [`SessionEvent`] on the session's
//! event channel. ICE is trickled: each gathered candidate is reported as it
//! appears instead of waiting for gathering to complete.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    ChannelEvent, DataChannel, SessionConfig, SessionEvent, SessionEvents, TransportProvider,
    TransportSession, TransportState,
};
use crate::core::config::DEFAULT_STUN_SERVERS;
use crate::core::protocol::signaling::{IceCandidate, SessionDescription};

type EventTx = mpsc::UnboundedSender<SessionEvent>;

// ── Provider ─────────────────────────────────────────────────────────────────

pub struct WebRtcProvider {
    api: API,
}

impl WebRtcProvider {
    pub fn new() -> Result<Self> {
        let mut me = MediaEngine::default();
        let reg = register_default_interceptors(Registry::new(), &mut me)?;

        let api = APIBuilder::new()
            .with_media_engine(me)
            .with_interceptor_registry(reg)
            .build();
        Ok(Self { api })
    }

    fn ice_servers(config: &SessionConfig) -> Vec<RTCIceServer> {
        let urls: Vec<String> = if config.ice_servers.is_empty() {
            DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            config.ice_servers.clone()
        };
        vec![RTCIceServer {
            urls,
            ..Default::default()
        }]
    }
}

#[async_trait]
impl TransportProvider for WebRtcProvider {
    async fn create_session(
        &self,
        config: &SessionConfig,
    ) -> Result<(Arc<dyn TransportSession>, SessionEvents)> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: Self::ice_servers(config),
                    ..Default::default()
                })
                .await
                .context("creating peer connection")?,
        );
        let (tx, rx) = mpsc::unbounded_channel();
        attach_session_handlers(&pc, tx.clone());
        Ok((Arc::new(WebRtcSession { pc, events: tx }), rx))
    }
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

fn attach_session_handlers(pc: &Arc<RTCPeerConnection>, tx: EventTx) {
    let cand_tx = tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = cand_tx.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(SessionEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => warn!(event = "ice_candidate_encode_failure", error = %e),
            }
        })
    }));

    let state_tx = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let tx = state_tx.clone();
        Box::pin(async move {
            match s {
                RTCPeerConnectionState::Connected => {
                    info!(event = "webrtc_connected", "WebRTC connection established");
                }
                RTCPeerConnectionState::Failed => {
                    error!(event = "webrtc_failed", "WebRTC connection failed");
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(
                        event = "webrtc_disconnected",
                        "WebRTC transient disconnect (ICE may recover)"
                    );
                }
                _ => debug!(event = "webrtc_state", state = %s),
            }
            let _ = tx.send(SessionEvent::StateChanged(map_state(s)));
        })
    }));

    let dc_tx = tx;
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = dc_tx.clone();
        Box::pin(async move {
            let channel = WebRtcChannel::attach(dc, tx.clone()).await;
            let _ = tx.send(SessionEvent::IncomingChannel(channel));
        })
    }));
}

// ── Session ──────────────────────────────────────────────────────────────────

pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    events: EventTx,
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type.as_str() {
        "offer" => RTCSessionDescription::offer(desc.sdp),
        "answer" => RTCSessionDescription::answer(desc.sdp),
        "pranswer" => RTCSessionDescription::pranswer(desc.sdp),
        other => return Err(anyhow!("unsupported description type '{other}'")),
    };
    parsed.context("parsing session description")
}

fn from_rtc_description(desc: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Answer => "answer",
        RTCSdpType::Pranswer => "pranswer",
        RTCSdpType::Rollback => "rollback",
        _ => "offer",
    };
    SessionDescription {
        sdp_type: sdp_type.into(),
        sdp: desc.sdp,
    }
}

#[async_trait]
impl TransportSession for WebRtcSession {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(from_rtc_description(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(from_rtc_description(answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        // Explicit ordered + fully reliable (SCTP default, no partial reliability).
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .with_context(|| format!("creating data channel '{label}'"))?;
        let channel: Arc<dyn DataChannel> = WebRtcChannel::attach(dc, self.events.clone()).await;
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

// ── Channel ──────────────────────────────────────────────────────────────────

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    low: Arc<Notify>,
}

impl WebRtcChannel {
    async fn attach(dc: Arc<RTCDataChannel>, tx: EventTx) -> Arc<Self> {
        let label = dc.label().to_string();
        let low = Arc::new(Notify::new());

        let (open_tx, open_label) = (tx.clone(), label.clone());
        dc.on_open(Box::new(move || {
            let tx = open_tx.clone();
            let label = open_label.clone();
            Box::pin(async move {
                debug!(event = "channel_open", channel = %label);
                let _ = tx.send(SessionEvent::Channel {
                    label,
                    event: ChannelEvent::Open,
                });
            })
        }));

        let (close_tx, close_label) = (tx.clone(), label.clone());
        dc.on_close(Box::new(move || {
            let tx = close_tx.clone();
            let label = close_label.clone();
            Box::pin(async move {
                debug!(event = "channel_closed", channel = %label);
                let _ = tx.send(SessionEvent::Channel {
                    label,
                    event: ChannelEvent::Close,
                });
            })
        }));

        let (msg_tx, msg_label) = (tx, label.clone());
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = msg_tx.clone();
            let label = msg_label.clone();
            Box::pin(async move {
                let _ = tx.send(SessionEvent::Channel {
                    label,
                    event: ChannelEvent::Message(msg.data),
                });
            })
        }));

        let notify = low.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let notify = notify.clone();
            Box::pin(async move {
                notify.notify_one();
            })
        }))
        .await;

        Arc::new(Self { dc, label, low })
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let state = self.dc.ready_state();
        if state != RTCDataChannelState::Open {
            return Err(anyhow!("data channel '{}' not open: {:?}", self.label, state));
        }
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    async fn buffered_amount_low(&self) {
        self.low.notified().await;
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}
