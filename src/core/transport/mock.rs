//! In-memory transport provider for tests.
//!
//! Sessions record every call the negotiation layer makes; channels record
//! every frame sent and expose a manually controlled buffered amount so flow
//! control can be exercised deterministically.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

use super::{
    DataChannel, SessionConfig, SessionEvent, SessionEvents, TransportProvider, TransportSession,
};
use crate::core::protocol::signaling::{IceCandidate, SessionDescription};

// ── Channel ──────────────────────────────────────────────────────────────────

pub struct MockChannel {
    label: String,
    open: AtomicBool,
    buffered: AtomicUsize,
    /// When set, every send adds the frame length to the buffered amount.
    accumulate: AtomicBool,
    fail_sends: AtomicBool,
    low_threshold: AtomicUsize,
    low: Notify,
    sent: Mutex<Vec<Bytes>>,
    sent_notify: Notify,
}

impl MockChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            buffered: AtomicUsize::new(0),
            accumulate: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            low_threshold: AtomicUsize::new(0),
            low: Notify::new(),
            sent: Mutex::new(Vec::new()),
            sent_notify: Notify::new(),
        })
    }

    pub fn open(label: &str) -> Arc<Self> {
        let ch = Self::new(label);
        ch.set_open(true);
        ch
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn set_buffered(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    pub fn set_accumulate(&self, on: bool) {
        self.accumulate.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, on: bool) {
        self.fail_sends.store(on, Ordering::SeqCst);
    }

    /// Simulate the network draining the buffer down to `amount`.
    pub fn drain_to(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
        if amount <= self.low_threshold.load(Ordering::SeqCst) {
            self.low.notify_one();
        }
    }

    pub fn low_threshold(&self) -> usize {
        self.low_threshold.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Wait until at least `n` frames were sent on this channel.
    pub async fn wait_sent(&self, n: usize) {
        loop {
            let notified = self.sent_notify.notified();
            if self.sent_count() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!("mock channel '{}' not open", self.label));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("mock send failure"));
        }
        if self.accumulate.load(Ordering::SeqCst) {
            self.buffered.fetch_add(data.len(), Ordering::SeqCst);
        }
        self.sent.lock().unwrap().push(data);
        self.sent_notify.notify_waiters();
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.low_threshold.store(threshold, Ordering::SeqCst);
    }

    async fn buffered_amount_low(&self) {
        self.low.notified().await;
    }

    async fn close(&self) -> Result<()> {
        self.set_open(false);
        Ok(())
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(String),
    SetRemote(String),
    AddCandidate(String),
    CreateChannel(String),
    Close,
}

#[derive(Default)]
pub struct MockSession {
    calls: Mutex<Vec<MockCall>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    /// Remote descriptions whose sdp equals this string are rejected.
    reject_sdp: Mutex<Option<String>>,
    /// Open created channels immediately.
    open_on_create: AtomicBool,
}

impl MockSession {
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().unwrap().clone()
    }

    pub fn reject_remote_sdp(&self, sdp: &str) {
        *self.reject_sdp.lock().unwrap() = Some(sdp.to_string());
    }

    pub fn set_open_on_create(&self, on: bool) {
        self.open_on_create.store(on, Ordering::SeqCst);
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(MockCall::CreateOffer);
        Ok(SessionDescription::offer("mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(MockCall::CreateAnswer);
        Ok(SessionDescription::answer("mock-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(MockCall::SetLocal(desc.sdp));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if self.reject_sdp.lock().unwrap().as_deref() == Some(desc.sdp.as_str()) {
            return Err(anyhow!("malformed remote description"));
        }
        self.record(MockCall::SetRemote(desc.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(MockCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        self.record(MockCall::CreateChannel(label.to_string()));
        let ch = MockChannel::new(label);
        ch.set_open(self.open_on_create.load(Ordering::SeqCst));
        self.channels.lock().unwrap().push(ch.clone());
        Ok(ch)
    }

    async fn close(&self) -> Result<()> {
        self.record(MockCall::Close);
        Ok(())
    }
}

// ── Provider ─────────────────────────────────────────────────────────────────

/// Hands out [`MockSession`]s and keeps them (with their event senders) so
/// tests can inspect calls and inject provider events.
#[derive(Default)]
pub struct MockProvider {
    sessions: Mutex<Vec<(Arc<MockSession>, mpsc::UnboundedSender<SessionEvent>)>>,
}

impl MockProvider {
    pub fn session(&self, index: usize) -> Arc<MockSession> {
        self.sessions.lock().unwrap()[index].0.clone()
    }

    pub fn events(&self, index: usize) -> mpsc::UnboundedSender<SessionEvent> {
        self.sessions.lock().unwrap()[index].1.clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl TransportProvider for MockProvider {
    async fn create_session(
        &self,
        _config: &SessionConfig,
    ) -> Result<(Arc<dyn TransportSession>, SessionEvents)> {
        let session = Arc::new(MockSession::default());
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().unwrap().push((session.clone(), tx));
        Ok((session, rx))
    }
}
