//! Live peer sessions keyed by remote identity.
//!
//! At most one [`PeerSession`] exists per remote peer. Inserting a new one
//! hands the stale entry back to the caller, which must shut it down.
//! Each entry carries a generation number so that transport events still in
//! flight from a replaced session can be recognised and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::NegotiationSession;
use crate::core::pipeline::pool::TransferChannelPool;

pub struct PeerSession {
    pub negotiation: NegotiationSession,
    pub pool: Arc<TransferChannelPool>,
    pub generation: u64,
}

impl PeerSession {
    /// Close every channel, then the transport.
    pub async fn shutdown(mut self) {
        self.pool.close_all().await;
        self.negotiation.close().await;
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, PeerSession>,
    next_generation: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for its peer. Returns the new generation and the
    /// replaced session, if any.
    pub fn insert(
        &mut self,
        negotiation: NegotiationSession,
        pool: Arc<TransferChannelPool>,
    ) -> (u64, Option<PeerSession>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let peer = negotiation.peer_id().to_string();
        let stale = self.sessions.insert(
            peer.clone(),
            PeerSession {
                negotiation,
                pool,
                generation,
            },
        );
        if stale.is_some() {
            debug!(event = "session_replaced", peer = %peer, generation);
        }
        (generation, stale)
    }

    pub fn get(&self, peer: &str) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn get_mut(&mut self, peer: &str) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer)
    }

    /// The entry for `peer`, only if it is still `generation`.
    pub fn current_mut(&mut self, peer: &str, generation: u64) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(peer)
            .filter(|s| s.generation == generation)
    }

    pub fn remove(&mut self, peer: &str) -> Option<PeerSession> {
        self.sessions.remove(peer)
    }

    pub fn drain(&mut self) -> Vec<PeerSession> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn peers(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::negotiation::NegotiationState;
    use crate::core::transport::mock::{MockCall, MockSession};

    fn entry(remote: &str) -> (NegotiationSession, Arc<MockSession>) {
        let mock = Arc::new(MockSession::default());
        (NegotiationSession::new("a1", remote, mock.clone()), mock)
    }

    #[tokio::test]
    async fn replacing_hands_back_the_stale_session() {
        let mut reg = SessionRegistry::new();
        let (first, first_mock) = entry("b2");
        let (gen1, stale) = reg.insert(first, Arc::new(TransferChannelPool::new(1)));
        assert!(stale.is_none());

        let (second, _) = entry("b2");
        let (gen2, stale) = reg.insert(second, Arc::new(TransferChannelPool::new(1)));
        assert_ne!(gen1, gen2);
        assert_eq!(reg.len(), 1);

        let stale = stale.unwrap();
        assert_eq!(stale.generation, gen1);
        stale.shutdown().await;
        assert_eq!(first_mock.calls(), vec![MockCall::Close]);

        assert!(reg.current_mut("b2", gen1).is_none());
        let current = reg.current_mut("b2", gen2).unwrap();
        assert_eq!(current.negotiation.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn drain_empties_registry() {
        let mut reg = SessionRegistry::new();
        for peer in ["b2", "c3"] {
            let (s, _) = entry(peer);
            reg.insert(s, Arc::new(TransferChannelPool::new(1)));
        }
        let mut peers = reg.peers();
        peers.sort();
        assert_eq!(peers, vec!["b2", "c3"]);
        assert_eq!(reg.drain().len(), 2);
        assert!(reg.is_empty());
    }
}
