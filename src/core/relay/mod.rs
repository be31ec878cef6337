//! Relay service: identity assignment, presence and envelope forwarding.
//!
//! [`RelayHub`] is transport-agnostic. Each connection is represented by an
//! unbounded outbox of JSON text frames; [`server`] pumps outboxes into
//! WebSockets and feeds inbound text to [`RelayHub::handle_message`].
//!
//! Forwarding is verbatim: the hub only reads `type` and `targetId`, and
//! overwrites `senderId` with the identity of the connection the envelope
//! came from. There is no retry and no history. A failed write to one
//! connection is logged; the broken connection is reaped when its socket
//! closes, which triggers the next presence broadcast.

pub mod client;
pub mod names;
pub mod server;

use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::protocol::signaling::{
    is_forwarded_type, PresenceRecord, RelayMessage, NICKNAME_UPDATE,
};

/// Outgoing text frames of one connection.
pub type Outbox = mpsc::UnboundedSender<String>;

struct Client {
    nickname: String,
    outbox: Outbox,
}

#[derive(Default)]
pub struct RelayHub {
    clients: Mutex<BTreeMap<String, Client>>,
}

fn encode(msg: &RelayMessage) -> Option<String> {
    match serde_json::to_string(msg) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(event = "relay_encode_failure", error = %e);
            None
        }
    }
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Its outbox receives `your-id` before the
    /// presence broadcast that includes it.
    pub async fn connect(&self, outbox: Outbox) -> PresenceRecord {
        let mut clients = self.clients.lock().await;
        let id = Uuid::new_v4().to_string();
        let nickname = names::generate(&mut rand::thread_rng(), |n| {
            clients.values().any(|c| c.nickname == n)
        });

        if let Some(text) = encode(&RelayMessage::YourId {
            id: id.clone(),
            nickname: nickname.clone(),
        }) {
            let _ = outbox.send(text);
        }
        clients.insert(
            id.clone(),
            Client {
                nickname: nickname.clone(),
                outbox,
            },
        );
        info!(event = "relay_client_connected", id = %id, nickname = %nickname, total = clients.len());
        Self::broadcast_presence(&clients);
        PresenceRecord { id, nickname }
    }

    pub async fn disconnect(&self, id: &str) {
        let mut clients = self.clients.lock().await;
        if clients.remove(id).is_some() {
            info!(event = "relay_client_disconnected", id = %id, total = clients.len());
            Self::broadcast_presence(&clients);
        }
    }

    pub async fn presence(&self) -> Vec<PresenceRecord> {
        Self::snapshot(&*self.clients.lock().await)
    }

    /// Handle one text frame from connection `from`.
    pub async fn handle_message(&self, from: &str, text: &str) {
        let mut envelope: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(event = "relay_invalid_json", from = %from, error = %e);
                return;
            }
        };
        let Some(kind) = envelope.get("type").and_then(Value::as_str).map(str::to_owned) else {
            warn!(event = "relay_untyped_message", from = %from);
            return;
        };

        if kind == NICKNAME_UPDATE {
            let nickname = envelope.get("nickname").and_then(Value::as_str).map(str::trim);
            match nickname {
                Some(n) if !n.is_empty() => self.rename(from, n).await,
                _ => warn!(event = "relay_invalid_nickname", from = %from),
            }
            return;
        }
        if !is_forwarded_type(&kind) {
            warn!(event = "relay_unknown_type", from = %from, kind = %kind);
            return;
        }

        let Some(target) = envelope.get("targetId").and_then(Value::as_str).map(str::to_owned) else {
            warn!(event = "relay_missing_target", from = %from, kind = %kind);
            return;
        };
        if let Some(obj) = envelope.as_object_mut() {
            obj.insert("senderId".into(), Value::String(from.to_string()));
        }

        let clients = self.clients.lock().await;
        let Some(client) = clients.get(&target) else {
            warn!(event = "relay_target_missing", from = %from, target = %target, kind = %kind);
            return;
        };
        if client.outbox.send(envelope.to_string()).is_err() {
            warn!(event = "relay_target_unwritable", target = %target, kind = %kind);
            return;
        }
        debug!(event = "relay_forwarded", from = %from, target = %target, kind = %kind);
    }

    async fn rename(&self, id: &str, nickname: &str) {
        let mut clients = self.clients.lock().await;
        let Some(client) = clients.get_mut(id) else {
            return;
        };
        client.nickname = nickname.to_string();
        info!(event = "relay_nickname_updated", id = %id, nickname = %nickname);
        Self::broadcast_presence(&clients);
    }

    fn snapshot(clients: &BTreeMap<String, Client>) -> Vec<PresenceRecord> {
        clients
            .iter()
            .map(|(id, c)| PresenceRecord {
                id: id.clone(),
                nickname: c.nickname.clone(),
            })
            .collect()
    }

    fn broadcast_presence(clients: &BTreeMap<String, Client>) {
        let Some(text) = encode(&RelayMessage::Users {
            users: Self::snapshot(clients),
        }) else {
            return;
        };
        for (id, client) in clients {
            if client.outbox.send(text.clone()).is_err() {
                warn!(event = "relay_broadcast_failure", id = %id);
            }
        }
    }
}
