//! Relay wire protocol: JSON envelopes exchanged over the relay WebSocket.
//!
//! Every envelope is a JSON object with a `type` discriminator. Targeted
//! envelopes carry `targetId`; the relay stamps `senderId` on delivery and
//! ignores any value the client put there.
//!
//! ```text
//! relay → client   {"type":"your-id","id":"…","nickname":"…"}
//! relay → client   {"type":"users","users":[{"id":"…","nickname":"…"}]}
//! client → relay   {"type":"offer","targetId":"…","sdp":{"type":"offer","sdp":"…"}}
//! relay → client   {"type":"offer","targetId":"…","senderId":"…","sdp":{…}}
//! ```

use serde::{Deserialize, Serialize};

/// Envelope types the relay forwards by `targetId`.
pub const FORWARDED_TYPES: [&str; 6] = [
    "offer",
    "answer",
    "ice-candidate",
    "file-transfer-request",
    "accept-transfer",
    "reject-transfer",
];

/// Older clients name the request envelope without the `file-` prefix.
pub const TRANSFER_REQUEST_ALIAS: &str = "transfer-request";

/// Envelope type a client uses to rename itself.
pub const NICKNAME_UPDATE: &str = "nickname-update";

/// One entry of the presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub id: String,
    pub nickname: String,
}

/// Session description as exchanged between peers (`RTCSessionDescriptionInit` shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "answer".into(),
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as exchanged between peers (`RTCIceCandidateInit` shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// File descriptor carried by a transfer request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime: String,
}

/// Every envelope that crosses the relay, seen from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    /// First message on a fresh relay connection.
    YourId { id: String, nickname: String },
    /// Full presence snapshot.
    Users { users: Vec<PresenceRecord> },
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        #[serde(alias = "offer")]
        sdp: SessionDescription,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        #[serde(alias = "answer")]
        sdp: SessionDescription,
    },
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        candidate: IceCandidate,
    },
    #[serde(rename = "file-transfer-request", alias = "transfer-request")]
    TransferRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        file: FileDescriptor,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thumbnail: Option<String>,
    },
    AcceptTransfer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
    },
    RejectTransfer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
    },
    NicknameUpdate { nickname: String },
}

impl RelayMessage {
    pub fn offer(target: &str, sdp: SessionDescription) -> Self {
        Self::Offer {
            target_id: Some(target.to_string()),
            sender_id: None,
            sdp,
        }
    }

    pub fn answer(target: &str, sdp: SessionDescription) -> Self {
        Self::Answer {
            target_id: Some(target.to_string()),
            sender_id: None,
            sdp,
        }
    }

    pub fn ice_candidate(target: &str, candidate: IceCandidate) -> Self {
        Self::IceCandidate {
            target_id: Some(target.to_string()),
            sender_id: None,
            candidate,
        }
    }

    pub fn transfer_request(target: &str, file: FileDescriptor) -> Self {
        Self::TransferRequest {
            target_id: Some(target.to_string()),
            sender_id: None,
            file,
            thumbnail: None,
        }
    }

    pub fn accept_transfer(target: &str) -> Self {
        Self::AcceptTransfer {
            target_id: Some(target.to_string()),
            sender_id: None,
        }
    }

    pub fn reject_transfer(target: &str) -> Self {
        Self::RejectTransfer {
            target_id: Some(target.to_string()),
            sender_id: None,
        }
    }

    /// Relay-stamped origin of a forwarded envelope.
    pub fn sender_id(&self) -> Option<&str> {
        match self {
            Self::Offer { sender_id, .. }
            | Self::Answer { sender_id, .. }
            | Self::IceCandidate { sender_id, .. }
            | Self::TransferRequest { sender_id, .. }
            | Self::AcceptTransfer { sender_id, .. }
            | Self::RejectTransfer { sender_id, .. } => sender_id.as_deref(),
            Self::YourId { .. } | Self::Users { .. } | Self::NicknameUpdate { .. } => None,
        }
    }

    /// Wire name of this envelope's `type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::YourId { .. } => "your-id",
            Self::Users { .. } => "users",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::TransferRequest { .. } => "file-transfer-request",
            Self::AcceptTransfer { .. } => "accept-transfer",
            Self::RejectTransfer { .. } => "reject-transfer",
            Self::NicknameUpdate { .. } => NICKNAME_UPDATE,
        }
    }
}

/// `true` if the relay should route an envelope of this type by `targetId`.
pub fn is_forwarded_type(kind: &str) -> bool {
    kind == TRANSFER_REQUEST_ALIAS || FORWARDED_TYPES.contains(&kind)
}
