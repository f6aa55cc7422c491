use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CallKind, PeerId};

/// All wire protocol messages exchanged with peers over the transport.
///
/// The transport gives no ordering or exactly-once guarantee, so every
/// handler of these messages must tolerate redelivery; chat messages carry
/// a UUID for deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Encrypted chat message
    Chat(ChatPayload),

    /// The recipient's store accepted the message
    DeliveryAck(DeliveryAck),

    /// The recipient opened the conversation
    ReadAck(ReadAck),

    /// Friend request with the sender's public key
    FriendRequest(FriendRequestPayload),

    /// Acceptance of a previously sent friend request
    FriendAccept(FriendAcceptPayload),

    /// A peer rotated their key pair; previously derived secrets are stale
    KeyUpdate(KeyUpdatePayload),

    /// Call signaling (invite/accept/reject/hangup)
    CallSignal(CallSignal),

    /// Authoritative timestamp from the trusted time source
    TimeSync(TimeSync),
}

/// An encrypted chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    /// Globally unique message id, assigned by the sender
    pub msg_id: Uuid,
    pub from: PeerId,
    pub to: PeerId,
    /// Encrypted content (XChaCha20-Poly1305: nonce || ciphertext)
    pub payload: Vec<u8>,
    /// Sender's clock-synchronized timestamp
    pub timestamp: DateTime<Utc>,
    /// Present when this message replies to another
    pub reply: Option<ReplyPreview>,
}

/// Inline context for a reply, so the recipient can render the quoted
/// message without a store lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyPreview {
    pub target_msg_id: Uuid,
    pub preview: String,
    pub sender: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub msg_id: Uuid,
    pub from: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadAck {
    pub msg_ids: Vec<Uuid>,
    pub from: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequestPayload {
    pub from: PeerId,
    pub username: String,
    pub public_key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendAcceptPayload {
    pub from: PeerId,
    pub public_key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyUpdatePayload {
    pub from: PeerId,
    pub public_key: [u8; 32],
}

/// Signaling message for audio/video calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSignal {
    pub from: PeerId,
    pub to: PeerId,
    pub signal: Signal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Signal {
    /// Invitation to a call of the given kind
    Invite(CallKind),
    /// Callee accepted
    Accept,
    /// Callee rejected
    Reject,
    /// Either side ended the call
    Hangup,
}

/// Trusted timestamp sample used to re-anchor the local clock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSync {
    pub trusted: DateTime<Utc>,
}

impl WireMessage {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
