//! Domain model structs persisted in the local database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer as a read-only projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sotto_shared::kdf::KdfParams;

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// The local user's account.  Exactly one row exists per store instance.
///
/// The password-derived key itself is never stored; only the salt, the KDF
/// parameters, and a verification tag over the derived key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    /// Opaque identifier, immutable after creation.
    pub id: Uuid,
    /// Username, immutable after creation.
    pub username: String,
    /// Salt fed to the password KDF.
    pub kdf_salt: [u8; 16],
    /// Tagged KDF configuration (algorithm + cost factors).
    pub kdf_params: KdfParams,
    /// BLAKE3 tag over the derived key (hex); compared at unlock.
    pub key_verifier: String,
    /// X25519 public key (32 bytes).
    pub public_key: [u8; 32],
    /// X25519 secret key (32 bytes).  Never transmitted.
    pub secret_key: [u8; 32],
    /// When the account was created.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Friend
// ---------------------------------------------------------------------------

/// Relationship state of a peer record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FriendState {
    /// We sent a request and are waiting for the peer to accept.
    PendingOutgoing,
    /// The peer sent a request and is waiting for us.
    PendingIncoming,
    /// Mutually accepted.
    Friend,
}

impl FriendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingOutgoing => "pending_outgoing",
            Self::PendingIncoming => "pending_incoming",
            Self::Friend => "friend",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_outgoing" => Some(Self::PendingOutgoing),
            "pending_incoming" => Some(Self::PendingIncoming),
            "friend" => Some(Self::Friend),
            _ => None,
        }
    }
}

/// A peer relationship.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Friend {
    /// The peer's UUID; uniquely identifies the peer.
    pub peer_id: Uuid,
    pub username: String,
    /// Optional avatar reference (blob hash or URL).
    pub avatar: Option<String>,
    pub status_message: Option<String>,
    pub state: FriendState,
    /// Blocked peers keep their record but are excluded from delivery and
    /// acceptance paths.
    pub blocked: bool,
    /// The peer's X25519 public key; `None` until exchanged.  Always
    /// present once `state` is [`FriendState::Friend`].
    pub public_key: Option<[u8; 32]>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A conversation thread with one peer or a group.
///
/// `last_timestamp` always equals the timestamp of the most recently stored
/// message in the thread; `unread_count` is non-negative and resets to zero
/// when the conversation is marked read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    /// Peer UUID for 1:1 conversations, a dedicated group id otherwise.
    pub id: Uuid,
    /// Display label (the peer's username, or the group name).
    pub label: String,
    pub avatar: Option<String>,
    /// Preview of the most recent message.
    pub last_message: Option<String>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub unread_count: u32,
    /// Opaque reference to the shared secret in use, if any.
    pub secret_ref: Option<String>,
    pub is_group: bool,
    /// Participant UUIDs; populated iff `is_group`.
    pub participants: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Delivery status of a stored message.
///
/// Transitions are monotonic along sending -> sent -> delivered -> read,
/// one step at a time; `failed` is reachable from `sending` or `sent`
/// only.  A resend creates a new record rather than moving backwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Sending, Sent)
                | (Sent, Delivered)
                | (Delivered, Read)
                | (Sending, Failed)
                | (Sent, Failed)
        )
    }
}

/// Inline reply context stored with a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyRef {
    /// msg_id of the message being replied to.
    pub target_msg_id: Uuid,
    /// Preview text of the quoted message.
    pub preview: String,
    /// Who sent the quoted message.
    pub sender: Uuid,
}

/// A single stored chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Local auto-increment id (0 until inserted).
    pub local_id: i64,
    /// Globally unique message id, assigned by the sender.
    pub msg_id: Uuid,
    pub conversation_id: Uuid,
    pub from_id: Uuid,
    pub to_id: Uuid,
    /// Decrypted plaintext for display.
    pub body: String,
    /// Raw ciphertext, retained so the message can be re-decrypted after a
    /// key rotation.
    pub raw_payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
    /// True if this record mirrors the sender's own outgoing copy.  Only
    /// non-echo records drive unread counts and ordering.
    pub is_echo: bool,
    pub reply: Option<ReplyRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_forward_steps_legal() {
        use DeliveryStatus::*;
        assert!(Sending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));
    }

    #[test]
    fn test_status_backward_and_skip_illegal() {
        use DeliveryStatus::*;
        assert!(!Read.can_transition_to(Delivered));
        assert!(!Delivered.can_transition_to(Sent));
        assert!(!Sending.can_transition_to(Delivered));
        assert!(!Sending.can_transition_to(Read));
        assert!(!Read.can_transition_to(Sending));
    }

    #[test]
    fn test_failed_only_from_sending_or_sent() {
        use DeliveryStatus::*;
        assert!(Sending.can_transition_to(Failed));
        assert!(Sent.can_transition_to(Failed));
        assert!(!Delivered.can_transition_to(Failed));
        assert!(!Read.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Sent));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            DeliveryStatus::Sending,
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Read,
            DeliveryStatus::Failed,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("bogus"), None);
    }

    #[test]
    fn test_friend_state_string_roundtrip() {
        for state in [
            FriendState::PendingOutgoing,
            FriendState::PendingIncoming,
            FriendState::Friend,
        ] {
            assert_eq!(FriendState::parse(state.as_str()), Some(state));
        }
    }
}
