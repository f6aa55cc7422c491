//! The encrypted message service.
//!
//! Sits between the wire protocol and the store: encrypts outgoing
//! messages, validates and decrypts inbound ones, and keeps the owning
//! conversation's preview, timestamp, and unread counter in step with the
//! monotonic delivery-status rules enforced by the store.
//!
//! Unread policy: only authoritative (non-echo) records count.  Echo
//! copies of the local user's own messages are stored for display parity
//! but never touch unread counters or ordering.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};
use uuid::Uuid;

use sotto_shared::constants::PREVIEW_MAX_CHARS;
use sotto_shared::crypto::{self, SymmetricKey};
use sotto_shared::protocol::{ChatPayload, ReplyPreview};
use sotto_shared::types::PeerId;
use sotto_store::{
    Database, DeliveryStatus, Friend, Message, ReplyRef, StoreError,
};

use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::friends::{secret_fingerprint, FriendRegistry};

pub struct MessageService {
    db: Arc<Mutex<Database>>,
    clock: Clock,
    /// Conversation currently open in the UI; inbound messages for it do
    /// not bump the unread counter.
    focused: Mutex<Option<Uuid>>,
}

impl MessageService {
    pub fn new(db: Arc<Mutex<Database>>, clock: Clock) -> Self {
        Self {
            db,
            clock,
            focused: Mutex::new(None),
        }
    }

    /// Track which conversation the UI has open.
    pub fn set_focused(&self, conversation_id: Option<Uuid>) {
        *self.focused.lock().expect("focus lock") = conversation_id;
    }

    // ------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------

    /// Encrypt and persist an outgoing 1:1 message.
    ///
    /// The stored record starts in `sending`; the wire payload for the
    /// transport is returned alongside it.  Sending to a blocked peer is
    /// rejected before anything is persisted.
    pub fn send_to_peer(
        &self,
        from: Uuid,
        friend: &Friend,
        body: &str,
        reply: Option<ReplyRef>,
        secret: &SymmetricKey,
    ) -> Result<(Message, ChatPayload)> {
        if friend.blocked {
            return Err(CoreError::BlockedSender(friend.peer_id));
        }

        let payload = crypto::encrypt(secret, body.as_bytes())?;
        let msg_id = Uuid::new_v4();
        let timestamp = self.clock.now();
        let conversation_id = friend.peer_id;

        let message = Message {
            local_id: 0,
            msg_id,
            conversation_id,
            from_id: from,
            to_id: friend.peer_id,
            body: body.to_string(),
            raw_payload: payload.clone(),
            timestamp,
            status: DeliveryStatus::Sending,
            is_echo: false,
            reply: reply.clone(),
        };

        {
            let db = self.db.lock().expect("store lock");
            db.ensure_conversation(conversation_id, &friend.username, false)?;
            db.set_conversation_secret_ref(conversation_id, Some(&secret_fingerprint(secret)))?;
            db.insert_message(&message)?;
            db.bump_conversation(conversation_id, &preview(body), timestamp)?;
        }

        info!(msg_id = %msg_id, peer = %friend.peer_id, "message queued for sending");

        let wire = ChatPayload {
            msg_id,
            from: PeerId(from),
            to: PeerId(friend.peer_id),
            payload,
            timestamp,
            reply: reply.map(|r| ReplyPreview {
                target_msg_id: r.target_msg_id,
                preview: r.preview,
                sender: PeerId(r.sender),
            }),
        };
        Ok((message, wire))
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Validate, decrypt, and persist an inbound chat payload.
    ///
    /// Returns `Ok(None)` on redelivery of an already-stored msg_id, so the
    /// operation is idempotent under the transport's at-least-once
    /// delivery.  Messages from blocked senders are rejected with no
    /// persistence side effect; so are payloads that fail authentication.
    pub fn receive_message(
        &self,
        chat: &ChatPayload,
        local_account_id: Uuid,
        secret: &SymmetricKey,
        registry: &FriendRegistry,
    ) -> Result<Option<Message>> {
        let sender = chat.from.0;
        let is_echo = sender == local_account_id;

        if !is_echo && registry.is_blocked(sender)? {
            debug!(msg_id = %chat.msg_id, peer = %sender, "dropping message from blocked sender");
            return Err(CoreError::BlockedSender(sender));
        }

        // Decrypt before touching the store, so an authentication failure
        // leaves no trace.
        let body = decrypt_body(secret, &chat.payload)?;

        if is_echo {
            return self.store_echo(chat, &body);
        }

        let conversation_id = sender;
        let label = registry
            .get_friend(sender)
            .map(|f| f.username)
            .unwrap_or_else(|_| sender.to_string());

        let message = Message {
            local_id: 0,
            msg_id: chat.msg_id,
            conversation_id,
            from_id: sender,
            to_id: chat.to.0,
            body: body.clone(),
            raw_payload: chat.payload.clone(),
            timestamp: chat.timestamp,
            status: DeliveryStatus::Delivered,
            is_echo: false,
            reply: chat.reply.clone().map(reply_ref),
        };

        let focused = *self.focused.lock().expect("focus lock");
        {
            let db = self.db.lock().expect("store lock");
            db.ensure_conversation(conversation_id, &label, false)?;
            match db.insert_message(&message) {
                Ok(_) => {}
                Err(StoreError::DuplicateMessage(_)) => {
                    debug!(msg_id = %chat.msg_id, "redelivered message ignored");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
            db.set_conversation_secret_ref(conversation_id, Some(&secret_fingerprint(secret)))?;
            db.bump_conversation(conversation_id, &preview(&body), chat.timestamp)?;
            if focused != Some(conversation_id) {
                db.increment_unread(conversation_id)?;
            }
        }

        info!(msg_id = %chat.msg_id, peer = %sender, "message stored");
        Ok(Some(message))
    }

    /// Store the transport's echo of our own outgoing message and treat it
    /// as confirmation that the message left the device.
    fn store_echo(&self, chat: &ChatPayload, body: &str) -> Result<Option<Message>> {
        let message = Message {
            local_id: 0,
            msg_id: chat.msg_id,
            conversation_id: chat.to.0,
            from_id: chat.from.0,
            to_id: chat.to.0,
            body: body.to_string(),
            raw_payload: chat.payload.clone(),
            timestamp: chat.timestamp,
            status: DeliveryStatus::Sent,
            is_echo: true,
            reply: chat.reply.clone().map(reply_ref),
        };

        let db = self.db.lock().expect("store lock");
        db.ensure_conversation(message.conversation_id, &chat.to.to_string(), false)?;
        match db.insert_message(&message) {
            Ok(_) => {}
            Err(StoreError::DuplicateMessage(_)) => {
                debug!(msg_id = %chat.msg_id, "redelivered echo ignored");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        // The echo doubles as a send confirmation for the authoritative
        // record.  A failed transition means an ack beat us; a missing
        // record means the echo reached a store that never sent it.
        match db.update_message_status(chat.msg_id, DeliveryStatus::Sent) {
            Ok(_) | Err(StoreError::InvalidStatusTransition { .. }) | Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Some(message))
    }

    // ------------------------------------------------------------------
    // Status tracking
    // ------------------------------------------------------------------

    /// Apply a delivery-status transition to the authoritative record.
    /// Illegal transitions surface as
    /// [`StoreError::InvalidStatusTransition`]; the record keeps its
    /// last-known-good status.
    pub fn update_status(&self, msg_id: Uuid, status: DeliveryStatus) -> Result<DeliveryStatus> {
        let db = self.db.lock().expect("store lock");
        db.update_message_status(msg_id, status).map_err(Into::into)
    }

    /// Mark a conversation read: unread back to zero, every `delivered`
    /// message transitions to `read`.  Returns the msg_ids that changed so
    /// the caller can acknowledge them to the sender.
    pub fn mark_conversation_read(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        let db = self.db.lock().expect("store lock");
        let changed = db.mark_delivered_as_read(conversation_id)?;
        db.reset_unread(conversation_id)?;
        info!(conversation = %conversation_id, read = changed.len(), "conversation marked read");
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Re-decryption
    // ------------------------------------------------------------------

    /// Re-run decryption of the retained raw payload under a freshly
    /// derived secret (used after key rotation).  On success the stored
    /// plaintext is replaced; on authentication failure the previous
    /// plaintext stays untouched.
    pub fn re_decrypt(&self, msg_id: Uuid, secret: &SymmetricKey) -> Result<String> {
        let db = self.db.lock().expect("store lock");
        let message = db.get_message(msg_id)?;

        let body = decrypt_body(secret, &message.raw_payload)?;
        db.update_message_body(msg_id, &body)?;
        info!(msg_id = %msg_id, "message re-decrypted");
        Ok(body)
    }

    // ------------------------------------------------------------------
    // Projections
    // ------------------------------------------------------------------

    /// The authoritative record for a msg_id.
    pub fn message(&self, msg_id: Uuid) -> Result<Message> {
        let db = self.db.lock().expect("store lock");
        db.get_message(msg_id).map_err(Into::into)
    }

    pub fn conversations(&self) -> Result<Vec<sotto_store::Conversation>> {
        let db = self.db.lock().expect("store lock");
        db.list_conversations().map_err(Into::into)
    }

    pub fn messages_for(
        &self,
        conversation_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let db = self.db.lock().expect("store lock");
        db.get_messages_for_conversation(conversation_id, limit, offset)
            .map_err(Into::into)
    }
}

fn decrypt_body(secret: &SymmetricKey, payload: &[u8]) -> Result<String> {
    let bytes = crypto::decrypt(secret, payload)?;
    String::from_utf8(bytes).map_err(|_| sotto_shared::CryptoError::DecryptionFailed.into())
}

fn reply_ref(preview: ReplyPreview) -> ReplyRef {
    ReplyRef {
        target_msg_id: preview.target_msg_id,
        preview: preview.preview,
        sender: preview.sender.0,
    }
}

fn preview(body: &str) -> String {
    body.chars().take(PREVIEW_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use sotto_shared::crypto::generate_symmetric_key;

    struct Fixture {
        db: Arc<Mutex<Database>>,
        service: MessageService,
        registry: FriendRegistry,
        local: Uuid,
        peer: Uuid,
        secret: SymmetricKey,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let clock = Clock::new();
        let service = MessageService::new(Arc::clone(&db), clock.clone());
        let registry = FriendRegistry::new(Arc::clone(&db), clock);

        let peer = Uuid::new_v4();
        registry
            .receive_friend_request(peer, "bob", [3u8; 32])
            .unwrap();
        registry.accept_friend(peer).unwrap();

        Fixture {
            db,
            service,
            registry,
            local: Uuid::new_v4(),
            peer,
            secret: generate_symmetric_key(),
        }
    }

    fn chat_from_peer(f: &Fixture, body: &str, timestamp: chrono::DateTime<Utc>) -> ChatPayload {
        ChatPayload {
            msg_id: Uuid::new_v4(),
            from: PeerId(f.peer),
            to: PeerId(f.local),
            payload: crypto::encrypt(&f.secret, body.as_bytes()).unwrap(),
            timestamp,
            reply: None,
        }
    }

    #[test]
    fn inbound_message_increments_unread_and_bumps_conversation() {
        let f = fixture();
        let chat = chat_from_peer(&f, "hello alice", Utc::now());

        let stored = f
            .service
            .receive_message(&chat, f.local, &f.secret, &f.registry)
            .unwrap()
            .expect("stored");
        assert_eq!(stored.body, "hello alice");
        assert_eq!(stored.status, DeliveryStatus::Delivered);

        let conversations = f.service.conversations().unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].unread_count, 1);
        assert_eq!(conversations[0].last_message.as_deref(), Some("hello alice"));
        assert!(conversations[0].secret_ref.is_some());
    }

    #[test]
    fn redelivery_is_idempotent() {
        let f = fixture();
        let chat = chat_from_peer(&f, "hello", Utc::now());

        assert!(f
            .service
            .receive_message(&chat, f.local, &f.secret, &f.registry)
            .unwrap()
            .is_some());
        assert!(f
            .service
            .receive_message(&chat, f.local, &f.secret, &f.registry)
            .unwrap()
            .is_none());

        // The duplicate neither double-counts nor double-stores.
        assert_eq!(f.service.conversations().unwrap()[0].unread_count, 1);
        assert_eq!(f.service.messages_for(f.peer, 50, 0).unwrap().len(), 1);
    }

    #[test]
    fn last_timestamp_is_max_of_messages() {
        let f = fixture();
        let now = Utc::now();

        for minutes in [10i64, 1, 6] {
            let chat = chat_from_peer(&f, "m", now - Duration::minutes(minutes));
            f.service
                .receive_message(&chat, f.local, &f.secret, &f.registry)
                .unwrap();
        }

        let conversation = &f.service.conversations().unwrap()[0];
        let max = {
            let db = f.db.lock().unwrap();
            db.max_message_timestamp(f.peer).unwrap().unwrap()
        };
        assert_eq!(
            conversation.last_timestamp.unwrap().timestamp_millis(),
            max.timestamp_millis()
        );
    }

    #[test]
    fn blocked_sender_rejected_without_side_effects() {
        let f = fixture();

        // Establish the conversation with one message first.
        let first = chat_from_peer(&f, "before block", Utc::now());
        f.service
            .receive_message(&first, f.local, &f.secret, &f.registry)
            .unwrap();
        f.registry.block_friend(f.peer).unwrap();

        let chat = chat_from_peer(&f, "after block", Utc::now());
        let err = f
            .service
            .receive_message(&chat, f.local, &f.secret, &f.registry)
            .unwrap_err();
        assert!(matches!(err, CoreError::BlockedSender(_)));

        // Nothing changed: same single message, same unread count.
        assert_eq!(f.service.messages_for(f.peer, 50, 0).unwrap().len(), 1);
        assert_eq!(f.service.conversations().unwrap()[0].unread_count, 1);
    }

    #[test]
    fn focused_conversation_does_not_accumulate_unread() {
        let f = fixture();
        f.service.set_focused(Some(f.peer));

        let chat = chat_from_peer(&f, "hi", Utc::now());
        f.service
            .receive_message(&chat, f.local, &f.secret, &f.registry)
            .unwrap();

        assert_eq!(f.service.conversations().unwrap()[0].unread_count, 0);
    }

    #[test]
    fn echo_confirms_send_and_skips_unread() {
        let f = fixture();
        let friend = f.registry.get_friend(f.peer).unwrap();

        let (message, wire) = f
            .service
            .send_to_peer(f.local, &friend, "my own words", None, &f.secret)
            .unwrap();
        assert_eq!(message.status, DeliveryStatus::Sending);

        // Transport mirrors our message back.
        let echoed = f
            .service
            .receive_message(&wire, f.local, &f.secret, &f.registry)
            .unwrap()
            .expect("echo stored");
        assert!(echoed.is_echo);

        // The authoritative record advanced to sent; unread untouched.
        assert_eq!(
            f.service.messages_for(f.peer, 50, 0).unwrap()[0].status,
            DeliveryStatus::Sent
        );
        assert_eq!(f.service.conversations().unwrap()[0].unread_count, 0);
    }

    #[test]
    fn ack_chain_advances_status() {
        let f = fixture();
        let friend = f.registry.get_friend(f.peer).unwrap();
        let (message, _) = f
            .service
            .send_to_peer(f.local, &friend, "hello", None, &f.secret)
            .unwrap();

        f.service
            .update_status(message.msg_id, DeliveryStatus::Sent)
            .unwrap();
        f.service
            .update_status(message.msg_id, DeliveryStatus::Delivered)
            .unwrap();

        // A late duplicate delivery ack is an illegal repeat, logged and
        // rejected without changing the record.
        assert!(f
            .service
            .update_status(message.msg_id, DeliveryStatus::Delivered)
            .is_err());
        assert_eq!(
            f.service.messages_for(f.peer, 50, 0).unwrap()[0].status,
            DeliveryStatus::Delivered
        );
    }

    #[test]
    fn mark_read_resets_unread_and_reports_ids() {
        let f = fixture();
        let chat = chat_from_peer(&f, "unread me", Utc::now());
        f.service
            .receive_message(&chat, f.local, &f.secret, &f.registry)
            .unwrap();

        let changed = f.service.mark_conversation_read(f.peer).unwrap();
        assert_eq!(changed, vec![chat.msg_id]);

        let conversation = &f.service.conversations().unwrap()[0];
        assert_eq!(conversation.unread_count, 0);
        assert_eq!(
            f.service.messages_for(f.peer, 50, 0).unwrap()[0].status,
            DeliveryStatus::Read
        );
    }

    #[test]
    fn re_decrypt_roundtrip_and_failure() {
        let f = fixture();
        let chat = chat_from_peer(&f, "original words", Utc::now());
        f.service
            .receive_message(&chat, f.local, &f.secret, &f.registry)
            .unwrap();

        // Correct secret reproduces the plaintext exactly.
        let body = f.service.re_decrypt(chat.msg_id, &f.secret).unwrap();
        assert_eq!(body, "original words");

        // A wrong secret fails and leaves the stored plaintext untouched.
        let wrong = generate_symmetric_key();
        assert!(f.service.re_decrypt(chat.msg_id, &wrong).is_err());
        assert_eq!(
            f.service.messages_for(f.peer, 50, 0).unwrap()[0].body,
            "original words"
        );
    }

    #[test]
    fn decryption_failure_on_receive_persists_nothing() {
        let f = fixture();
        let mut chat = chat_from_peer(&f, "garbled", Utc::now());
        let len = chat.payload.len();
        chat.payload[len - 1] ^= 0xFF;

        assert!(f
            .service
            .receive_message(&chat, f.local, &f.secret, &f.registry)
            .is_err());
        assert!(f.service.conversations().unwrap().is_empty());
    }
}
