//! The client session: one store, one clock, the four services, and the
//! channels to the two external collaborators.
//!
//! The UI issues intents through the methods here and reads projections;
//! the transport feeds inbound [`WireMessage`]s into
//! [`Session::handle_wire`] and drains the [`Outbound`] channel.  Neither
//! collaborator owns any state relevant to this core.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use sotto_shared::kdf::PasswordKdf;
use sotto_shared::protocol::{
    CallSignal, ChatPayload, DeliveryAck, FriendAcceptPayload, FriendRequestPayload,
    KeyUpdatePayload, ReadAck, Signal, WireMessage,
};
use sotto_shared::types::{CallKind, PeerId};
use sotto_store::{Account, Database, DeliveryStatus, FriendState, Message, ReplyRef, StoreError};

use crate::accounts::{AccountManager, SessionKey};
use crate::calls::{CallSession, CallState};
use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::events::{EventSink, Outbound, UiEvent};
use crate::friends::FriendRegistry;
use crate::messaging::MessageService;

/// Read-only call projection handed to the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStateView {
    pub state: String,
    pub peer: Option<Uuid>,
    pub muted: bool,
    pub video_enabled: bool,
    pub duration_secs: Option<i64>,
}

pub struct Session {
    clock: Clock,
    accounts: AccountManager,
    friends: FriendRegistry,
    messages: MessageService,
    call: Mutex<CallSession>,
    events: EventSink,
}

impl Session {
    /// Wire up a session over an open store.  Returns the receiver halves
    /// for the transport (outbound wire traffic) and the UI
    /// (notifications).
    pub fn new(
        db: Database,
        kdf: Arc<dyn PasswordKdf>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Outbound>,
        mpsc::UnboundedReceiver<UiEvent>,
    ) {
        let db = Arc::new(Mutex::new(db));
        let clock = Clock::new();
        let (events, outbound_rx, ui_rx) = EventSink::channel();

        // A returning user already has an account on disk; a fresh store
        // gets a placeholder id until create_account.
        let local = {
            let guard = db.lock().expect("store lock");
            guard
                .get_account()
                .ok()
                .flatten()
                .map(|a| a.id)
                .unwrap_or_else(Uuid::nil)
        };

        let session = Self {
            clock: clock.clone(),
            accounts: AccountManager::new(Arc::clone(&db), kdf, clock.clone()),
            friends: FriendRegistry::new(Arc::clone(&db), clock.clone()),
            messages: MessageService::new(Arc::clone(&db), clock.clone()),
            call: Mutex::new(CallSession::new(local, clock)),
            events,
        };
        (session, outbound_rx, ui_rx)
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    // ------------------------------------------------------------------
    // Account intents
    // ------------------------------------------------------------------

    pub async fn create_account(&self, username: &str, password: &str) -> Result<Account> {
        let account = self.accounts.create_account(username, password).await?;
        *self.call.lock().expect("call lock") =
            CallSession::new(account.id, self.clock.clone());
        Ok(account)
    }

    pub async fn unlock(&self, password: &str) -> Result<SessionKey> {
        self.accounts.unlock(password).await
    }

    pub fn account(&self) -> Result<Account> {
        self.accounts.account()
    }

    /// Rotate the local key pair and announce the new public key to every
    /// established friend.
    pub fn rotate_keys(&self) -> Result<[u8; 32]> {
        let new_public = self.accounts.rotate_key_pair(&self.friends)?;
        let account = self.accounts.account()?;

        for friend in self.friends.list_friends()? {
            if friend.state == FriendState::Friend && !friend.blocked {
                self.events.send_wire(
                    friend.peer_id,
                    WireMessage::KeyUpdate(KeyUpdatePayload {
                        from: PeerId(account.id),
                        public_key: new_public,
                    }),
                );
            }
        }
        Ok(new_public)
    }

    /// Override the KDF cost parameters for accounts created through this
    /// session (tests, constrained devices).
    pub fn with_kdf_params(mut self, params: sotto_shared::kdf::KdfParams) -> Self {
        self.accounts.set_kdf_params(params);
        self
    }

    // ------------------------------------------------------------------
    // Friend intents
    // ------------------------------------------------------------------

    pub fn request_friend(&self, peer_id: Uuid, username: &str) -> Result<()> {
        let account = self.accounts.account()?;

        if self.friends.request_friend(peer_id, username)? {
            self.events.send_wire(
                peer_id,
                WireMessage::FriendRequest(FriendRequestPayload {
                    from: PeerId(account.id),
                    username: account.username,
                    public_key: account.public_key,
                }),
            );
        }
        self.events.notify(UiEvent::FriendUpdated { peer_id });
        Ok(())
    }

    pub fn accept_friend(&self, peer_id: Uuid) -> Result<()> {
        let account = self.accounts.account()?;
        self.friends.accept_friend(peer_id)?;

        self.events.send_wire(
            peer_id,
            WireMessage::FriendAccept(FriendAcceptPayload {
                from: PeerId(account.id),
                public_key: account.public_key,
            }),
        );
        self.events.notify(UiEvent::FriendUpdated { peer_id });
        Ok(())
    }

    pub fn block_friend(&self, peer_id: Uuid) -> Result<()> {
        self.friends.block_friend(peer_id)?;
        self.events.notify(UiEvent::FriendUpdated { peer_id });
        Ok(())
    }

    pub fn unblock_friend(&self, peer_id: Uuid) -> Result<()> {
        self.friends.unblock_friend(peer_id)?;
        self.events.notify(UiEvent::FriendUpdated { peer_id });
        Ok(())
    }

    pub fn remove_friend(&self, peer_id: Uuid) -> Result<bool> {
        let removed = self.friends.remove_friend(peer_id)?;
        if removed {
            self.events.notify(UiEvent::FriendUpdated { peer_id });
        }
        Ok(removed)
    }

    pub fn friends(&self) -> &FriendRegistry {
        &self.friends
    }

    // ------------------------------------------------------------------
    // Messaging intents
    // ------------------------------------------------------------------

    /// Encrypt, persist, and emit a 1:1 message.
    pub fn send_message(
        &self,
        peer_id: Uuid,
        body: &str,
        reply: Option<ReplyRef>,
    ) -> Result<Message> {
        let account = self.accounts.account()?;
        let friend = self.friends.get_friend(peer_id)?;
        let secret = self.friends.derived_secret_for(peer_id)?;

        let (message, wire) = self
            .messages
            .send_to_peer(account.id, &friend, body, reply, &secret)?;

        self.events.send_wire(peer_id, WireMessage::Chat(wire));
        self.events.notify(UiEvent::ConversationUpdated {
            conversation_id: message.conversation_id,
        });
        Ok(message)
    }

    /// Transport confirmation that an outbound message hit the wire.
    pub fn mark_sent(&self, msg_id: Uuid) -> Result<()> {
        self.apply_status(msg_id, DeliveryStatus::Sent)
    }

    /// Give up on an outbound message the transport could not deliver.
    /// A later resend creates a fresh record with a fresh msg_id.
    pub fn mark_failed(&self, msg_id: Uuid) -> Result<()> {
        self.apply_status(msg_id, DeliveryStatus::Failed)
    }

    /// Mark a conversation read and acknowledge the read messages to
    /// their sender.
    pub fn mark_conversation_read(&self, conversation_id: Uuid) -> Result<()> {
        let account = self.accounts.account()?;
        let changed = self.messages.mark_conversation_read(conversation_id)?;

        if !changed.is_empty() {
            // 1:1 conversations are keyed by the peer, who is also the
            // sender of everything we just read.
            self.events.send_wire(
                conversation_id,
                WireMessage::ReadAck(ReadAck {
                    msg_ids: changed,
                    from: PeerId(account.id),
                }),
            );
        }
        self.events.notify(UiEvent::ConversationUpdated { conversation_id });
        Ok(())
    }

    /// Track which conversation the UI has open; inbound messages for the
    /// focused conversation skip the unread counter.
    pub fn focus_conversation(&self, conversation_id: Option<Uuid>) {
        self.messages.set_focused(conversation_id);
    }

    /// Re-decrypt a stored message's retained ciphertext under the
    /// currently derived secret for its conversation.
    pub fn re_decrypt(&self, msg_id: Uuid) -> Result<String> {
        let message = self.messages.message(msg_id)?;
        let secret = self.friends.derived_secret_for(message.conversation_id)?;
        self.messages.re_decrypt(msg_id, &secret)
    }

    pub fn conversations(&self) -> Result<Vec<sotto_store::Conversation>> {
        self.messages.conversations()
    }

    pub fn messages_for(
        &self,
        conversation_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        self.messages.messages_for(conversation_id, limit, offset)
    }

    // ------------------------------------------------------------------
    // Call intents
    // ------------------------------------------------------------------

    pub fn start_call(&self, peer_id: Uuid, kind: CallKind) -> Result<()> {
        let signal = self
            .call
            .lock()
            .expect("call lock")
            .start_call(peer_id, kind)?;
        self.events
            .send_wire(peer_id, WireMessage::CallSignal(signal));
        self.notify_call_state();
        Ok(())
    }

    pub fn accept_call(&self) -> Result<()> {
        let signal = self.call.lock().expect("call lock").local_accept()?;
        self.events
            .send_wire(signal.to.0, WireMessage::CallSignal(signal));
        self.notify_call_state();
        Ok(())
    }

    pub fn reject_call(&self) -> Result<()> {
        let signal = self.call.lock().expect("call lock").local_reject()?;
        self.events
            .send_wire(signal.to.0, WireMessage::CallSignal(signal));
        self.notify_call_state();
        Ok(())
    }

    pub fn end_call(&self) -> Result<()> {
        let signal = self.call.lock().expect("call lock").end_call()?;
        self.events
            .send_wire(signal.to.0, WireMessage::CallSignal(signal));
        self.notify_call_state();
        Ok(())
    }

    pub fn toggle_mute(&self) -> Result<bool> {
        let muted = self.call.lock().expect("call lock").toggle_mute()?;
        self.notify_call_state();
        Ok(muted)
    }

    pub fn toggle_video(&self) -> Result<bool> {
        let enabled = self.call.lock().expect("call lock").toggle_video()?;
        self.notify_call_state();
        Ok(enabled)
    }

    /// Drive call timeouts.  Called periodically by the host; returns
    /// `true` when an unanswered call expired back to idle.
    pub fn call_tick(&self) -> bool {
        let expired = self.call.lock().expect("call lock").check_timeout();
        if expired {
            self.notify_call_state();
        }
        expired
    }

    pub fn call_state(&self) -> CallStateView {
        let call = self.call.lock().expect("call lock");
        let (peer, muted, video_enabled) = match call.state() {
            CallState::Connected {
                peer,
                muted,
                video_enabled,
                ..
            } => (Some(*peer), *muted, *video_enabled),
            CallState::Calling { peer, .. } | CallState::Ringing { peer, .. } => {
                (Some(*peer), false, false)
            }
            CallState::Idle => (None, false, false),
        };
        CallStateView {
            state: call.state().name().to_string(),
            peer,
            muted,
            video_enabled,
            duration_secs: call.duration().map(|d| d.num_seconds()),
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Feed one inbound wire message through the matching service.
    ///
    /// Redeliveries are harmless everywhere; policy rejections surface as
    /// errors without side effects so the transport pump can log them.
    pub fn handle_wire(&self, incoming: WireMessage) -> Result<()> {
        match incoming {
            WireMessage::Chat(chat) => self.handle_chat(chat),

            WireMessage::DeliveryAck(DeliveryAck { msg_id, .. }) => {
                self.apply_status(msg_id, DeliveryStatus::Delivered)
            }

            WireMessage::ReadAck(ReadAck { msg_ids, .. }) => {
                for msg_id in msg_ids {
                    self.apply_status(msg_id, DeliveryStatus::Read)?;
                }
                Ok(())
            }

            WireMessage::FriendRequest(request) => {
                self.friends.receive_friend_request(
                    request.from.0,
                    &request.username,
                    request.public_key,
                )?;
                self.events.notify(UiEvent::FriendUpdated {
                    peer_id: request.from.0,
                });
                Ok(())
            }

            WireMessage::FriendAccept(acceptance) => {
                self.friends
                    .handle_acceptance(acceptance.from.0, acceptance.public_key)?;
                self.events.notify(UiEvent::FriendUpdated {
                    peer_id: acceptance.from.0,
                });
                Ok(())
            }

            WireMessage::KeyUpdate(update) => {
                self.friends
                    .update_peer_key(update.from.0, update.public_key)?;
                self.events.notify(UiEvent::FriendUpdated {
                    peer_id: update.from.0,
                });
                Ok(())
            }

            WireMessage::CallSignal(signal) => self.handle_call_signal(signal),

            WireMessage::TimeSync(sync) => {
                self.clock.update_offset(sync.trusted);
                if self.clock.is_drifted() {
                    self.events.notify(UiEvent::ClockDrifted {
                        offset_ms: self.clock.offset_ms(),
                    });
                }
                Ok(())
            }
        }
    }

    fn handle_chat(&self, chat: ChatPayload) -> Result<()> {
        let account = self.accounts.account()?;
        let peer = if chat.from.0 == account.id {
            chat.to.0
        } else {
            chat.from.0
        };
        let secret = self.friends.derived_secret_for(peer)?;

        match self
            .messages
            .receive_message(&chat, account.id, &secret, &self.friends)?
        {
            Some(message) if message.is_echo => {
                self.events.notify(UiEvent::MessageStatusChanged {
                    msg_id: message.msg_id,
                    status: DeliveryStatus::Sent,
                });
            }
            Some(message) => {
                self.events.send_wire(
                    message.from_id,
                    WireMessage::DeliveryAck(DeliveryAck {
                        msg_id: message.msg_id,
                        from: PeerId(account.id),
                    }),
                );
                self.events.notify(UiEvent::ConversationUpdated {
                    conversation_id: message.conversation_id,
                });
            }
            None => debug!(msg_id = %chat.msg_id, "redelivered message ignored"),
        }
        Ok(())
    }

    fn handle_call_signal(&self, signal: CallSignal) -> Result<()> {
        let peer = signal.from.0;
        {
            let mut call = self.call.lock().expect("call lock");
            match signal.signal {
                Signal::Invite(kind) => {
                    if let Err(CoreError::CallBusy) = call.incoming_invite(peer, kind) {
                        drop(call);
                        // The line is busy: answer with a reject without
                        // disturbing the active session.
                        let account = self.accounts.account()?;
                        self.events.send_wire(
                            peer,
                            WireMessage::CallSignal(CallSignal {
                                from: PeerId(account.id),
                                to: signal.from,
                                signal: Signal::Reject,
                            }),
                        );
                        return Err(CoreError::CallBusy);
                    }
                }
                Signal::Accept => call.peer_accepted()?,
                Signal::Reject => call.peer_rejected()?,
                Signal::Hangup => call.peer_hangup(),
            }
        }
        self.notify_call_state();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Apply a status transition, treating illegal or unknown-msg cases as
    /// the non-fatal diagnostics the transition table makes them:
    /// logged, record left in last-known-good state.
    fn apply_status(&self, msg_id: Uuid, status: DeliveryStatus) -> Result<()> {
        match self.messages.update_status(msg_id, status) {
            Ok(applied) => {
                self.events.notify(UiEvent::MessageStatusChanged {
                    msg_id,
                    status: applied,
                });
                Ok(())
            }
            Err(CoreError::Store(StoreError::InvalidStatusTransition { from, to })) => {
                warn!(msg_id = %msg_id, ?from, ?to, "ignoring illegal status transition");
                Ok(())
            }
            Err(CoreError::Store(StoreError::NotFound)) => {
                debug!(msg_id = %msg_id, "status update for unknown message ignored");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn notify_call_state(&self) {
        let state = self
            .call
            .lock()
            .expect("call lock")
            .state()
            .name()
            .to_string();
        self.events.notify(UiEvent::CallStateChanged { state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sotto_shared::kdf::{Argon2Kdf, KdfParams};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("sotto_core=debug")
            .with_test_writer()
            .try_init();
    }

    fn cheap_params() -> KdfParams {
        KdfParams::Argon2id {
            m_cost: 8,
            t_cost: 1,
            p_cost: 1,
        }
    }

    struct Side {
        session: Session,
        outbound: UnboundedReceiver<Outbound>,
        ui: UnboundedReceiver<UiEvent>,
    }

    async fn side(username: &str) -> Side {
        let (session, outbound, ui) =
            Session::new(Database::open_in_memory().unwrap(), Arc::new(Argon2Kdf));
        let session = session.with_kdf_params(cheap_params());
        session.create_account(username, "pw").await.unwrap();
        Side {
            session,
            outbound,
            ui,
        }
    }

    /// Deliver every queued outbound message from one side to the other,
    /// ignoring per-message policy rejections the way a transport would.
    fn pump(from: &mut Side, to: &Side) -> usize {
        let mut delivered = 0;
        while let Ok(outbound) = from.outbound.try_recv() {
            let _ = to.session.handle_wire(outbound.message);
            delivered += 1;
        }
        delivered
    }

    async fn befriended_pair() -> (Side, Side, Uuid, Uuid) {
        let mut alice = side("alice").await;
        let mut bob = side("bob").await;
        let alice_id = alice.session.account().unwrap().id;
        let bob_id = bob.session.account().unwrap().id;

        alice.session.request_friend(bob_id, "bob").unwrap();
        pump(&mut alice, &bob);
        bob.session.accept_friend(alice_id).unwrap();
        pump(&mut bob, &alice);

        (alice, bob, alice_id, bob_id)
    }

    #[tokio::test]
    async fn friend_exchange_end_to_end() {
        init_tracing();
        let (mut alice, bob, alice_id, bob_id) = befriended_pair().await;

        let on_alice = alice.session.friends().get_friend(bob_id).unwrap();
        assert_eq!(on_alice.state, FriendState::Friend);
        assert!(on_alice.public_key.is_some());

        let on_bob = bob.session.friends().get_friend(alice_id).unwrap();
        assert_eq!(on_bob.state, FriendState::Friend);
        assert!(on_bob.public_key.is_some());

        // The UI heard about the relationship changes.
        let mut saw_friend_update = false;
        while let Ok(event) = alice.ui.try_recv() {
            if matches!(event, UiEvent::FriendUpdated { peer_id } if peer_id == bob_id) {
                saw_friend_update = true;
            }
        }
        assert!(saw_friend_update);
    }

    #[tokio::test]
    async fn message_lifecycle_end_to_end() {
        init_tracing();
        let (mut alice, mut bob, _alice_id, bob_id) = befriended_pair().await;

        // alice -> bob
        let message = alice
            .session
            .send_message(bob_id, "hello bob", None)
            .unwrap();
        alice.session.mark_sent(message.msg_id).unwrap();
        pump(&mut alice, &bob);

        // Bob stored it and counts it unread; alice got the delivery ack.
        let bob_conversations = bob.session.conversations().unwrap();
        assert_eq!(bob_conversations.len(), 1);
        assert_eq!(bob_conversations[0].unread_count, 1);
        pump(&mut bob, &alice);
        assert_eq!(
            alice.session.messages_for(bob_id, 50, 0).unwrap()[0].status,
            DeliveryStatus::Delivered
        );

        // Bob opens the conversation; alice sees the read receipt.
        let alice_conv_on_bob = bob_conversations[0].id;
        bob.session
            .mark_conversation_read(alice_conv_on_bob)
            .unwrap();
        assert_eq!(
            bob.session.conversations().unwrap()[0].unread_count,
            0
        );
        pump(&mut bob, &alice);
        assert_eq!(
            alice.session.messages_for(bob_id, 50, 0).unwrap()[0].status,
            DeliveryStatus::Read
        );
    }

    #[tokio::test]
    async fn blocked_sender_dropped_at_the_store_boundary() {
        init_tracing();
        let (mut alice, mut bob, alice_id, bob_id) = befriended_pair().await;

        bob.session.block_friend(alice_id).unwrap();
        alice.session.send_message(bob_id, "let me in", None).unwrap();
        pump(&mut alice, &bob);

        assert!(bob.session.conversations().unwrap().is_empty());

        // Unblocking restores delivery.
        bob.session.unblock_friend(alice_id).unwrap();
        alice.session.send_message(bob_id, "hello again", None).unwrap();
        pump(&mut alice, &bob);
        assert_eq!(bob.session.conversations().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn key_rotation_propagates_and_old_mail_rereads() {
        init_tracing();
        let (mut alice, mut bob, alice_id, bob_id) = befriended_pair().await;

        alice.session.send_message(bob_id, "before rotation", None).unwrap();
        pump(&mut alice, &bob);

        let new_public = alice.session.rotate_keys().unwrap();
        pump(&mut alice, &bob);

        // Bob learned the new key.
        assert_eq!(
            bob.session.friends().get_friend(alice_id).unwrap().public_key,
            Some(new_public)
        );

        // Fresh traffic under the renegotiated secret still flows.
        alice.session.send_message(bob_id, "after rotation", None).unwrap();
        pump(&mut alice, &bob);
        assert_eq!(bob.session.messages_for(alice_id, 50, 0).unwrap().len(), 2);

        // Pre-rotation ciphertext no longer authenticates under the
        // renegotiated secret; the stored plaintext survives the failed
        // re-decryption attempt.
        let old = &bob.session.messages_for(alice_id, 50, 0).unwrap()[1];
        assert_eq!(old.body, "before rotation");
        assert!(bob.session.re_decrypt(old.msg_id).is_err());
        assert_eq!(
            bob.session.messages_for(alice_id, 50, 0).unwrap()[1].body,
            "before rotation"
        );
    }

    #[tokio::test]
    async fn call_setup_and_busy_rejection() {
        init_tracing();
        let (mut alice, mut bob, _alice_id, bob_id) = befriended_pair().await;

        alice.session.start_call(bob_id, CallKind::Audio).unwrap();
        pump(&mut alice, &bob);
        assert_eq!(bob.session.call_state().state, "ringing");

        bob.session.accept_call().unwrap();
        pump(&mut bob, &alice);
        assert_eq!(alice.session.call_state().state, "connected");
        assert_eq!(bob.session.call_state().state, "connected");

        // A third party ringing bob now gets an automatic reject.
        let mut carol = side("carol").await;
        let carol_id = carol.session.account().unwrap().id;
        carol.session.request_friend(bob_id, "bob").unwrap();
        pump(&mut carol, &bob);
        bob.session.accept_friend(carol_id).unwrap();
        pump(&mut bob, &carol);

        carol.session.start_call(bob_id, CallKind::Video).unwrap();
        pump(&mut carol, &bob);
        assert_eq!(bob.session.call_state().state, "connected");
        pump(&mut bob, &carol);
        assert_eq!(carol.session.call_state().state, "idle");

        // Hanging up tears down both ends.
        alice.session.end_call().unwrap();
        pump(&mut alice, &bob);
        assert_eq!(alice.session.call_state().state, "idle");
        assert_eq!(bob.session.call_state().state, "idle");
        assert!(alice.session.call_state().duration_secs.is_none());
    }

    #[tokio::test]
    async fn time_sync_drives_the_session_clock() {
        init_tracing();
        let alice = side("alice").await;

        let trusted = chrono::Utc::now() + chrono::Duration::seconds(30);
        alice
            .session
            .handle_wire(WireMessage::TimeSync(sotto_shared::protocol::TimeSync {
                trusted,
            }))
            .unwrap();

        assert!(alice.session.clock().is_drifted());
        assert!((alice.session.clock().offset_ms() - 30_000).abs() < 100);
    }
}
