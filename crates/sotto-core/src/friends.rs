//! Friend relationship registry.
//!
//! Tracks peer identities, their public keys, and relationship state, and
//! owns the cache of per-peer shared secrets.  The message service
//! consults this registry before accepting any inbound write, which is
//! where the blocked-peer exclusion is enforced.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};
use uuid::Uuid;

use sotto_shared::crypto::SymmetricKey;
use sotto_shared::keys::{derive_shared_secret, KeyPair};
use sotto_store::{Database, Friend, FriendState, StoreError};

use crate::clock::Clock;
use crate::error::{CoreError, Result};

pub struct FriendRegistry {
    db: Arc<Mutex<Database>>,
    clock: Clock,
    /// Cached shared secrets, flushed wholesale on key rotation.
    secrets: Mutex<HashMap<Uuid, SymmetricKey>>,
}

impl FriendRegistry {
    pub fn new(db: Arc<Mutex<Database>>, clock: Clock) -> Self {
        Self {
            db,
            clock,
            secrets: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Relationship state
    // ------------------------------------------------------------------

    /// Record an outgoing friend request.
    ///
    /// Returns `true` when a request should actually go on the wire;
    /// repeated calls on an existing pending record are no-ops.
    pub fn request_friend(&self, peer_id: Uuid, username: &str) -> Result<bool> {
        let db = self.db.lock().expect("store lock");

        match db.get_friend(peer_id) {
            Ok(existing) => {
                debug!(peer = %peer_id, state = existing.state.as_str(),
                       "friend request is a no-op for existing record");
                Ok(false)
            }
            Err(StoreError::NotFound) => {
                let now = self.clock.now();
                db.upsert_friend(&Friend {
                    peer_id,
                    username: username.to_string(),
                    avatar: None,
                    status_message: None,
                    state: FriendState::PendingOutgoing,
                    blocked: false,
                    public_key: None,
                    created_at: now,
                    updated_at: now,
                })?;
                info!(peer = %peer_id, "outgoing friend request recorded");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record an inbound friend request, storing the peer's public key.
    /// Requests from blocked peers are rejected without a side effect.
    pub fn receive_friend_request(
        &self,
        peer_id: Uuid,
        username: &str,
        public_key: [u8; 32],
    ) -> Result<()> {
        let db = self.db.lock().expect("store lock");

        if db.is_peer_blocked(peer_id)? {
            return Err(CoreError::BlockedSender(peer_id));
        }

        match db.get_friend(peer_id) {
            Ok(existing) if existing.state == FriendState::Friend => {
                // Redelivered request from an established friend; refresh
                // the key and move on.
                db.update_friend_state(
                    peer_id,
                    FriendState::Friend,
                    Some(&public_key),
                    self.clock.now(),
                )?;
                Ok(())
            }
            Ok(_) => {
                db.update_friend_state(
                    peer_id,
                    FriendState::PendingIncoming,
                    Some(&public_key),
                    self.clock.now(),
                )?;
                Ok(())
            }
            Err(StoreError::NotFound) => {
                let now = self.clock.now();
                db.upsert_friend(&Friend {
                    peer_id,
                    username: username.to_string(),
                    avatar: None,
                    status_message: None,
                    state: FriendState::PendingIncoming,
                    blocked: false,
                    public_key: Some(public_key),
                    created_at: now,
                    updated_at: now,
                })?;
                info!(peer = %peer_id, "incoming friend request recorded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Accept a pending incoming request.
    pub fn accept_friend(&self, peer_id: Uuid) -> Result<Friend> {
        let db = self.db.lock().expect("store lock");

        let friend = db.get_friend(peer_id)?;
        if friend.blocked {
            return Err(CoreError::BlockedSender(peer_id));
        }
        if friend.state != FriendState::PendingIncoming {
            return Err(CoreError::NotPending(peer_id));
        }

        db.update_friend_state(peer_id, FriendState::Friend, None, self.clock.now())?;
        info!(peer = %peer_id, "friend request accepted");
        db.get_friend(peer_id).map_err(Into::into)
    }

    /// The remote peer accepted our outgoing request; their public key
    /// arrives with the acceptance.  Redelivered acceptances are no-ops.
    pub fn handle_acceptance(&self, peer_id: Uuid, public_key: [u8; 32]) -> Result<()> {
        let db = self.db.lock().expect("store lock");

        let friend = db.get_friend(peer_id)?;
        match friend.state {
            FriendState::Friend => Ok(()),
            FriendState::PendingOutgoing => {
                db.update_friend_state(
                    peer_id,
                    FriendState::Friend,
                    Some(&public_key),
                    self.clock.now(),
                )?;
                info!(peer = %peer_id, "outgoing friend request was accepted");
                Ok(())
            }
            FriendState::PendingIncoming => Err(CoreError::NotPending(peer_id)),
        }
    }

    /// Remove a peer record entirely.  Returns `true` if one existed.
    pub fn remove_friend(&self, peer_id: Uuid) -> Result<bool> {
        self.secrets.lock().expect("secret cache lock").remove(&peer_id);
        let db = self.db.lock().expect("store lock");
        db.delete_friend(peer_id).map_err(Into::into)
    }

    /// Set the block flag.  Relationship state is untouched; the record
    /// stays so unblocking restores the prior relationship.
    pub fn block_friend(&self, peer_id: Uuid) -> Result<()> {
        let db = self.db.lock().expect("store lock");
        db.set_friend_blocked(peer_id, true, self.clock.now())?;
        info!(peer = %peer_id, "peer blocked");
        Ok(())
    }

    /// Clear the block flag.
    pub fn unblock_friend(&self, peer_id: Uuid) -> Result<()> {
        let db = self.db.lock().expect("store lock");
        db.set_friend_blocked(peer_id, false, self.clock.now())?;
        info!(peer = %peer_id, "peer unblocked");
        Ok(())
    }

    pub fn is_blocked(&self, peer_id: Uuid) -> Result<bool> {
        let db = self.db.lock().expect("store lock");
        db.is_peer_blocked(peer_id).map_err(Into::into)
    }

    pub fn get_friend(&self, peer_id: Uuid) -> Result<Friend> {
        let db = self.db.lock().expect("store lock");
        db.get_friend(peer_id).map_err(Into::into)
    }

    pub fn list_friends(&self) -> Result<Vec<Friend>> {
        let db = self.db.lock().expect("store lock");
        db.list_friends().map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Shared secrets
    // ------------------------------------------------------------------

    /// The symmetric key for 1:1 traffic with a peer, derived from the
    /// local key pair and the peer's stored public key and bound to the
    /// conversation.  Cached until [`FriendRegistry::invalidate_secrets`].
    ///
    /// The binding context is the two participant UUIDs in canonical
    /// order, so both sides derive the identical key.
    pub fn derived_secret_for(&self, peer_id: Uuid) -> Result<SymmetricKey> {
        if let Some(cached) = self.secrets.lock().expect("secret cache lock").get(&peer_id) {
            return Ok(*cached);
        }

        let friend = self.get_friend(peer_id)?;
        let peer_key = friend.public_key.ok_or(CoreError::MissingPeerKey(peer_id))?;

        let account = {
            let db = self.db.lock().expect("store lock");
            db.get_account()?.ok_or(CoreError::NoAccount)?
        };
        let local = KeyPair::from_secret_bytes(&account.secret_key);

        let secret = derive_shared_secret(&local, &peer_key, &pair_context(account.id, peer_id));
        self.secrets
            .lock()
            .expect("secret cache lock")
            .insert(peer_id, secret);
        Ok(secret)
    }

    /// A peer rotated their key pair.  The stored public key is replaced
    /// and the cached secret dropped; relationship state is untouched.
    pub fn update_peer_key(&self, peer_id: Uuid, public_key: [u8; 32]) -> Result<()> {
        self.secrets.lock().expect("secret cache lock").remove(&peer_id);

        let db = self.db.lock().expect("store lock");
        let friend = db.get_friend(peer_id)?;
        db.update_friend_state(peer_id, friend.state, Some(&public_key), self.clock.now())?;
        debug!(peer = %peer_id, "peer public key replaced");
        Ok(())
    }

    /// Flush every cached shared secret.  Called after a key rotation,
    /// when all previously derived secrets are stale.
    pub fn invalidate_secrets(&self) {
        let mut cache = self.secrets.lock().expect("secret cache lock");
        let flushed = cache.len();
        cache.clear();
        debug!(flushed, "shared secret cache invalidated");
    }
}

/// Short fingerprint naming which shared secret a conversation's traffic
/// is encrypted under; stored as the conversation's `secret_ref`.
pub fn secret_fingerprint(key: &SymmetricKey) -> String {
    hex::encode(&blake3::hash(key).as_bytes()[..8])
}

/// Conversation-binding context: both participant UUIDs, smaller first,
/// so either side derives the same key.
fn pair_context(a: Uuid, b: Uuid) -> [u8; 32] {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut context = [0u8; 32];
    context[..16].copy_from_slice(lo.as_bytes());
    context[16..].copy_from_slice(hi.as_bytes());
    context
}
