//! Call-session state machine.
//!
//! Sequences signaling events (invite/accept/reject/hangup) into the four
//! call states.  At most one session is active at a time; the ring
//! timeout, checked against the synchronized [`Clock`], is the only
//! automatic recovery and the sole cancellation mechanism.
//!
//! ```text
//! idle --start_call--> calling --peer_accepted--> connected
//! idle --incoming_invite--> ringing --local_accept--> connected
//! calling|ringing --reject|timeout--> idle
//! connected --end_call (either side)--> idle
//! ```

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use sotto_shared::constants::CALL_RING_TIMEOUT_SECS;
use sotto_shared::protocol::{CallSignal, Signal};
use sotto_shared::types::{CallKind, PeerId};

use crate::clock::Clock;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Outgoing call, waiting for the peer to answer.
    Calling {
        peer: Uuid,
        kind: CallKind,
        started: DateTime<Utc>,
    },
    /// Incoming call, waiting for the local user to answer.  No media
    /// flows yet.
    Ringing {
        peer: Uuid,
        kind: CallKind,
        started: DateTime<Utc>,
    },
    Connected {
        peer: Uuid,
        kind: CallKind,
        connected_at: DateTime<Utc>,
        muted: bool,
        video_enabled: bool,
    },
}

impl CallState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Calling { .. } => "calling",
            Self::Ringing { .. } => "ringing",
            Self::Connected { .. } => "connected",
        }
    }
}

pub struct CallSession {
    local: Uuid,
    clock: Clock,
    state: CallState,
}

impl CallSession {
    pub fn new(local: Uuid, clock: Clock) -> Self {
        Self {
            local,
            clock,
            state: CallState::Idle,
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, CallState::Idle)
    }

    /// Elapsed connected time; `None` outside of `connected`.  Resets with
    /// the transition back to idle since the state carries the anchor.
    pub fn duration(&self) -> Option<Duration> {
        match &self.state {
            CallState::Connected { connected_at, .. } => Some(self.clock.now() - *connected_at),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------

    /// Place an outgoing call.  Returns the invite for the transport.
    pub fn start_call(&mut self, peer: Uuid, kind: CallKind) -> Result<CallSignal> {
        if !self.is_idle() {
            return Err(CoreError::CallBusy);
        }

        self.state = CallState::Calling {
            peer,
            kind,
            started: self.clock.now(),
        };
        info!(peer = %peer, kind = kind.as_str(), "call started, awaiting answer");

        Ok(self.signal_to(peer, Signal::Invite(kind)))
    }

    /// The peer answered our outgoing call.
    pub fn peer_accepted(&mut self) -> Result<()> {
        match self.state {
            CallState::Calling { peer, kind, .. } => {
                self.state = CallState::Connected {
                    peer,
                    kind,
                    connected_at: self.clock.now(),
                    muted: false,
                    video_enabled: kind == CallKind::Video,
                };
                info!(peer = %peer, "call connected");
                Ok(())
            }
            _ => Err(CoreError::UnexpectedSignal),
        }
    }

    /// The peer declined our outgoing call.
    pub fn peer_rejected(&mut self) -> Result<()> {
        match self.state {
            CallState::Calling { peer, .. } => {
                info!(peer = %peer, "call rejected by peer");
                self.state = CallState::Idle;
                Ok(())
            }
            _ => Err(CoreError::UnexpectedSignal),
        }
    }

    // ------------------------------------------------------------------
    // Incoming
    // ------------------------------------------------------------------

    /// An invite arrived.  While another session is active the invite is
    /// rejected with busy; the caller should answer the peer with a
    /// reject signal.
    pub fn incoming_invite(&mut self, peer: Uuid, kind: CallKind) -> Result<()> {
        if !self.is_idle() {
            warn!(peer = %peer, "invite while busy");
            return Err(CoreError::CallBusy);
        }

        self.state = CallState::Ringing {
            peer,
            kind,
            started: self.clock.now(),
        };
        info!(peer = %peer, kind = kind.as_str(), "incoming call ringing");
        Ok(())
    }

    /// Answer the ringing call.  Media attaches from here on.
    pub fn local_accept(&mut self) -> Result<CallSignal> {
        match self.state {
            CallState::Ringing { peer, kind, .. } => {
                self.state = CallState::Connected {
                    peer,
                    kind,
                    connected_at: self.clock.now(),
                    muted: false,
                    video_enabled: kind == CallKind::Video,
                };
                info!(peer = %peer, "call answered");
                Ok(self.signal_to(peer, Signal::Accept))
            }
            _ => Err(CoreError::NotInCall),
        }
    }

    /// Decline the ringing call.
    pub fn local_reject(&mut self) -> Result<CallSignal> {
        match self.state {
            CallState::Ringing { peer, .. } => {
                info!(peer = %peer, "call declined");
                self.state = CallState::Idle;
                Ok(self.signal_to(peer, Signal::Reject))
            }
            _ => Err(CoreError::NotInCall),
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Hang up locally from any non-idle state.
    pub fn end_call(&mut self) -> Result<CallSignal> {
        let peer = match self.state {
            CallState::Idle => return Err(CoreError::NotInCall),
            CallState::Calling { peer, .. }
            | CallState::Ringing { peer, .. }
            | CallState::Connected { peer, .. } => peer,
        };

        info!(peer = %peer, "call ended locally");
        self.state = CallState::Idle;
        Ok(self.signal_to(peer, Signal::Hangup))
    }

    /// The peer hung up.  Harmless when already idle (redelivery).
    pub fn peer_hangup(&mut self) {
        if !self.is_idle() {
            info!("call ended by peer");
            self.state = CallState::Idle;
        }
    }

    /// Expire an unanswered call.  Returns `true` if the session timed out
    /// and fell back to idle; any partially negotiated state is discarded.
    pub fn check_timeout(&mut self) -> bool {
        let started = match self.state {
            CallState::Calling { started, .. } | CallState::Ringing { started, .. } => started,
            _ => return false,
        };

        if self.clock.now() - started >= Duration::seconds(CALL_RING_TIMEOUT_SECS) {
            warn!(state = self.state.name(), "call timed out, back to idle");
            self.state = CallState::Idle;
            return true;
        }
        false
    }

    // ------------------------------------------------------------------
    // In-call controls
    // ------------------------------------------------------------------

    pub fn toggle_mute(&mut self) -> Result<bool> {
        match &mut self.state {
            CallState::Connected { muted, .. } => {
                *muted = !*muted;
                info!(muted = *muted, "mute toggled");
                Ok(*muted)
            }
            _ => Err(CoreError::NotInCall),
        }
    }

    pub fn toggle_video(&mut self) -> Result<bool> {
        match &mut self.state {
            CallState::Connected { video_enabled, .. } => {
                *video_enabled = !*video_enabled;
                info!(video = *video_enabled, "video toggled");
                Ok(*video_enabled)
            }
            _ => Err(CoreError::NotInCall),
        }
    }

    fn signal_to(&self, peer: Uuid, signal: Signal) -> CallSignal {
        CallSignal {
            from: PeerId(self.local),
            to: PeerId(peer),
            signal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (CallSession, Clock) {
        let clock = Clock::new();
        (CallSession::new(Uuid::new_v4(), clock.clone()), clock)
    }

    #[test]
    fn outgoing_call_happy_path() {
        let (mut session, _clock) = session();
        let peer = Uuid::new_v4();

        let invite = session.start_call(peer, CallKind::Audio).unwrap();
        assert_eq!(invite.signal, Signal::Invite(CallKind::Audio));
        assert_eq!(session.state().name(), "calling");

        session.peer_accepted().unwrap();
        assert_eq!(session.state().name(), "connected");
        assert!(session.duration().is_some());

        let hangup = session.end_call().unwrap();
        assert_eq!(hangup.signal, Signal::Hangup);
        assert!(session.is_idle());
        assert!(session.duration().is_none());
    }

    #[test]
    fn incoming_call_happy_path() {
        let (mut session, _clock) = session();
        let peer = Uuid::new_v4();

        session.incoming_invite(peer, CallKind::Video).unwrap();
        assert_eq!(session.state().name(), "ringing");
        // No duration accrues before media attaches.
        assert!(session.duration().is_none());

        let accept = session.local_accept().unwrap();
        assert_eq!(accept.signal, Signal::Accept);
        assert_eq!(session.state().name(), "connected");
    }

    #[test]
    fn second_session_is_busy() {
        let (mut session, _clock) = session();
        let peer = Uuid::new_v4();
        session.start_call(peer, CallKind::Audio).unwrap();

        assert!(matches!(
            session.start_call(Uuid::new_v4(), CallKind::Audio),
            Err(CoreError::CallBusy)
        ));
        assert!(matches!(
            session.incoming_invite(Uuid::new_v4(), CallKind::Audio),
            Err(CoreError::CallBusy)
        ));

        // Also from connected.
        session.peer_accepted().unwrap();
        assert!(matches!(
            session.start_call(Uuid::new_v4(), CallKind::Audio),
            Err(CoreError::CallBusy)
        ));
    }

    #[test]
    fn rejections_return_to_idle() {
        let (mut session, _clock) = session();

        session.start_call(Uuid::new_v4(), CallKind::Audio).unwrap();
        session.peer_rejected().unwrap();
        assert!(session.is_idle());

        session
            .incoming_invite(Uuid::new_v4(), CallKind::Audio)
            .unwrap();
        let reject = session.local_reject().unwrap();
        assert_eq!(reject.signal, Signal::Reject);
        assert!(session.is_idle());
    }

    #[test]
    fn unanswered_call_times_out() {
        let (mut session, clock) = session();
        session.start_call(Uuid::new_v4(), CallKind::Audio).unwrap();

        assert!(!session.check_timeout());

        // Jump the synchronized clock past the ring deadline.
        clock.update_offset(Utc::now() + Duration::seconds(CALL_RING_TIMEOUT_SECS + 1));
        assert!(session.check_timeout());
        assert!(session.is_idle());

        // A connected call never times out this way.
        clock.update_offset(Utc::now());
        session
            .incoming_invite(Uuid::new_v4(), CallKind::Audio)
            .unwrap();
        session.local_accept().unwrap();
        clock.update_offset(Utc::now() + Duration::seconds(CALL_RING_TIMEOUT_SECS * 2));
        assert!(!session.check_timeout());
    }

    #[test]
    fn stray_signals_rejected() {
        let (mut session, _clock) = session();

        assert!(matches!(
            session.peer_accepted(),
            Err(CoreError::UnexpectedSignal)
        ));
        assert!(matches!(session.end_call(), Err(CoreError::NotInCall)));
        assert!(matches!(session.toggle_mute(), Err(CoreError::NotInCall)));

        // A redelivered hangup while idle is a no-op.
        session.peer_hangup();
        assert!(session.is_idle());
    }

    #[test]
    fn in_call_controls() {
        let (mut session, _clock) = session();
        session
            .incoming_invite(Uuid::new_v4(), CallKind::Video)
            .unwrap();
        session.local_accept().unwrap();

        assert!(session.toggle_mute().unwrap());
        assert!(!session.toggle_mute().unwrap());
        assert!(!session.toggle_video().unwrap());

        // Controls reset when the session tears down.
        session.end_call().unwrap();
        session
            .incoming_invite(Uuid::new_v4(), CallKind::Video)
            .unwrap();
        session.local_accept().unwrap();
        if let CallState::Connected { muted, video_enabled, .. } = session.state() {
            assert!(!muted);
            assert!(video_enabled);
        } else {
            panic!("expected connected state");
        }
    }

    #[test]
    fn duration_tracks_synchronized_clock() {
        let (mut session, clock) = session();
        session
            .incoming_invite(Uuid::new_v4(), CallKind::Audio)
            .unwrap();
        session.local_accept().unwrap();

        clock.update_offset(Utc::now() + Duration::seconds(90));
        let duration = session.duration().unwrap();
        assert!(duration.num_seconds() >= 89, "duration {duration}");
    }
}
