//! Event plumbing towards the two external collaborators.
//!
//! The transport receives [`Outbound`] envelopes to put on the wire; the
//! UI receives [`UiEvent`] notifications and re-reads its projections.
//! Both flow over unbounded mpsc channels so no service call ever blocks
//! on a slow consumer.

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use sotto_shared::protocol::WireMessage;
use sotto_store::DeliveryStatus;

/// A wire message addressed to a peer, handed to the transport.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: Uuid,
    pub message: WireMessage,
}

/// Notifications for the UI collaborator.  Payloads carry ids rather than
/// full records; the UI re-queries the projection it cares about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UiEvent {
    ConversationUpdated { conversation_id: Uuid },
    MessageStatusChanged { msg_id: Uuid, status: DeliveryStatus },
    FriendUpdated { peer_id: Uuid },
    CallStateChanged { state: String },
    ClockDrifted { offset_ms: i64 },
}

/// Sender half used by the services.
#[derive(Clone)]
pub struct EventSink {
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    ui_tx: mpsc::UnboundedSender<UiEvent>,
}

impl EventSink {
    /// Create the sink plus the receiver halves for the two collaborators.
    pub fn channel() -> (
        Self,
        mpsc::UnboundedReceiver<Outbound>,
        mpsc::UnboundedReceiver<UiEvent>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        (Self { outbound_tx, ui_tx }, outbound_rx, ui_rx)
    }

    pub fn send_wire(&self, to: Uuid, message: WireMessage) {
        if self.outbound_tx.send(Outbound { to, message }).is_err() {
            tracing::warn!(peer = %to, "transport receiver dropped; outbound message lost");
        }
    }

    pub fn notify(&self, event: UiEvent) {
        if self.ui_tx.send(event).is_err() {
            tracing::debug!("ui receiver dropped; notification skipped");
        }
    }
}
