//! Admission state machine for subscriber connections.
//!
//! Transport-independent: the WebSocket handler feeds it events and carries
//! out the returned action against the registry.
//!
//! ```text
//! NotAccepted --Accepted--> Pending --ping--> (Promote) --Promoted--> Active
//!                              |                                        |
//!                              +---- Rejected / TransportClosed -------+--> Closed
//! ```

use super::CloseReason;

/// Text a client sends to prove it is ready for broadcast traffic.
pub const LIVENESS_TOKEN: &str = "ping";

/// Where a connection stands in the admission protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    NotAccepted,
    Pending,
    Active,
    Closed(CloseReason),
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionEvent<'a> {
    /// Transport handshake finished.
    Accepted,
    /// Text message from the client.
    Message(&'a str),
    /// Registry confirmed the move into the active set.
    Promoted,
    /// A bounded receive wait elapsed with nothing inbound.
    ReceiveTimeout,
    /// Client went away or the transport failed.
    TransportClosed,
    /// Server-side close: capacity, reaper expiry, failed delivery, shutdown.
    Rejected(CloseReason),
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionAction {
    /// Insert into the pending map (capacity-checked).
    RegisterPending,
    /// Try to move from pending into active (capacity re-checked).
    Promote,
    /// Refresh the activity timestamp of an active connection.
    Touch,
    /// Send a close frame with this reason, then drop the connection.
    Close(CloseReason),
    /// Drop the connection from the registry; no frame is sent.
    Remove,
    None,
}

impl AdmissionState {
    pub fn is_closed(self) -> bool {
        matches!(self, AdmissionState::Closed(_))
    }

    pub fn is_active(self) -> bool {
        self == AdmissionState::Active
    }

    /// Applies one event and returns the next state and the action to take.
    pub fn on_event(self, event: AdmissionEvent<'_>) -> (AdmissionState, AdmissionAction) {
        use AdmissionAction as A;
        use AdmissionEvent as E;
        use AdmissionState as S;

        match (self, event) {
            (S::Closed(reason), _) => (S::Closed(reason), A::None),

            (_, E::TransportClosed) => (S::Closed(CloseReason::ClientGone), A::Remove),
            (_, E::Rejected(reason)) => (S::Closed(reason), A::Close(reason)),

            (S::NotAccepted, E::Accepted) => (S::Pending, A::RegisterPending),
            (S::NotAccepted, _) => (S::NotAccepted, A::None),

            (S::Pending, E::Message(text)) if is_liveness(text) => (S::Pending, A::Promote),
            (S::Pending, E::Promoted) => (S::Active, A::None),

            (S::Active, E::Message(text)) if is_liveness(text) => (S::Active, A::Touch),

            // Timeouts, stray text, duplicate accepts: stay put
            (state, _) => (state, A::None),
        }
    }
}

/// Only the exact token counts; no surrounding whitespace or case folding.
fn is_liveness(text: &str) -> bool {
    text == LIVENESS_TOKEN
}
