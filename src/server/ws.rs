//! Per-connection driver for the `/ws/video` and `/ws/meta` endpoints.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::time::{timeout, Instant};

use crate::relay::{
    mailbox, AdmissionAction, AdmissionEvent, AdmissionState, ChannelKind, CloseReason,
    ConnectionId, Payload, Promotion, RelayHandle,
};

type WsSink = SplitSink<WebSocket, Message>;

/// Runs one subscriber from handshake to close.
///
/// The socket is only written from this task: the latest broadcast payload,
/// and the close frame when the registry or the state machine ends the
/// connection. Each write gets the send budget, at most one frame interval.
pub(crate) async fn serve_subscriber(socket: WebSocket, kind: ChannelKind, relay: RelayHandle) {
    let registry = Arc::clone(relay.registry(kind));
    let id = ConnectionId::next();
    let send_timeout = relay.config.send_timeout();
    let receive_timeout = relay.config.receive_timeout();
    let (mut sink, mut stream) = socket.split();

    let (mut state, _) = AdmissionState::NotAccepted.on_event(AdmissionEvent::Accepted);
    let mut closed = match registry.accept(id, Instant::now()) {
        Ok(closed) => closed,
        Err(reason) => {
            relay.metrics.capacity_rejected(kind);
            send_close(&mut sink, reason, send_timeout).await;
            return;
        }
    };

    let (outbound_tx, mut outbound) = mailbox();
    let mut outbound_tx = Some(outbound_tx);
    tracing::debug!(channel = %kind, connection_id = %id, "Subscriber connected");

    loop {
        let action = tokio::select! {
            biased;

            reason = &mut closed => {
                let reason = reason.unwrap_or(CloseReason::Shutdown);
                apply(&mut state, AdmissionEvent::Rejected(reason))
            }

            payload = outbound.recv(), if state.is_active() => match payload {
                Some(payload) => {
                    if write(&mut sink, payload, send_timeout).await {
                        AdmissionAction::None
                    } else {
                        relay.metrics.send_failed(kind, 1);
                        apply(&mut state, AdmissionEvent::Rejected(CloseReason::SendFailed))
                    }
                }
                // Evicted: the registry dropped our mailbox and left a reason.
                None => {
                    let reason = closed.try_recv().unwrap_or(CloseReason::SendFailed);
                    apply(&mut state, AdmissionEvent::Rejected(reason))
                }
            },

            inbound = timeout(receive_timeout, stream.next()) => match inbound {
                Err(_) => apply(&mut state, AdmissionEvent::ReceiveTimeout),
                Ok(Some(Ok(Message::Text(text)))) => apply(&mut state, AdmissionEvent::Message(&text)),
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                    apply(&mut state, AdmissionEvent::TransportClosed)
                }
                Ok(Some(Err(e))) => {
                    tracing::debug!(channel = %kind, connection_id = %id, error = %e, "Receive failed");
                    apply(&mut state, AdmissionEvent::TransportClosed)
                }
                Ok(Some(Ok(_))) => AdmissionAction::None,
            },
        };

        match action {
            AdmissionAction::Promote => match registry.promote(id, &mut outbound_tx, Instant::now()) {
                Promotion::Promoted => {
                    apply(&mut state, AdmissionEvent::Promoted);
                }
                Promotion::CapacityExceeded => relay.metrics.capacity_rejected(kind),
                // The reaper or a shutdown got there first; its reason is queued.
                Promotion::AlreadyActive | Promotion::Unknown => {}
            },
            AdmissionAction::Touch => {
                registry.touch(id, Instant::now());
            }
            AdmissionAction::Close(reason) => {
                send_close(&mut sink, reason, send_timeout).await;
                break;
            }
            AdmissionAction::Remove => break,
            AdmissionAction::RegisterPending | AdmissionAction::None => {}
        }

        if state.is_closed() {
            break;
        }
    }

    registry.remove(id);
    tracing::debug!(channel = %kind, connection_id = %id, state = ?state, "Subscriber disconnected");
}

fn apply(state: &mut AdmissionState, event: AdmissionEvent<'_>) -> AdmissionAction {
    let (next, action) = state.on_event(event);
    *state = next;
    action
}

/// Writes one payload; false when the socket failed or stalled.
async fn write(sink: &mut WsSink, payload: Payload, budget: Duration) -> bool {
    let message = match payload {
        Payload::Binary(bytes) => Message::Binary(bytes.to_vec()),
        Payload::Text(text) => Message::Text(text.to_string()),
    };
    matches!(timeout(budget, sink.send(message)).await, Ok(Ok(())))
}

async fn send_close(sink: &mut WsSink, reason: CloseReason, budget: Duration) {
    let frame = CloseFrame {
        code: reason.code(),
        reason: Cow::Borrowed(reason.description()),
    };
    if timeout(budget, sink.send(Message::Close(Some(frame)))).await.is_err() {
        tracing::debug!(%reason, "Close frame not delivered");
    }
}
