//! Subscriber side of the relay: admission, registries, fan-out, reaping.
//!
//! Two independent channels exist, video (binary JPEG frames) and meta
//! (JSON detection records). Each has its own [`Registry`] of pending and
//! active connections and its own fan-out loop. The [`Relay`] supervisor
//! wires them to the frame source and owns every background task.

pub mod admission;
pub mod detections;
pub mod fanout;
pub mod mailbox;
pub mod reaper;
pub mod registry;
mod supervisor;

pub use admission::{AdmissionAction, AdmissionEvent, AdmissionState, LIVENESS_TOKEN};
pub use detections::{Detection, DetectionSource, MetaMessage, StaticDetections};
pub use fanout::{BroadcastReport, BroadcastStats, FanOut};
pub use mailbox::{mailbox, Inbox, Mailbox};
pub use registry::{ConnectionId, Promotion, Registry, Slot};
pub use supervisor::{Relay, RelayHandle, StartError};

use std::sync::Arc;

use bytes::Bytes;

/// Which broadcast a connection subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Video,
    Meta,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Video => "video",
            ChannelKind::Meta => "meta",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the server ended a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Channel already at `max_connections`.
    CapacityExceeded,
    /// Never sent the liveness token in time.
    AdmissionTimeout,
    /// A socket write failed or exceeded its budget.
    SendFailed,
    /// Relay shutting down.
    Shutdown,
    /// The client disconnected; nothing to send.
    ClientGone,
}

impl CloseReason {
    /// WebSocket close code sent to the client.
    pub fn code(self) -> u16 {
        match self {
            CloseReason::CapacityExceeded => 1008,
            CloseReason::AdmissionTimeout => 4408,
            CloseReason::SendFailed => 1011,
            CloseReason::Shutdown => 1001,
            CloseReason::ClientGone => 1000,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            CloseReason::CapacityExceeded => "capacity exceeded",
            CloseReason::AdmissionTimeout => "admission timeout",
            CloseReason::SendFailed => "delivery failed",
            CloseReason::Shutdown => "server shutting down",
            CloseReason::ClientGone => "client disconnected",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// One broadcast payload; cloning shares the underlying buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Binary(Bytes),
    Text(Arc<str>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Binary(bytes) => bytes.len(),
            Payload::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
