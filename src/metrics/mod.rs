//! Prometheus metrics for the relay.
//!
//! # Metrics Exposed
//!
//! ## Frame Source
//! - `truck_relay_frames_captured_total` - Frames read and encoded
//! - `truck_relay_read_failures_total` - Failed camera reads
//! - `truck_relay_reinit_attempts_total` - Device reinitialization attempts
//! - `truck_relay_reinit_successes_total` - Successful reinitializations
//! - `truck_relay_streaming` - Streaming flag (1=playing, 0=paused)
//!
//! ## Fan-out and Admission (labelled by `channel`)
//! - `truck_relay_broadcasts_total` - Payloads fanned out
//! - `truck_relay_send_failures_total` - Subscribers dropped on failed sends
//! - `truck_relay_active_subscribers` - Admitted subscribers
//! - `truck_relay_pending_connections` - Connections awaiting admission
//! - `truck_relay_capacity_rejections_total` - Connections refused at capacity
//! - `truck_relay_reaped_connections_total` - Pending connections expired
//!
//! Counters are bumped where the event happens; subscriber gauges are
//! refreshed from a [`MetricsSnapshot`] each time `/metrics` is scraped.

mod collector;

pub use collector::{MetricsError, MetricsSnapshot, RelayMetrics};
