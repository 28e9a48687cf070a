//! Metrics collection and registry.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use crate::relay::ChannelKind;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Point-in-time view of the gauges that are read on scrape.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Whether the streaming flag is on.
    pub streaming: bool,
    /// Active video subscribers.
    pub video_active: usize,
    /// Video connections waiting for admission.
    pub video_pending: usize,
    /// Active metadata subscribers.
    pub meta_active: usize,
    /// Metadata connections waiting for admission.
    pub meta_pending: usize,
}

/// Prometheus metrics for the relay.
pub struct RelayMetrics {
    registry: Registry,

    // Frame source
    frames_captured: IntCounter,
    read_failures: IntCounter,
    reinit_attempts: IntCounter,
    reinit_successes: IntCounter,
    streaming: IntGauge,

    // Fan-out
    broadcasts: IntCounterVec,
    send_failures: IntCounterVec,

    // Admission
    active_subscribers: IntGaugeVec,
    pending_connections: IntGaugeVec,
    capacity_rejections: IntCounterVec,
    reaped_connections: IntCounterVec,
}

impl RelayMetrics {
    /// Creates a new metrics registry with all relay metrics registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let frames_captured = IntCounter::new(
            "truck_relay_frames_captured_total",
            "Frames read from the camera and encoded",
        )?;
        let read_failures = IntCounter::new(
            "truck_relay_read_failures_total",
            "Failed camera reads",
        )?;
        let reinit_attempts = IntCounter::new(
            "truck_relay_reinit_attempts_total",
            "Camera reinitialization attempts (failure-driven and refresh)",
        )?;
        let reinit_successes = IntCounter::new(
            "truck_relay_reinit_successes_total",
            "Camera reinitializations that reopened the device",
        )?;
        let streaming = IntGauge::new(
            "truck_relay_streaming",
            "Streaming flag (1=playing, 0=paused)",
        )?;

        let broadcasts = IntCounterVec::new(
            Opts::new("truck_relay_broadcasts_total", "Payloads fanned out per channel"),
            &["channel"],
        )?;
        let send_failures = IntCounterVec::new(
            Opts::new(
                "truck_relay_send_failures_total",
                "Subscribers removed after a failed or timed-out send",
            ),
            &["channel"],
        )?;
        let active_subscribers = IntGaugeVec::new(
            Opts::new("truck_relay_active_subscribers", "Admitted subscribers per channel"),
            &["channel"],
        )?;
        let pending_connections = IntGaugeVec::new(
            Opts::new(
                "truck_relay_pending_connections",
                "Connections waiting for the liveness token",
            ),
            &["channel"],
        )?;
        let capacity_rejections = IntCounterVec::new(
            Opts::new(
                "truck_relay_capacity_rejections_total",
                "Connections refused because the channel was full",
            ),
            &["channel"],
        )?;
        let reaped_connections = IntCounterVec::new(
            Opts::new(
                "truck_relay_reaped_connections_total",
                "Pending connections closed for never completing admission",
            ),
            &["channel"],
        )?;

        registry.register(Box::new(frames_captured.clone()))?;
        registry.register(Box::new(read_failures.clone()))?;
        registry.register(Box::new(reinit_attempts.clone()))?;
        registry.register(Box::new(reinit_successes.clone()))?;
        registry.register(Box::new(streaming.clone()))?;
        registry.register(Box::new(broadcasts.clone()))?;
        registry.register(Box::new(send_failures.clone()))?;
        registry.register(Box::new(active_subscribers.clone()))?;
        registry.register(Box::new(pending_connections.clone()))?;
        registry.register(Box::new(capacity_rejections.clone()))?;
        registry.register(Box::new(reaped_connections.clone()))?;

        Ok(Self {
            registry,
            frames_captured,
            read_failures,
            reinit_attempts,
            reinit_successes,
            streaming,
            broadcasts,
            send_failures,
            active_subscribers,
            pending_connections,
            capacity_rejections,
            reaped_connections,
        })
    }

    pub fn frame_captured(&self) {
        self.frames_captured.inc();
    }

    pub fn read_failed(&self) {
        self.read_failures.inc();
    }

    pub fn reinit_attempted(&self, success: bool) {
        self.reinit_attempts.inc();
        if success {
            self.reinit_successes.inc();
        }
    }

    pub fn broadcast(&self, channel: ChannelKind) {
        self.broadcasts.with_label_values(&[channel.as_str()]).inc();
    }

    pub fn send_failed(&self, channel: ChannelKind, count: usize) {
        self.send_failures
            .with_label_values(&[channel.as_str()])
            .inc_by(count as u64);
    }

    pub fn capacity_rejected(&self, channel: ChannelKind) {
        self.capacity_rejections
            .with_label_values(&[channel.as_str()])
            .inc();
    }

    pub fn reaped(&self, channel: ChannelKind, count: usize) {
        self.reaped_connections
            .with_label_values(&[channel.as_str()])
            .inc_by(count as u64);
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.get()
    }

    pub fn reinit_attempts(&self) -> u64 {
        self.reinit_attempts.get()
    }

    /// Updates the scrape-time gauges from a snapshot.
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        self.streaming.set(i64::from(snapshot.streaming));
        for (channel, active, pending) in [
            (ChannelKind::Video, snapshot.video_active, snapshot.video_pending),
            (ChannelKind::Meta, snapshot.meta_active, snapshot.meta_pending),
        ] {
            self.active_subscribers
                .with_label_values(&[channel.as_str()])
                .set(active as i64);
            self.pending_connections
                .with_label_values(&[channel.as_str()])
                .set(pending as i64);
        }
    }

    /// Returns the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
