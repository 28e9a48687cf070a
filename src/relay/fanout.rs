//! One-to-many delivery of payloads to a channel's active subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::detections::{DetectionSource, MetaMessage};
use super::registry::{ConnectionId, Registry};
use super::{CloseReason, Payload};
use crate::capture::EncodedFrame;
use crate::metrics::RelayMetrics;

/// Outcome of one broadcast pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers whose mailbox now holds the payload.
    pub delivered: usize,
    /// Subscribers removed because their connection had already gone.
    pub dropped: Vec<ConnectionId>,
}

/// Counters surfaced on `/status`.
#[derive(Debug, Default)]
pub struct BroadcastStats {
    broadcasts: AtomicU64,
    last_at: Mutex<Option<DateTime<Utc>>>,
}

impl BroadcastStats {
    fn record(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last_at.lock().unwrap_or_else(|p| p.into_inner());
        *last = Some(Utc::now());
    }

    pub fn broadcasts(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }

    pub fn last_at(&self) -> Option<DateTime<Utc>> {
        *self.last_at.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Broadcaster for a single channel.
#[derive(Clone)]
pub struct FanOut {
    registry: Arc<Registry>,
    metrics: Arc<RelayMetrics>,
    stats: Arc<BroadcastStats>,
}

impl FanOut {
    pub fn new(registry: Arc<Registry>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            registry,
            metrics,
            stats: Arc::new(BroadcastStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stats(&self) -> Arc<BroadcastStats> {
        Arc::clone(&self.stats)
    }

    /// Delivers `payload` to every active subscriber without waiting.
    ///
    /// Each subscriber holds only the newest payload; one that has not taken
    /// the previous payload yet sees it replaced. Slow sockets are bounded by
    /// the write budget of their own connection task, never here.
    pub fn broadcast(&self, payload: Payload) -> BroadcastReport {
        let targets = self.registry.snapshot_active();
        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let mut report = BroadcastReport::default();
        for (id, mailbox) in targets {
            if mailbox.put(payload.clone()) {
                report.delivered += 1;
            } else {
                tracing::debug!(
                    channel = %self.registry.kind(),
                    connection_id = %id,
                    "Subscriber gone during broadcast"
                );
                report.dropped.push(id);
            }
        }

        if !report.dropped.is_empty() {
            let evicted = self.registry.evict(&report.dropped, CloseReason::SendFailed);
            self.metrics.send_failed(self.registry.kind(), evicted);
        }
        self.metrics.broadcast(self.registry.kind());
        self.stats.record();
        report
    }
}

/// Forwards every encoded frame from the frame source to video subscribers.
///
/// Runs until cancelled or until the frame source hangs up.
pub async fn run_video(
    fanout: FanOut,
    mut frames: mpsc::Receiver<EncodedFrame>,
    cancel: CancellationToken,
) {
    tracing::info!("Video fan-out started");
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else {
            tracing::info!("Frame source closed, video fan-out stopping");
            break;
        };
        let sequence = frame.sequence();
        let report = fanout.broadcast(Payload::Binary(frame.into_bytes()));
        tracing::trace!(
            sequence,
            delivered = report.delivered,
            dropped = report.dropped.len(),
            "Frame broadcast"
        );
    }
    tracing::info!("Video fan-out stopped");
}

/// Polls the detection source and broadcasts metadata while anyone listens.
pub async fn run_meta(
    fanout: FanOut,
    mut detections: Box<dyn DetectionSource>,
    interval: Duration,
    idle: Duration,
    cancel: CancellationToken,
) {
    tracing::info!("Metadata fan-out started");
    loop {
        let wait = if fanout.registry().has_subscribers() {
            let message = MetaMessage::Detections {
                detections: detections.poll(),
            };
            match message.to_json() {
                Ok(json) => {
                    fanout.broadcast(Payload::Text(json.into()));
                }
                Err(e) => tracing::error!(error = %e, "Failed to serialize detections"),
            }
            interval
        } else {
            idle
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    tracing::info!("Metadata fan-out stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::detections::StaticDetections;
    use crate::relay::mailbox::{mailbox, Inbox};
    use crate::relay::ChannelKind;
    use bytes::Bytes;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    fn fanout(max: usize) -> FanOut {
        let registry = Arc::new(Registry::new(ChannelKind::Video, max));
        FanOut::new(registry, Arc::new(RelayMetrics::new().unwrap()))
    }

    fn subscribe(fanout: &FanOut) -> (ConnectionId, Inbox) {
        let id = ConnectionId::next();
        let now = Instant::now();
        fanout.registry().accept(id, now).unwrap();
        let (tx, rx) = mailbox();
        fanout.registry().promote(id, &mut Some(tx), now);
        (id, rx)
    }

    fn frame(n: u8) -> Payload {
        Payload::Binary(Bytes::from(vec![n; 16]))
    }

    fn first_byte(payload: Payload) -> u8 {
        match payload {
            Payload::Binary(bytes) => bytes[0],
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_readers_that_keep_up_get_every_frame_in_order() {
        let fanout = fanout(5);
        let mut subscribers: Vec<_> = (0..5).map(|_| subscribe(&fanout)).collect();

        for n in 0..10u8 {
            let report = fanout.broadcast(frame(n));
            assert_eq!(report.delivered, 5);
            for (_, rx) in subscribers.iter_mut() {
                assert_eq!(first_byte(rx.recv().await.unwrap()), n);
            }
        }
        assert_eq!(fanout.stats().broadcasts(), 10);
    }

    #[test]
    fn test_unread_subscriber_holds_only_latest() {
        let fanout = fanout(2);
        let (_id, mut rx) = subscribe(&fanout);

        for n in 0..4u8 {
            fanout.broadcast(frame(n));
        }

        assert_eq!(rx.try_recv().map(first_byte), Some(3));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_subscriber_removed_in_same_pass() {
        let fanout = fanout(4);
        let (alive, mut alive_rx) = subscribe(&fanout);
        let (dead, dead_rx) = subscribe(&fanout);
        drop(dead_rx);

        let report = fanout.broadcast(frame(1));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, vec![dead]);
        assert!(!fanout.registry().is_active(dead));
        assert!(fanout.registry().is_active(alive));
        assert!(alive_rx.try_recv().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reader_does_not_throttle_fast_reader() {
        let fanout = fanout(4);
        let (_fast, mut fast_rx) = subscribe(&fanout);
        let (slow, mut slow_rx) = subscribe(&fanout);

        let fast_count = Arc::new(AtomicU32::new(0));
        let fast = tokio::spawn({
            let fast_count = Arc::clone(&fast_count);
            async move {
                while fast_rx.recv().await.is_some() {
                    fast_count.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        // Takes one payload every 200 ms, i.e. 5 per second.
        let slow_reader = tokio::spawn(async move {
            let mut taken = 0u32;
            for _ in 0..15 {
                tokio::time::sleep(Duration::from_millis(200)).await;
                if slow_rx.try_recv().is_some() {
                    taken += 1;
                }
            }
            (taken, slow_rx)
        });

        let started = Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_millis(33));
        let mut passes = 0u32;
        while started.elapsed() < Duration::from_secs(3) {
            ticker.tick().await;
            let report = fanout.broadcast(frame(passes as u8));
            assert_eq!(report.delivered, 2);
            passes += 1;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(passes >= 90, "only {passes} passes in 3s");
        let received = fast_count.load(Ordering::Relaxed);
        assert!(received + 2 >= passes, "fast reader got {received} of {passes}");

        let (taken, _slow_rx) = slow_reader.await.unwrap();
        assert!(taken >= 14);
        assert!(fanout.registry().is_active(slow));
        fast.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_meta_loop_idles_without_subscribers() {
        let fanout = fanout(2);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_meta(
            fanout.clone(),
            Box::new(StaticDetections::default()),
            Duration::from_millis(100),
            Duration::from_millis(500),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fanout.stats().broadcasts(), 0);

        let (_id, mut rx) = subscribe(&fanout);
        let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match payload {
            Payload::Text(text) => assert!(text.contains("\"type\":\"detections\"")),
            other => panic!("unexpected payload {other:?}"),
        }

        cancel.cancel();
        task.await.unwrap();
    }
}
