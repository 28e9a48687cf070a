//! Periodic expiry of connections that never finish admission.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::registry::Registry;
use crate::metrics::RelayMetrics;

/// Sweeps every `period`, closing pending connections older than `timeout`.
///
/// Active connections are never touched.
pub async fn run_reaper(
    registries: Vec<Arc<Registry>>,
    period: Duration,
    timeout: Duration,
    metrics: Arc<RelayMetrics>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        for registry in &registries {
            let expired = registry.expire_pending(now, timeout);
            if !expired.is_empty() {
                tracing::info!(
                    channel = %registry.kind(),
                    count = expired.len(),
                    "Reaped pending connections"
                );
                metrics.reaped(registry.kind(), expired.len());
            }
        }
    }
    tracing::debug!("Reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::registry::ConnectionId;
    use crate::relay::{ChannelKind, CloseReason};
    use crate::relay::mailbox;

    #[tokio::test(start_paused = true)]
    async fn test_pending_closed_within_timeout_plus_period() {
        let video = Arc::new(Registry::new(ChannelKind::Video, 4));
        let meta = Arc::new(Registry::new(ChannelKind::Meta, 4));
        let cancel = CancellationToken::new();

        let period = Duration::from_secs(5);
        let timeout = Duration::from_secs(10);
        let task = tokio::spawn(run_reaper(
            vec![Arc::clone(&video), Arc::clone(&meta)],
            period,
            timeout,
            Arc::new(RelayMetrics::new().unwrap()),
            cancel.clone(),
        ));

        let accepted_at = Instant::now();
        let silent = ConnectionId::next();
        let mut closed = video.accept(silent, accepted_at).unwrap();

        let admitted = ConnectionId::next();
        meta.accept(admitted, accepted_at).unwrap();
        let (tx, _rx) = mailbox();
        meta.promote(admitted, &mut Some(tx), accepted_at);

        let reason = (&mut closed).await.unwrap();
        assert_eq!(reason, CloseReason::AdmissionTimeout);
        assert!(accepted_at.elapsed() <= timeout + period);
        assert!(accepted_at.elapsed() > timeout);
        assert!(!video.is_pending(silent));
        assert!(meta.is_active(admitted));

        cancel.cancel();
        task.await.unwrap();
    }
}
