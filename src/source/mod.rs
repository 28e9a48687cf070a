//! Frame source: the single owner of the camera device.
//!
//! Runs on a blocking thread. Each cycle it checks the streaming flag and
//! whether anyone is watching, reads one frame, compresses it and hands it to
//! the video fan-out. Read failures back off and, past a threshold, trigger
//! a reinitialization of the device.
//!
//! ```text
//! Uninitialized → Open → (ReadFailing)* → Reinitializing → Open
//!       └──────────→ Fatal (initial open failed)
//! ```

mod guard;
mod tracker;

pub use guard::DeviceGuard;
pub use tracker::{FailureTracker, FailureVerdict, ReconnectPolicy};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{Camera, CaptureConfig, EncodedFrame, RelayConfig};
use crate::metrics::RelayMetrics;
use crate::relay::Registry;

/// Errors that end the frame source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no capture backend could open device {device}: {}", .reasons.join("; "))]
    DeviceOpenFailure { device: u32, reasons: Vec<String> },
    #[error("frame source task failed: {0}")]
    Task(String),
}

/// Lifecycle of the frame source, published for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Uninitialized,
    Open,
    ReadFailing,
    Reinitializing,
    /// The device could not be opened at startup; the source has exited.
    Fatal,
    Stopped,
}

/// Requests sent to the frame source from the control surface.
#[derive(Debug)]
pub enum SourceCommand {
    /// Release and reopen the device now; replies with whether it reopened.
    Refresh(oneshot::Sender<bool>),
}

/// Timing knobs the acquisition loop needs.
#[derive(Debug, Clone)]
struct Cadence {
    frame_interval: Duration,
    paused_idle: Duration,
    no_viewer_idle: Duration,
}

/// Everything the acquisition loop needs besides the camera.
pub struct FrameSource {
    capture: CaptureConfig,
    policy: ReconnectPolicy,
    cadence: Cadence,
    streaming: Arc<AtomicBool>,
    viewers: Arc<Registry>,
    frames: mpsc::Sender<EncodedFrame>,
    commands: mpsc::Receiver<SourceCommand>,
    /// Command that woke an idle sleep, handled at the top of the next cycle.
    deferred: Option<SourceCommand>,
    commands_open: bool,
    state: watch::Sender<SourceState>,
    metrics: Arc<RelayMetrics>,
    cancel: CancellationToken,
}

impl FrameSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        capture: CaptureConfig,
        relay: &RelayConfig,
        streaming: Arc<AtomicBool>,
        viewers: Arc<Registry>,
        frames: mpsc::Sender<EncodedFrame>,
        commands: mpsc::Receiver<SourceCommand>,
        metrics: Arc<RelayMetrics>,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<SourceState>) {
        let (state, state_rx) = watch::channel(SourceState::Uninitialized);
        let source = Self {
            capture,
            policy: ReconnectPolicy::from(relay),
            cadence: Cadence {
                frame_interval: relay.video_interval(),
                paused_idle: relay.paused_idle(),
                no_viewer_idle: relay.no_viewer_idle(),
            },
            streaming,
            viewers,
            frames,
            commands,
            deferred: None,
            commands_open: true,
            state,
            metrics,
            cancel,
        };
        (source, state_rx)
    }

    /// Starts the loop on a blocking thread.
    ///
    /// The camera is built on that thread, since device handles are not
    /// necessarily `Send`.
    pub fn spawn<F>(self, make_camera: F) -> JoinHandle<Result<(), SourceError>>
    where
        F: FnOnce() -> Box<dyn Camera> + Send + 'static,
    {
        let runtime = Handle::current();
        tokio::task::spawn_blocking(move || self.run(make_camera(), runtime))
    }

    /// Runs the acquisition loop until cancelled.
    ///
    /// Returns `DeviceOpenFailure` only when the very first open fails.
    pub fn run(mut self, camera: Box<dyn Camera>, runtime: Handle) -> Result<(), SourceError> {
        let mut device = DeviceGuard::new(camera);

        if let Err(e) = device.open(&self.capture) {
            tracing::error!(error = %e, "Camera open failed, frame source exiting");
            self.set_state(SourceState::Fatal);
            return Err(e);
        }
        self.set_state(SourceState::Open);

        let mut tracker = FailureTracker::new(self.policy, Instant::now());

        while !self.cancel.is_cancelled() {
            self.handle_commands(&mut device, &mut tracker);

            if !self.streaming.load(Ordering::Acquire) {
                self.sleep(&runtime, self.cadence.paused_idle);
                continue;
            }

            if !self.viewers.has_subscribers() {
                self.sleep(&runtime, self.cadence.no_viewer_idle);
                continue;
            }

            let started = Instant::now();
            match device.read() {
                Ok(frame) => {
                    tracker.record_success();
                    self.set_state(SourceState::Open);
                    self.metrics.frame_captured();

                    match frame.encode_jpeg(self.capture.jpeg_quality) {
                        Ok(encoded) => self.hand_off(encoded),
                        Err(e) => tracing::warn!(error = %e, "Dropping frame that failed to encode"),
                    }

                    let remaining = self.cadence.frame_interval.saturating_sub(started.elapsed());
                    self.sleep(&runtime, remaining);
                }
                Err(e) => {
                    self.metrics.read_failed();
                    let verdict = tracker.record_failure(Instant::now());
                    tracing::warn!(
                        error = %e,
                        failures = verdict.failures,
                        threshold = self.policy.failure_threshold,
                        "Frame read failed"
                    );
                    self.set_state(SourceState::ReadFailing);

                    if verdict.reinit {
                        self.reinitialize(&mut device, &mut tracker, "read failures");
                    }
                    self.sleep(&runtime, verdict.backoff);
                }
            }
        }

        drop(device);
        self.set_state(SourceState::Stopped);
        tracing::info!("Frame source stopped");
        Ok(())
    }

    fn next_command(&mut self) -> Option<SourceCommand> {
        self.deferred.take().or_else(|| self.commands.try_recv().ok())
    }

    fn handle_commands(&mut self, device: &mut DeviceGuard, tracker: &mut FailureTracker) {
        while let Some(command) = self.next_command() {
            match command {
                SourceCommand::Refresh(reply) => {
                    let reopened = self.reinitialize(device, tracker, "refresh requested");
                    let _ = reply.send(reopened);
                }
            }
        }
    }

    fn reinitialize(
        &mut self,
        device: &mut DeviceGuard,
        tracker: &mut FailureTracker,
        cause: &'static str,
    ) -> bool {
        tracing::info!(cause, "Reinitializing camera");
        self.set_state(SourceState::Reinitializing);

        let reopened = match device.reopen(&self.capture) {
            Ok(_) => {
                tracker.reopened(Instant::now());
                self.set_state(SourceState::Open);
                tracing::info!(cause, "Camera reconnected");
                true
            }
            Err(e) => {
                self.set_state(SourceState::ReadFailing);
                tracing::error!(cause, error = %e, "Camera reconnect failed");
                false
            }
        };
        self.metrics.reinit_attempted(reopened);
        reopened
    }

    fn hand_off(&self, frame: EncodedFrame) {
        match self.frames.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                tracing::trace!(sequence = frame.sequence(), "Fan-out busy, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Video fan-out gone, frame discarded");
            }
        }
    }

    fn set_state(&self, state: SourceState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?state, "Frame source state");
            *current = state;
            true
        });
    }

    /// Sleeps on the runtime clock, waking early on cancellation or when a
    /// command arrives.
    fn sleep(&mut self, runtime: &Handle, duration: Duration) {
        if duration.is_zero() || self.deferred.is_some() {
            return;
        }
        let cancel = &self.cancel;
        let commands = &mut self.commands;
        let listen = self.commands_open;
        let woken_by = runtime.block_on(async move {
            tokio::select! {
                _ = cancel.cancelled() => None,
                command = commands.recv(), if listen => Some(command),
                _ = tokio::time::sleep(duration) => None,
            }
        });
        match woken_by {
            Some(Some(command)) => self.deferred = Some(command),
            // Control surface dropped; stop listening.
            Some(None) => self.commands_open = false,
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{MockCamera, MockProbe};
    use crate::relay::{ChannelKind, ConnectionId};

    struct Harness {
        streaming: Arc<AtomicBool>,
        viewers: Arc<Registry>,
        frames: mpsc::Receiver<EncodedFrame>,
        commands: mpsc::Sender<SourceCommand>,
        state: watch::Receiver<SourceState>,
        metrics: Arc<RelayMetrics>,
        cancel: CancellationToken,
        probe: Arc<MockProbe>,
        task: JoinHandle<Result<(), SourceError>>,
    }

    fn relay_config() -> RelayConfig {
        RelayConfig {
            video_interval_ms: 5,
            paused_idle_ms: 5,
            no_viewer_idle_ms: 5,
            backoff_step_ms: 1,
            max_backoff_ms: 5,
            failure_threshold: 3,
            reconnect_interval_ms: 0,
            ..Default::default()
        }
    }

    fn start(camera: MockCamera, relay: RelayConfig) -> Harness {
        let probe = camera.probe();
        let streaming = Arc::new(AtomicBool::new(true));
        let viewers = Arc::new(Registry::new(ChannelKind::Video, 4));
        let (frame_tx, frames) = mpsc::channel(1);
        let (commands, command_rx) = mpsc::channel(4);
        let metrics = Arc::new(RelayMetrics::new().unwrap());
        let cancel = CancellationToken::new();

        let (source, state) = FrameSource::new(
            CaptureConfig::with_dimensions(32, 24),
            &relay,
            Arc::clone(&streaming),
            Arc::clone(&viewers),
            frame_tx,
            command_rx,
            Arc::clone(&metrics),
            cancel.clone(),
        );
        let task = source.spawn(move || Box::new(camera) as Box<dyn Camera>);

        Harness {
            streaming,
            viewers,
            frames,
            commands,
            state,
            metrics,
            cancel,
            probe,
            task,
        }
    }

    fn add_viewer(registry: &Registry) -> crate::relay::Inbox {
        let id = ConnectionId::next();
        let now = tokio::time::Instant::now();
        registry.accept(id, now).unwrap();
        let (tx, rx) = crate::relay::mailbox();
        registry.promote(id, &mut Some(tx), now);
        rx
    }

    async fn wait_for_state(state: &mut watch::Receiver<SourceState>, wanted: SourceState) {
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached")
            .expect("source dropped");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_reads_without_viewers() {
        let h = start(MockCamera::new(), relay_config());
        let mut state = h.state.clone();
        wait_for_state(&mut state, SourceState::Open).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.probe.reads(), 0);

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
        assert_eq!(h.probe.closes(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_paused_does_not_touch_device() {
        let mut h = start(MockCamera::new(), relay_config());
        h.streaming.store(false, Ordering::Release);
        let _viewer = add_viewer(&h.viewers);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.probe.reads(), 0);

        h.streaming.store(true, Ordering::Release);
        let frame = tokio::time::timeout(Duration::from_secs(5), h.frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!frame.is_empty());

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reinit_after_threshold() {
        let camera = MockCamera::new();
        camera.probe().fail_next_reads(3);
        let mut h = start(camera, relay_config());
        let _viewer = add_viewer(&h.viewers);

        let frame = tokio::time::timeout(Duration::from_secs(5), h.frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!frame.is_empty());
        assert_eq!(h.metrics.reinit_attempts(), 1);
        assert_eq!(h.probe.opens(), 2);

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
        assert_eq!(h.probe.closes(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refresh_reopens_device() {
        let h = start(MockCamera::new(), relay_config());
        let mut state = h.state.clone();
        wait_for_state(&mut state, SourceState::Open).await;

        let (reply, answer) = oneshot::channel();
        h.commands.send(SourceCommand::Refresh(reply)).await.unwrap();
        assert!(answer.await.unwrap());
        assert_eq!(h.probe.opens(), 2);
        assert_eq!(h.probe.closes(), 1);

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
        assert_eq!(h.probe.closes(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refresh_wakes_paused_source() {
        let relay = RelayConfig {
            paused_idle_ms: 10_000,
            ..relay_config()
        };
        let h = start(MockCamera::new(), relay);
        h.streaming.store(false, Ordering::Release);
        let mut state = h.state.clone();
        wait_for_state(&mut state, SourceState::Open).await;
        // Let the source settle into its long paused sleep.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (reply, answer) = oneshot::channel();
        h.commands.send(SourceCommand::Refresh(reply)).await.unwrap();
        let reopened = tokio::time::timeout(Duration::from_secs(1), answer)
            .await
            .expect("refresh waited out the idle sleep")
            .unwrap();
        assert!(reopened);
        assert_eq!(h.probe.opens(), 2);

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_initial_open_failure_is_fatal() {
        let camera = MockCamera::new();
        camera.probe().fail_next_opens(2);
        let h = start(camera, relay_config());

        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(SourceError::DeviceOpenFailure { .. })));
        assert_eq!(*h.state.borrow(), SourceState::Fatal);
    }
}
