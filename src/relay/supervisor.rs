//! Startup and shutdown of the relay's background tasks.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::detections::DetectionSource;
use super::fanout::{run_meta, run_video, BroadcastStats, FanOut};
use super::reaper::run_reaper;
use super::registry::Registry;
use super::{ChannelKind, CloseReason};
use crate::capture::{Camera, CaptureConfig, ConfigError, RelayConfig};
use crate::control::RelayControl;
use crate::metrics::{MetricsError, MetricsSnapshot, RelayMetrics};
use crate::settings::SettingsStore;
use crate::source::{FrameSource, SourceError, SourceState};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct RelayHandle {
    pub video: Arc<Registry>,
    pub meta: Arc<Registry>,
    pub control: RelayControl,
    pub metrics: Arc<RelayMetrics>,
    pub source_state: watch::Receiver<SourceState>,
    pub video_stats: Arc<BroadcastStats>,
    pub meta_stats: Arc<BroadcastStats>,
    pub config: RelayConfig,
    pub cancel: CancellationToken,
}

impl RelayHandle {
    /// Registry for the given channel.
    pub fn registry(&self, kind: ChannelKind) -> &Arc<Registry> {
        match kind {
            ChannelKind::Video => &self.video,
            ChannelKind::Meta => &self.meta,
        }
    }

    pub fn source_state(&self) -> SourceState {
        *self.source_state.borrow()
    }

    /// Current gauge values, as pushed into the metrics on scrape.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            streaming: self.control.is_streaming(),
            video_active: self.video.active_len(),
            video_pending: self.video.pending_len(),
            meta_active: self.meta.active_len(),
            meta_pending: self.meta.pending_len(),
        }
    }
}

/// Errors raised while starting the relay.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("metrics setup failed: {0}")]
    Metrics(#[from] MetricsError),
}

/// Owner of the frame source, fan-out loops and reaper.
pub struct Relay {
    handle: RelayHandle,
    source: Option<JoinHandle<Result<(), SourceError>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Spawns every background task on the current runtime.
    ///
    /// The initial streaming flag and the device index come from `settings`.
    pub fn start<F>(
        mut capture: CaptureConfig,
        relay: RelayConfig,
        settings: Arc<dyn SettingsStore>,
        make_camera: F,
        detections: Box<dyn DetectionSource>,
    ) -> Result<Self, StartError>
    where
        F: FnOnce() -> Box<dyn Camera> + Send + 'static,
    {
        capture.device_index = settings.device_index();
        capture.validate()?;
        relay.validate()?;

        let metrics = Arc::new(RelayMetrics::new()?);
        let cancel = CancellationToken::new();
        let streaming = Arc::new(AtomicBool::new(settings.streaming_enabled()));

        let video = Arc::new(Registry::new(ChannelKind::Video, relay.max_connections));
        let meta = Arc::new(Registry::new(ChannelKind::Meta, relay.max_connections));

        // Capacity 1: a frame the fan-out cannot take yet is dropped.
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let (command_tx, command_rx) = mpsc::channel(4);

        tracing::info!(
            device = capture.device_index,
            streaming = settings.streaming_enabled(),
            max_connections = relay.max_connections,
            "Starting relay"
        );

        let (source, source_state) = FrameSource::new(
            capture,
            &relay,
            Arc::clone(&streaming),
            Arc::clone(&video),
            frame_tx,
            command_rx,
            Arc::clone(&metrics),
            cancel.clone(),
        );
        let source = source.spawn(make_camera);

        let video_fanout = FanOut::new(Arc::clone(&video), Arc::clone(&metrics));
        let meta_fanout = FanOut::new(Arc::clone(&meta), Arc::clone(&metrics));
        let video_stats = video_fanout.stats();
        let meta_stats = meta_fanout.stats();

        let tasks = vec![
            tokio::spawn(run_video(video_fanout, frame_rx, cancel.clone())),
            tokio::spawn(run_meta(
                meta_fanout,
                detections,
                relay.meta_interval(),
                relay.no_viewer_idle(),
                cancel.clone(),
            )),
            tokio::spawn(run_reaper(
                vec![Arc::clone(&video), Arc::clone(&meta)],
                relay.reaper_period(),
                relay.connection_timeout(),
                Arc::clone(&metrics),
                cancel.clone(),
            )),
        ];

        let control = RelayControl::new(streaming, command_tx, settings);

        Ok(Self {
            handle: RelayHandle {
                video,
                meta,
                control,
                metrics,
                source_state,
                video_stats,
                meta_stats,
                config: relay,
                cancel,
            },
            source: Some(source),
            tasks,
        })
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Token that stops every relay task when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.handle.cancel.clone()
    }

    /// Waits for the frame source to exit.
    ///
    /// Cancel-safe: dropping the future leaves the task in place for
    /// [`Relay::shutdown`].
    pub async fn wait_source(&mut self) -> Result<(), SourceError> {
        let Some(task) = self.source.as_mut() else {
            return Ok(());
        };
        let result = task.await;
        self.source = None;
        result.map_err(|e| SourceError::Task(e.to_string()))?
    }

    /// Stops every task and closes all connections with a shutdown code.
    pub async fn shutdown(mut self) -> Result<(), SourceError> {
        tracing::info!("Shutting down relay");
        self.handle.cancel.cancel();
        self.handle.video.close_all(CloseReason::Shutdown);
        self.handle.meta.close_all(CloseReason::Shutdown);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Relay task ended abnormally");
            }
        }
        self.wait_source().await
    }
}
