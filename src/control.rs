//! Play, pause and refresh operations exposed to callers.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::settings::SettingsStore;
use crate::source::SourceCommand;

/// How long a refresh waits for the frame source to reopen the device.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// Streaming actions accepted by `/control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Play,
    Pause,
}

impl FromStr for ControlAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "play" => Ok(ControlAction::Play),
            "pause" => Ok(ControlAction::Pause),
            _ => Err(()),
        }
    }
}

/// Body returned by the control endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
}

impl ControlResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Handle for mutating relay state from the outside.
///
/// The streaming flag is only ever written here.
#[derive(Clone)]
pub struct RelayControl {
    streaming: Arc<AtomicBool>,
    commands: mpsc::Sender<SourceCommand>,
    settings: Arc<dyn SettingsStore>,
    refresh_timeout: Duration,
}

impl RelayControl {
    pub fn new(
        streaming: Arc<AtomicBool>,
        commands: mpsc::Sender<SourceCommand>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            streaming,
            commands,
            settings,
            refresh_timeout: REFRESH_TIMEOUT,
        }
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub async fn play(&self) -> ControlResponse {
        self.set_streaming(true).await;
        ControlResponse::ok("video stream play succeeded")
    }

    pub async fn pause(&self) -> ControlResponse {
        self.set_streaming(false).await;
        ControlResponse::ok("video stream pause succeeded")
    }

    /// Dispatches a textual action; unknown actions change nothing.
    pub async fn apply(&self, action: &str) -> ControlResponse {
        match action.parse::<ControlAction>() {
            Ok(ControlAction::Play) => self.play().await,
            Ok(ControlAction::Pause) => self.pause().await,
            Err(()) => {
                tracing::warn!(action, "Unknown control action");
                ControlResponse::failed(format!("video stream {action} failed: unknown action"))
            }
        }
    }

    /// Asks the frame source to release and reopen the camera now.
    pub async fn refresh(&self) -> ControlResponse {
        let (reply, answer) = oneshot::channel();
        if self.commands.send(SourceCommand::Refresh(reply)).await.is_err() {
            return ControlResponse::failed("video stream refresh failed: frame source not running");
        }

        match tokio::time::timeout(self.refresh_timeout, answer).await {
            Ok(Ok(true)) => ControlResponse::ok("video stream refresh succeeded"),
            Ok(Ok(false)) => ControlResponse::failed("video stream refresh failed: camera did not reopen"),
            Ok(Err(_)) => ControlResponse::failed("video stream refresh failed: frame source stopped"),
            Err(_) => ControlResponse::failed("video stream refresh failed: timed out"),
        }
    }

    /// Flips the flag immediately; the settings file is written on the
    /// blocking pool.
    async fn set_streaming(&self, enabled: bool) {
        let previous = self.streaming.swap(enabled, Ordering::AcqRel);
        if previous == enabled {
            return;
        }
        tracing::info!(streaming = enabled, "Streaming flag changed");

        let settings = Arc::clone(&self.settings);
        let streaming = Arc::clone(&self.streaming);
        // Writes the flag as it is when the write runs, so the last toggle wins.
        let persisted = tokio::task::spawn_blocking(move || {
            settings.set_streaming_enabled(streaming.load(Ordering::Acquire))
        })
        .await;
        match persisted {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to persist streaming flag"),
            Err(e) => tracing::warn!(error = %e, "Settings write task failed"),
        }
    }
}
