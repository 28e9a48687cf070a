//! Camera abstraction for frame capture.
//!
//! This module provides a trait-based abstraction over camera hardware,
//! allowing for both real camera input and mock implementations for testing.

use super::{CaptureConfig, Frame, PixelFormat};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera device not found: {0}")]
    DeviceNotFound(String),
    #[error("failed to open camera via {backend}: {reason}")]
    OpenFailed {
        backend: CaptureBackend,
        reason: String,
    },
    #[error("failed to configure camera: {0}")]
    ConfigFailed(String),
    #[error("failed to capture frame: {0}")]
    CaptureFailed(String),
    #[error("camera not initialized")]
    NotInitialized,
}

/// Capture API used to talk to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureBackend {
    /// Video4Linux2, the hardware path on the station's Linux boxes.
    V4l2,
    /// Media Foundation on Windows.
    MediaFoundation,
    /// AVFoundation on macOS.
    AvFoundation,
    /// Let the platform layer choose.
    Auto,
}

impl std::fmt::Display for CaptureBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CaptureBackend::V4l2 => "v4l2",
            CaptureBackend::MediaFoundation => "media_foundation",
            CaptureBackend::AvFoundation => "av_foundation",
            CaptureBackend::Auto => "auto",
        };
        f.write_str(name)
    }
}

/// Trait for camera implementations.
///
/// A camera may be opened, closed and opened again; the frame source relies
/// on this to reinitialize a degraded device.
pub trait Camera {
    /// Opens the device through one specific backend and applies resolution.
    fn open(&mut self, backend: CaptureBackend, config: &CaptureConfig) -> Result<(), CameraError>;

    /// Sets the internal buffer depth. Backends without the knob ignore it.
    fn set_buffer_depth(&mut self, depth: u32) -> Result<(), CameraError> {
        tracing::debug!(depth, "buffer depth not adjustable on this backend");
        Ok(())
    }

    /// Reads a single frame.
    fn capture(&mut self) -> Result<Frame, CameraError>;

    /// Checks if the camera is currently open.
    fn is_open(&self) -> bool;

    /// Closes the camera and releases resources.
    fn close(&mut self);
}

/// Counters and failure injection shared between a [`MockCamera`] and the test
/// that drives it.
#[derive(Debug, Default)]
pub struct MockProbe {
    open_attempts: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
    reads: AtomicU64,
    fail_reads: AtomicU32,
    fail_opens: AtomicU32,
}

impl MockProbe {
    /// Successful opens.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Opens attempted, including failures and rejected backends.
    pub fn open_attempts(&self) -> u64 {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Reads attempted, failed or not.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Makes the next `n` reads fail.
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` open attempts fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Mock camera that generates synthetic frames.
#[derive(Debug, Default)]
pub struct MockCamera {
    config: Option<CaptureConfig>,
    sequence: u64,
    unavailable: Vec<CaptureBackend>,
    probe: Arc<MockProbe>,
}

impl MockCamera {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every open through `backend`, to exercise fallback.
    pub fn without_backend(mut self, backend: CaptureBackend) -> Self {
        self.unavailable.push(backend);
        self
    }

    /// Returns the shared probe for observing and scripting this camera.
    pub fn probe(&self) -> Arc<MockProbe> {
        Arc::clone(&self.probe)
    }
}

impl Camera for MockCamera {
    fn open(&mut self, backend: CaptureBackend, config: &CaptureConfig) -> Result<(), CameraError> {
        self.probe.open_attempts.fetch_add(1, Ordering::SeqCst);

        if self.unavailable.contains(&backend) {
            return Err(CameraError::OpenFailed {
                backend,
                reason: "backend unavailable".into(),
            });
        }
        if MockProbe::take_one(&self.probe.fail_opens) {
            return Err(CameraError::OpenFailed {
                backend,
                reason: "injected open failure".into(),
            });
        }
        config
            .validate()
            .map_err(|e| CameraError::ConfigFailed(e.to_string()))?;

        self.config = Some(config.clone());
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        tracing::info!(%backend, device = config.device_index, "MockCamera opened");
        Ok(())
    }

    fn capture(&mut self) -> Result<Frame, CameraError> {
        let config = self.config.as_ref().ok_or(CameraError::NotInitialized)?;
        self.probe.reads.fetch_add(1, Ordering::SeqCst);

        if MockProbe::take_one(&self.probe.fail_reads) {
            return Err(CameraError::CaptureFailed("injected read failure".into()));
        }

        // Moving gradient so consecutive frames differ
        let (width, height) = (config.width, config.height);
        let shift = self.sequence as usize;
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height as usize {
            for x in 0..width as usize {
                pixels.push(((x + shift) % 256) as u8);
                pixels.push((y % 256) as u8);
                pixels.push(((x + y) % 256) as u8);
            }
        }

        self.sequence += 1;
        Ok(Frame::new(pixels, width, height, PixelFormat::Rgb8, self.sequence))
    }

    fn is_open(&self) -> bool {
        self.config.is_some()
    }

    fn close(&mut self) {
        if self.config.take().is_some() {
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
            tracing::info!("MockCamera closed");
        }
    }
}
