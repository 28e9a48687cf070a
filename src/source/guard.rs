//! Scoped ownership of the camera device.

use crate::capture::{Camera, CameraError, CaptureBackend, CaptureConfig, Frame};

use super::SourceError;

/// Owns the camera and releases it exactly once, on every exit path.
///
/// Dropping the guard closes an open device; closing an already released
/// device is a no-op, so a release during reinit followed by shutdown never
/// double-closes.
pub struct DeviceGuard {
    camera: Box<dyn Camera>,
    backend: Option<CaptureBackend>,
}

impl DeviceGuard {
    pub fn new(camera: Box<dyn Camera>) -> Self {
        Self {
            camera,
            backend: None,
        }
    }

    /// Backend the device is currently open through.
    pub fn backend(&self) -> Option<CaptureBackend> {
        self.backend
    }

    pub fn is_open(&self) -> bool {
        self.camera.is_open()
    }

    /// Opens the device, trying each configured backend in order.
    pub fn open(&mut self, config: &CaptureConfig) -> Result<CaptureBackend, SourceError> {
        let mut failures = Vec::with_capacity(config.backends.len());

        for &backend in &config.backends {
            match self.camera.open(backend, config) {
                Ok(()) => {
                    if let Err(e) = self.camera.set_buffer_depth(config.buffer_depth) {
                        tracing::warn!(%backend, error = %e, "Could not minimize device buffering");
                    }
                    self.backend = Some(backend);
                    tracing::info!(
                        %backend,
                        device = config.device_index,
                        width = config.width,
                        height = config.height,
                        "Capture device ready"
                    );
                    return Ok(backend);
                }
                Err(e) => {
                    tracing::warn!(%backend, error = %e, "Capture backend failed, trying next");
                    failures.push(e.to_string());
                }
            }
        }

        Err(SourceError::DeviceOpenFailure {
            device: config.device_index,
            reasons: failures,
        })
    }

    /// Releases the current handle and opens a fresh one.
    pub fn reopen(&mut self, config: &CaptureConfig) -> Result<CaptureBackend, SourceError> {
        self.release();
        self.open(config)
    }

    /// Reads one frame from the open device.
    pub fn read(&mut self) -> Result<Frame, CameraError> {
        self.camera.capture()
    }

    /// Closes the device if it is open.
    pub fn release(&mut self) {
        if self.camera.is_open() {
            self.camera.close();
            tracing::info!(backend = ?self.backend, "Capture device released");
        }
        self.backend = None;
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockCamera;

    fn config() -> CaptureConfig {
        CaptureConfig::with_dimensions(16, 16)
    }

    #[test]
    fn test_falls_back_to_next_backend() {
        let camera = MockCamera::new().without_backend(CaptureBackend::V4l2);
        let probe = camera.probe();
        let mut guard = DeviceGuard::new(Box::new(camera));

        assert_eq!(guard.open(&config()).unwrap(), CaptureBackend::Auto);
        assert_eq!(probe.open_attempts(), 2);
        assert_eq!(probe.opens(), 1);
    }

    #[test]
    fn test_all_backends_fail() {
        let camera = MockCamera::new();
        let probe = camera.probe();
        probe.fail_next_opens(2);
        let mut guard = DeviceGuard::new(Box::new(camera));

        match guard.open(&config()) {
            Err(SourceError::DeviceOpenFailure { device, reasons }) => {
                assert_eq!(device, 0);
                assert_eq!(reasons.len(), 2);
            }
            other => panic!("expected open failure, got {other:?}"),
        }
        assert!(!guard.is_open());
    }

    #[test]
    fn test_released_exactly_once() {
        let camera = MockCamera::new();
        let probe = camera.probe();
        {
            let mut guard = DeviceGuard::new(Box::new(camera));
            guard.open(&config()).unwrap();
            guard.reopen(&config()).unwrap();
            assert_eq!(probe.closes(), 1);
        }
        assert_eq!(probe.opens(), 2);
        assert_eq!(probe.closes(), 2);
    }

    #[test]
    fn test_failed_reopen_leaves_device_released() {
        let camera = MockCamera::new();
        let probe = camera.probe();
        let mut guard = DeviceGuard::new(Box::new(camera));
        guard.open(&config()).unwrap();

        probe.fail_next_opens(2);
        assert!(guard.reopen(&config()).is_err());
        assert!(!guard.is_open());
        assert!(guard.read().is_err());

        drop(guard);
        assert_eq!(probe.closes(), 1);
    }
}
