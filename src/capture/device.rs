//! Physical camera access through `nokhwa`.

use super::{CaptureBackend, CaptureConfig, Camera, CameraError, Frame, PixelFormat};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
    Resolution,
};

/// A USB/V4L2 camera opened through the platform capture stack.
pub struct DeviceCamera {
    inner: Option<nokhwa::Camera>,
    sequence: u64,
}

impl DeviceCamera {
    pub fn new() -> Self {
        Self {
            inner: None,
            sequence: 0,
        }
    }
}

impl Default for DeviceCamera {
    fn default() -> Self {
        Self::new()
    }
}

fn api_backend(backend: CaptureBackend) -> ApiBackend {
    match backend {
        CaptureBackend::V4l2 => ApiBackend::Video4Linux,
        CaptureBackend::MediaFoundation => ApiBackend::MediaFoundation,
        CaptureBackend::AvFoundation => ApiBackend::AVFoundation,
        CaptureBackend::Auto => ApiBackend::Auto,
    }
}

impl Camera for DeviceCamera {
    fn open(&mut self, backend: CaptureBackend, config: &CaptureConfig) -> Result<(), CameraError> {
        config
            .validate()
            .map_err(|e| CameraError::ConfigFailed(e.to_string()))?;
        self.close();

        let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(
                Resolution::new(config.width, config.height),
                FrameFormat::MJPEG,
                config.fps,
            ),
        ));
        let open_failed = |e: nokhwa::NokhwaError| CameraError::OpenFailed {
            backend,
            reason: e.to_string(),
        };

        let mut camera = nokhwa::Camera::with_backend(
            CameraIndex::Index(config.device_index),
            format,
            api_backend(backend),
        )
        .map_err(open_failed)?;
        camera.open_stream().map_err(open_failed)?;

        let resolution = camera.resolution();
        tracing::info!(
            %backend,
            device = config.device_index,
            width = resolution.width(),
            height = resolution.height(),
            "Camera opened"
        );

        self.inner = Some(camera);
        self.sequence = 0;
        Ok(())
    }

    fn capture(&mut self) -> Result<Frame, CameraError> {
        let camera = self.inner.as_mut().ok_or(CameraError::NotInitialized)?;
        let buffer = camera
            .frame()
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
        let image = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;

        let (width, height) = (image.width(), image.height());
        self.sequence += 1;
        Ok(Frame::new(
            image.into_raw(),
            width,
            height,
            PixelFormat::Rgb8,
            self.sequence,
        ))
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn close(&mut self) {
        if let Some(mut camera) = self.inner.take() {
            if let Err(e) = camera.stop_stream() {
                tracing::warn!(error = %e, "Failed to stop camera stream cleanly");
            }
            tracing::info!("Camera released");
        }
    }
}

impl Drop for DeviceCamera {
    fn drop(&mut self) {
        self.close();
    }
}
