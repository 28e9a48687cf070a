//! Camera input and frame handling.
//!
//! This module provides abstractions for reading frames from a camera,
//! compressing them for the wire, and the configuration that drives both.

mod camera;
mod config;
#[cfg(feature = "camera")]
mod device;
mod frame;

pub use camera::{Camera, CameraError, CaptureBackend, MockCamera, MockProbe};
pub use config::{CaptureConfig, ConfigError, FileConfig, RelayConfig, ServerConfig};
#[cfg(feature = "camera")]
pub use device::DeviceCamera;
pub use frame::{EncodeError, EncodedFrame, Frame, PixelFormat};
