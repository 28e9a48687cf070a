//! Raw frames as read from the device, and their JPEG-encoded form.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::time::Instant;
use thiserror::Error;

/// Pixel layout of a raw frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit grayscale, one byte per pixel.
    Gray8,
    /// 8-bit RGB, three bytes per pixel.
    Rgb8,
}

impl PixelFormat {
    /// Bytes used by a single pixel.
    #[inline]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }

    fn color_type(self) -> ExtendedColorType {
        match self {
            PixelFormat::Gray8 => ExtendedColorType::L8,
            PixelFormat::Rgb8 => ExtendedColorType::Rgb8,
        }
    }
}

/// Errors raised while compressing a frame.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("frame buffer does not match its dimensions ({actual} bytes, expected {expected})")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("jpeg encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// A single uncompressed frame from the camera.
///
/// Lives for one capture cycle only: it is encoded and then dropped.
pub struct Frame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    timestamp: Instant,
    sequence: u64,
}

impl Frame {
    /// Creates a new frame with the given parameters.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, format: PixelFormat, sequence: u64) -> Self {
        Self {
            pixels,
            width,
            height,
            format,
            timestamp: Instant::now(),
            sequence,
        }
    }

    /// Returns a reference to the raw pixel data.
    #[inline]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Returns the capture timestamp.
    #[inline]
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Returns the device-side sequence number.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Expected buffer length for the frame's dimensions and format.
    #[inline]
    pub fn expected_len(&self) -> usize {
        (self.width as usize) * (self.height as usize) * self.format.bytes_per_pixel()
    }

    /// Validates that the pixel buffer size matches dimensions.
    pub fn is_valid(&self) -> bool {
        self.pixels.len() == self.expected_len()
    }

    /// Compresses the frame to JPEG, consuming the raw buffer.
    pub fn encode_jpeg(self, quality: u8) -> Result<EncodedFrame, EncodeError> {
        if !self.is_valid() {
            return Err(EncodeError::SizeMismatch {
                expected: self.expected_len(),
                actual: self.pixels.len(),
            });
        }

        let mut out = Vec::with_capacity(self.pixels.len() / 8);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder.encode(&self.pixels, self.width, self.height, self.format.color_type())?;

        Ok(EncodedFrame {
            data: Bytes::from(out),
            sequence: self.sequence,
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .field("pixel_bytes", &self.pixels.len())
            .finish()
    }
}

/// A compressed frame ready for fan-out.
///
/// Cheap to clone: the payload is reference counted.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    data: Bytes,
    sequence: u64,
}

impl EncodedFrame {
    pub fn new(data: Bytes, sequence: u64) -> Self {
        Self { data, sequence }
    }

    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let pixels = vec![0u8; 640 * 480 * 3];
        let frame = Frame::new(pixels, 640, 480, PixelFormat::Rgb8, 1);

        assert_eq!(frame.width(), 640);
        assert_eq!(frame.height(), 480);
        assert_eq!(frame.sequence(), 1);
        assert!(frame.is_valid());
    }

    #[test]
    fn test_frame_invalid_size() {
        let frame = Frame::new(vec![0u8; 100], 640, 480, PixelFormat::Gray8, 1);
        assert!(!frame.is_valid());
        assert!(matches!(
            frame.encode_jpeg(80),
            Err(EncodeError::SizeMismatch { actual: 100, .. })
        ));
    }

    #[test]
    fn test_encode_produces_jpeg() {
        let pixels: Vec<u8> = (0..64 * 48 * 3).map(|i| (i % 251) as u8).collect();
        let frame = Frame::new(pixels, 64, 48, PixelFormat::Rgb8, 7);

        let encoded = frame.encode_jpeg(80).unwrap();
        assert_eq!(encoded.sequence(), 7);
        // SOI marker
        assert_eq!(&encoded.data()[..2], &[0xFF, 0xD8]);
    }
}
