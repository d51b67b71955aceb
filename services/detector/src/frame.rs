//! Decoded frame contract.
//!
//! Every frame source hands the pipeline an 8-bit RGB image together with a
//! sequence number and the time it was captured. How the bytes were obtained
//! (JPEG snapshot, image file, GStreamer appsink) is the source's concern.

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Errors produced while turning bytes into a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Frame buffer of {actual} bytes does not match {width}x{height} RGB")]
    BufferSize {
        width: u32,
        height: u32,
        actual: usize,
    },

    #[error("Frame has zero width or height")]
    Empty,
}

/// Pixel dimensions of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A decoded video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// RGB pixel data
    pub image: RgbImage,

    /// Per-source sequence number
    pub sequence: u64,

    /// When the frame was acquired
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    /// Wrap an already decoded image.
    pub fn new(image: RgbImage, sequence: u64) -> Result<Self, FrameError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(FrameError::Empty);
        }
        Ok(Self {
            image,
            sequence,
            captured_at: Utc::now(),
        })
    }

    /// Decode an encoded still image (JPEG, PNG, BMP).
    pub fn decode(bytes: &[u8], sequence: u64) -> Result<Self, FrameError> {
        let decoded =
            image::load_from_memory(bytes).map_err(|e| FrameError::Decode(e.to_string()))?;
        Self::new(decoded.to_rgb8(), sequence)
    }

    /// Build a frame from a tightly packed RGB24 buffer.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>, sequence: u64) -> Result<Self, FrameError> {
        let actual = data.len();
        let image = RgbImage::from_raw(width, height, data).ok_or(FrameError::BufferSize {
            width,
            height,
            actual,
        })?;
        Self::new(image, sequence)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn size(&self) -> FrameSize {
        FrameSize::new(self.image.width(), self.image.height())
    }
}
