//! Synthetic frame source for demos and smoke tests.
//!
//! `stub://<pattern>?width=<w>&height=<h>` produces deterministic frames
//! without any camera. Patterns:
//!
//! - `empty`: flat gray surface, every spot reads free
//! - `busy`: high-contrast vertical stripes, every spot reads occupied
//! - `noise`: fixed pseudo-random texture
//! - `flicker`: alternates `busy` and `empty` on every frame
//! - `offline`: every read fails as unavailable
//! - `corrupt`: every read fails to decode

use super::{FrameSource, SourceError};
use crate::frame::{Frame, FrameSize};
use async_trait::async_trait;
use image::{Rgb, RgbImage};
use reqwest::Url;
use std::str::FromStr;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const MAX_DIMENSION: u32 = 4096;

/// Stripe width of the `busy` pattern in pixels.
const STRIPE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubPattern {
    Empty,
    Busy,
    Noise,
    Flicker,
    Offline,
    Corrupt,
}

impl FromStr for StubPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "empty" => Ok(Self::Empty),
            "busy" => Ok(Self::Busy),
            "noise" => Ok(Self::Noise),
            "flicker" => Ok(Self::Flicker),
            "offline" => Ok(Self::Offline),
            "corrupt" => Ok(Self::Corrupt),
            other => Err(format!("unknown stub pattern `{other}`")),
        }
    }
}

pub struct StubSource {
    pattern: StubPattern,
    size: FrameSize,
    sequence: u64,
}

impl StubSource {
    pub fn new(pattern: StubPattern, size: FrameSize) -> Self {
        Self {
            pattern,
            size,
            sequence: 0,
        }
    }

    pub fn from_url(url: &Url) -> Result<Self, SourceError> {
        let invalid = |reason: String| SourceError::Unsupported {
            url: url.to_string(),
            reason,
        };

        let pattern: StubPattern = url.host_str().unwrap_or_default().parse().map_err(invalid)?;

        let mut size = FrameSize::new(DEFAULT_WIDTH, DEFAULT_HEIGHT);
        for (key, value) in url.query_pairs() {
            let target = match key.as_ref() {
                "width" => &mut size.width,
                "height" => &mut size.height,
                _ => continue,
            };
            *target = value
                .parse::<u32>()
                .ok()
                .filter(|v| (1..=MAX_DIMENSION).contains(v))
                .ok_or_else(|| invalid(format!("{key} must be between 1 and {MAX_DIMENSION}")))?;
        }

        Ok(Self::new(pattern, size))
    }

    pub fn pattern(&self) -> StubPattern {
        self.pattern
    }

    fn render(&self, pattern: StubPattern) -> RgbImage {
        let FrameSize { width, height } = self.size;
        match pattern {
            StubPattern::Busy => RgbImage::from_fn(width, height, |x, _| {
                if (x / STRIPE) % 2 == 0 {
                    Rgb([20, 20, 20])
                } else {
                    Rgb([235, 235, 235])
                }
            }),
            StubPattern::Noise => RgbImage::from_fn(width, height, |x, y| {
                let v = texture(x, y);
                Rgb([v, v, v])
            }),
            _ => RgbImage::from_pixel(width, height, Rgb([128, 128, 128])),
        }
    }
}

/// Cheap integer hash giving a stable texture per pixel.
fn texture(x: u32, y: u32) -> u8 {
    let mut h = x.wrapping_mul(0x9E37_79B1) ^ y.wrapping_mul(0x85EB_CA77);
    h ^= h >> 15;
    h = h.wrapping_mul(0xC2B2_AE3D);
    h ^= h >> 13;
    (h & 0xFF) as u8
}

#[async_trait]
impl FrameSource for StubSource {
    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let sequence = self.sequence;
        self.sequence += 1;

        let pattern = match self.pattern {
            StubPattern::Offline => {
                return Err(SourceError::Unavailable("stub feed is offline".to_string()))
            }
            StubPattern::Corrupt => {
                return Err(SourceError::Decode("stub frame is corrupt".to_string()))
            }
            StubPattern::Flicker if sequence % 2 == 0 => StubPattern::Busy,
            StubPattern::Flicker => StubPattern::Empty,
            other => other,
        };

        Ok(Frame::new(self.render(pattern), sequence)?)
    }

    async fn skip_frames(&mut self, count: u32) -> Result<(), SourceError> {
        self.sequence += u64::from(count);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "stub"
    }
}
