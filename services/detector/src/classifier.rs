//! Spot occupancy classifier.
//!
//! A deterministic image-filter pipeline run on the sub-image of one region:
//!
//! ```text
//! crop -> intensity -> gaussian 3x3 -> adaptive threshold (inverted)
//!      -> median -> dilate 3x3 -> count foreground -> compare with threshold
//! ```
//!
//! An empty painted surface leaves few edges after local binarization; a
//! parked vehicle adds contrast and pushes the foreground count over the
//! occupancy threshold. Classification has no side effects and depends only
//! on the pixels, the geometry and [`ClassifierParams`], so it is safe to run
//! for many lots in parallel.

use crate::config::ClassifierConfig;
use crate::lot::Geometry;
use image::{imageops, GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::filter::{median_filter, separable_filter_equal};
use imageproc::map::map_colors;
use imageproc::morphology::dilate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smoothing kernel applied before binarization.
const SMOOTHING_KERNEL: usize = 3;
const SMOOTHING_SIGMA: f32 = 1.0;

/// Foreground value written by the binarization stage.
const FOREGROUND: u8 = 255;

pub const MIN_BLOCK_SIZE: u32 = 3;
pub const MAX_BLOCK_SIZE: u32 = 255;
pub const MAX_MEDIAN_KERNEL: u32 = 31;
pub const MAX_DILATION_ITERATIONS: u32 = 16;

/// A classifier parameter outside its supported range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid value for {field}: {value} is outside {min}..={max}")]
pub struct ParamRangeError {
    pub field: &'static str,
    pub value: u32,
    pub min: u32,
    pub max: u32,
}

/// Explicit classifier parameter set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifierParams {
    pub block_size: u32,
    pub bias: i32,
    pub median_kernel: u32,
    pub dilation_iterations: u32,
    pub occupancy_pixel_threshold: u32,
    pub spot_width: u32,
    pub spot_height: u32,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self::from(&ClassifierConfig::default())
    }
}

impl From<&ClassifierConfig> for ClassifierParams {
    fn from(config: &ClassifierConfig) -> Self {
        Self {
            block_size: config.block_size,
            bias: config.bias,
            median_kernel: config.median_kernel,
            dilation_iterations: config.dilation_iterations,
            occupancy_pixel_threshold: config.occupancy_pixel_threshold,
            spot_width: config.spot_width,
            spot_height: config.spot_height,
        }
    }
}

impl ClassifierParams {
    /// Default `(width, height)` for regions that omit their size.
    pub fn default_spot_size(&self) -> (u32, u32) {
        (self.spot_width, self.spot_height)
    }

    /// Apply per-request overrides, used when tuning offline.
    ///
    /// The result is range-checked; filter sizes that would make a single
    /// classification unreasonably expensive are rejected.
    pub fn with_overrides(&self, overrides: &ParamOverrides) -> Result<Self, ParamRangeError> {
        let params = Self {
            block_size: overrides.block_size.unwrap_or(self.block_size),
            bias: overrides.bias.unwrap_or(self.bias),
            median_kernel: overrides.median_kernel.unwrap_or(self.median_kernel),
            dilation_iterations: overrides
                .dilation_iterations
                .unwrap_or(self.dilation_iterations),
            occupancy_pixel_threshold: overrides
                .occupancy_pixel_threshold
                .unwrap_or(self.occupancy_pixel_threshold),
            spot_width: overrides.spot_width.unwrap_or(self.spot_width),
            spot_height: overrides.spot_height.unwrap_or(self.spot_height),
        };
        params.validate()?;
        Ok(params)
    }

    /// Check every size-like parameter against its supported range.
    pub fn validate(&self) -> Result<(), ParamRangeError> {
        check_range("block_size", self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)?;
        check_range("median_kernel", self.median_kernel, 1, MAX_MEDIAN_KERNEL)?;
        check_range("dilation_iterations", self.dilation_iterations, 0, MAX_DILATION_ITERATIONS)?;
        check_range("occupancy_pixel_threshold", self.occupancy_pixel_threshold, 1, u32::MAX)?;
        check_range("spot_width", self.spot_width, 1, u32::MAX)?;
        check_range("spot_height", self.spot_height, 1, u32::MAX)?;
        Ok(())
    }
}

fn check_range(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), ParamRangeError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ParamRangeError { field, value, min, max })
    }
}

/// Optional parameter overrides accepted by the single-image test endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParamOverrides {
    pub block_size: Option<u32>,
    pub bias: Option<i32>,
    pub median_kernel: Option<u32>,
    pub dilation_iterations: Option<u32>,
    pub occupancy_pixel_threshold: Option<u32>,
    pub spot_width: Option<u32>,
    pub spot_height: Option<u32>,
}

/// Raw per-frame result for one region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub occupied: bool,
    pub confidence: f32,
    pub foreground_pixels: u32,
}

/// Pure classifier over a fixed parameter set.
///
/// Parameters are expected to have passed [`ClassifierParams::validate`];
/// sizes are clamped into range here as well.
#[derive(Debug, Clone)]
pub struct SpotClassifier {
    params: ClassifierParams,
    smoothing: Vec<f32>,
    neighbourhood: Vec<f32>,
    median_radius: u32,
    dilation: u8,
}

impl SpotClassifier {
    pub fn new(params: ClassifierParams) -> Self {
        let block = odd(params.block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)) as usize;
        let median = odd(params.median_kernel.clamp(1, MAX_MEDIAN_KERNEL));
        let dilation = params.dilation_iterations.min(MAX_DILATION_ITERATIONS) as u8;
        Self {
            smoothing: gaussian_kernel(SMOOTHING_KERNEL, SMOOTHING_SIGMA),
            neighbourhood: gaussian_kernel(block, auto_sigma(block)),
            median_radius: median / 2,
            dilation,
            params,
        }
    }

    pub fn params(&self) -> &ClassifierParams {
        &self.params
    }

    /// Classify one region of a frame.
    ///
    /// Returns `None` when the geometry does not fit inside the image.
    pub fn classify(&self, image: &RgbImage, geometry: &Geometry) -> Option<Classification> {
        let mask = self.foreground_mask(image, geometry)?;
        Some(self.classify_count(count_foreground(&mask)))
    }

    /// Run the filter pipeline and return the processed binary mask.
    pub fn foreground_mask(&self, image: &RgbImage, geometry: &Geometry) -> Option<GrayImage> {
        let frame = crate::frame::FrameSize::new(image.width(), image.height());
        if geometry.area() == 0 || !geometry.fits_within(frame) {
            return None;
        }

        let crop = imageops::crop_imm(image, geometry.x, geometry.y, geometry.width, geometry.height)
            .to_image();
        let gray = to_intensity(&crop);
        let smoothed: GrayImage = separable_filter_equal(&gray, &self.smoothing);
        let binary = adaptive_threshold_inv(&smoothed, &self.neighbourhood, self.params.bias);
        let despeckled = if self.median_radius == 0 {
            binary
        } else {
            median_filter(&binary, self.median_radius, self.median_radius)
        };
        // An L-infinity radius of k equals k passes of a 3x3 square
        Some(if self.dilation == 0 {
            despeckled
        } else {
            dilate(&despeckled, Norm::LInf, self.dilation)
        })
    }

    /// Decide occupancy from a processed foreground pixel count.
    ///
    /// The threshold is inclusive. Confidence grows with the distance from the
    /// threshold: 0.5 exactly at the threshold, 1.0 at one full threshold away.
    pub fn classify_count(&self, foreground_pixels: u32) -> Classification {
        let threshold = self.params.occupancy_pixel_threshold.max(1);
        let distance = (i64::from(foreground_pixels) - i64::from(threshold)).unsigned_abs() as f32;
        let ratio = (distance / threshold as f32).min(1.0);

        Classification {
            occupied: foreground_pixels >= threshold,
            confidence: (0.5 + 0.5 * ratio).clamp(0.0, 1.0),
            foreground_pixels,
        }
    }
}

/// Round kernel sizes up to the next odd value.
fn odd(size: u32) -> u32 {
    if size % 2 == 0 {
        size + 1
    } else {
        size
    }
}

/// Sigma used for a Gaussian neighbourhood when none is specified.
fn auto_sigma(size: usize) -> f32 {
    0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Normalized 1-D Gaussian kernel.
fn gaussian_kernel(size: usize, sigma: f32) -> Vec<f32> {
    let center = (size as f32 - 1.0) / 2.0;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - center;
            (-(d * d) / denom).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for w in &mut kernel {
        *w /= sum;
    }
    kernel
}

/// Convert RGB to single-channel intensity (ITU-R BT.601 weights).
fn to_intensity(image: &RgbImage) -> GrayImage {
    map_colors(image, |pixel| {
        let [r, g, b] = pixel.0;
        let y = 0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b);
        Luma([y.round().clamp(0.0, 255.0) as u8])
    })
}

/// Block-local inverted binarization.
///
/// A pixel becomes foreground when it is at least `bias` darker than the
/// Gaussian-weighted mean of its neighbourhood.
fn adaptive_threshold_inv(image: &GrayImage, neighbourhood: &[f32], bias: i32) -> GrayImage {
    let local_mean: GrayImage = separable_filter_equal(image, neighbourhood);
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let value = i32::from(image.get_pixel(x, y).0[0]);
        let mean = i32::from(local_mean.get_pixel(x, y).0[0]);
        if value - mean > -bias {
            Luma([0])
        } else {
            Luma([FOREGROUND])
        }
    })
}

fn count_foreground(mask: &GrayImage) -> u32 {
    mask.pixels().filter(|p| p.0[0] != 0).count() as u32
}
