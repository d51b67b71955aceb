//! Parking lot configuration model and its validation.
//!
//! A [`LotConfig`] is immutable once accepted; reconfiguring a lot means
//! building a new one and handing it to the scheduler, which swaps it in
//! atomically. All geometry checks happen here, at configuration time, so the
//! processing path never has to re-validate regions.

use crate::frame::FrameSize;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

pub type LotId = u64;
pub type SpotId = u64;

/// Configuration validation errors, reported synchronously to the caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LotValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Duplicate spot id {0}")]
    DuplicateSpot(SpotId),

    #[error("Spot {0} has zero width or height")]
    EmptyGeometry(SpotId),

    #[error("Spot {spot_id} geometry {geometry} exceeds frame bounds {frame}")]
    OutOfBounds {
        spot_id: SpotId,
        geometry: Geometry,
        frame: FrameSize,
    },

    #[error("frame_width and frame_height must be given together and be non-zero")]
    InvalidFrameSize,
}

/// Axis-aligned sampling rectangle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Whether the rectangle lies entirely inside a frame of the given size.
    pub fn fits_within(&self, frame: FrameSize) -> bool {
        u64::from(self.x) + u64::from(self.width) <= u64::from(frame.width)
            && u64::from(self.y) + u64::from(self.height) <= u64::from(frame.height)
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// One physical parking space inside a lot's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    pub spot_id: SpotId,
    pub geometry: Geometry,
}

/// Accepted configuration of one parking lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LotConfig {
    pub lot_id: LotId,
    pub name: String,
    pub location: String,
    pub feed_url: String,
    pub spots: Vec<Region>,
    /// Frame size declared by the operator, if any
    pub frame_size: Option<FrameSize>,
}

impl LotConfig {
    /// Check every region against a frame size, reporting the first misfit.
    pub fn check_fits(&self, frame: FrameSize) -> Result<(), LotValidationError> {
        check_regions_fit(&self.spots, frame)
    }

    /// Look up a region by spot id.
    pub fn region(&self, spot_id: SpotId) -> Option<&Region> {
        self.spots.iter().find(|r| r.spot_id == spot_id)
    }
}

/// Check a region set against a frame size.
pub fn check_regions_fit(regions: &[Region], frame: FrameSize) -> Result<(), LotValidationError> {
    match regions.iter().find(|r| !r.geometry.fits_within(frame)) {
        Some(region) => Err(LotValidationError::OutOfBounds {
            spot_id: region.spot_id,
            geometry: region.geometry,
            frame,
        }),
        None => Ok(()),
    }
}

/// Spot entry as sent by the admin UI: `{id, x, y}` with an optional size.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpotRequest {
    pub id: SpotId,
    pub x: u32,
    pub y: u32,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// Register-or-replace request body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LotConfigRequest {
    pub lot_id: LotId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub video_feed_url: String,
    #[serde(default)]
    pub parking_spots: Vec<SpotRequest>,
    /// Optional declared frame size used to validate regions up front
    #[serde(default)]
    pub frame_width: Option<u32>,
    #[serde(default)]
    pub frame_height: Option<u32>,
}

impl LotConfigRequest {
    /// Validate the request and build an immutable lot configuration.
    ///
    /// `default_spot_size` is `(width, height)` applied to spots that omit it.
    pub fn into_config(self, default_spot_size: (u32, u32)) -> Result<LotConfig, LotValidationError> {
        let feed_url = self.video_feed_url.trim().to_string();
        if feed_url.is_empty() {
            return Err(LotValidationError::MissingField("video_feed_url"));
        }

        let frame_size = match (self.frame_width, self.frame_height) {
            (None, None) => None,
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(FrameSize::new(w, h)),
            _ => return Err(LotValidationError::InvalidFrameSize),
        };

        let spots = build_regions(&self.parking_spots, default_spot_size)?;
        if let Some(frame) = frame_size {
            check_regions_fit(&spots, frame)?;
        }

        Ok(LotConfig {
            lot_id: self.lot_id,
            name: self.name,
            location: self.location,
            feed_url,
            spots,
            frame_size,
        })
    }
}

/// Turn wire spot entries into regions, rejecting duplicates and empty areas.
pub fn build_regions(
    spots: &[SpotRequest],
    default_spot_size: (u32, u32),
) -> Result<Vec<Region>, LotValidationError> {
    let mut seen = HashSet::with_capacity(spots.len());
    let mut regions = Vec::with_capacity(spots.len());

    for spot in spots {
        if !seen.insert(spot.id) {
            return Err(LotValidationError::DuplicateSpot(spot.id));
        }

        let geometry = Geometry::new(
            spot.x,
            spot.y,
            spot.width.unwrap_or(default_spot_size.0),
            spot.height.unwrap_or(default_spot_size.1),
        );
        if geometry.area() == 0 {
            return Err(LotValidationError::EmptyGeometry(spot.id));
        }
        if spot.x.checked_add(geometry.width).is_none() || spot.y.checked_add(geometry.height).is_none() {
            return Err(LotValidationError::OutOfBounds {
                spot_id: spot.id,
                geometry,
                frame: FrameSize::new(u32::MAX, u32::MAX),
            });
        }

        regions.push(Region {
            spot_id: spot.id,
            geometry,
        });
    }

    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPOT_SIZE: (u32, u32) = (103, 43);

    fn create_test_request() -> LotConfigRequest {
        LotConfigRequest {
            lot_id: 1,
            name: "North Lot".to_string(),
            location: "Building A".to_string(),
            video_feed_url: "stub://empty".to_string(),
            parking_spots: vec![
                SpotRequest { id: 1, x: 10, y: 10, width: None, height: None },
                SpotRequest { id: 2, x: 150, y: 10, width: Some(80), height: Some(40) },
            ],
            frame_width: None,
            frame_height: None,
        }
    }

    #[test]
    fn test_valid_request() {
        let config = create_test_request().into_config(SPOT_SIZE).unwrap();
        assert_eq!(config.spots.len(), 2);
        assert_eq!(config.spots[0].geometry, Geometry::new(10, 10, 103, 43));
        assert_eq!(config.spots[1].geometry, Geometry::new(150, 10, 80, 40));
        assert_eq!(config.frame_size, None);
    }

    #[test]
    fn test_missing_feed_url() {
        let mut request = create_test_request();
        request.video_feed_url = "   ".to_string();
        assert_eq!(
            request.into_config(SPOT_SIZE),
            Err(LotValidationError::MissingField("video_feed_url"))
        );
    }

    #[test]
    fn test_duplicate_spot_rejected() {
        let mut request = create_test_request();
        request.parking_spots[1].id = 1;
        assert_eq!(
            request.into_config(SPOT_SIZE),
            Err(LotValidationError::DuplicateSpot(1))
        );
    }

    #[test]
    fn test_zero_sized_spot_rejected() {
        let mut request = create_test_request();
        request.parking_spots[1].width = Some(0);
        assert_eq!(
            request.into_config(SPOT_SIZE),
            Err(LotValidationError::EmptyGeometry(2))
        );
    }

    #[test]
    fn test_declared_frame_size_checked() {
        let mut request = create_test_request();
        request.frame_width = Some(200);
        request.frame_height = Some(100);
        let err = request.into_config(SPOT_SIZE).unwrap_err();
        assert!(matches!(err, LotValidationError::OutOfBounds { spot_id: 2, .. }));
    }

    #[test]
    fn test_partial_frame_size_rejected() {
        let mut request = create_test_request();
        request.frame_width = Some(640);
        assert_eq!(
            request.into_config(SPOT_SIZE),
            Err(LotValidationError::InvalidFrameSize)
        );
    }

    #[test]
    fn test_empty_spot_list_allowed() {
        let mut request = create_test_request();
        request.parking_spots.clear();
        let config = request.into_config(SPOT_SIZE).unwrap();
        assert!(config.spots.is_empty());
    }

    #[test]
    fn test_geometry_fits_on_edge() {
        let geometry = Geometry::new(537, 437, 103, 43);
        assert!(geometry.fits_within(FrameSize::new(640, 480)));
        assert!(!geometry.fits_within(FrameSize::new(639, 480)));
    }

    #[test]
    fn test_overflowing_geometry_rejected() {
        let mut request = create_test_request();
        request.parking_spots[0].x = u32::MAX - 5;
        let err = request.into_config(SPOT_SIZE).unwrap_err();
        assert!(matches!(err, LotValidationError::OutOfBounds { spot_id: 1, .. }));
    }

    #[test]
    fn test_wire_format_parses() {
        let json = r#"{
            "lot_id": 3,
            "name": "East",
            "location": "Campus",
            "video_feed_url": "http://cam.local/snapshot.jpg",
            "parking_spots": [{"id": 1, "x": 0, "y": 0}, {"id": 2, "x": 110, "y": 0}]
        }"#;
        let request: LotConfigRequest = serde_json::from_str(json).unwrap();
        let config = request.into_config(SPOT_SIZE).unwrap();
        assert_eq!(config.lot_id, 3);
        assert_eq!(config.region(2).unwrap().geometry.x, 110);
    }
}
