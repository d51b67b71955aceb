//! Annotated frame output for visual inspection of spot geometry.

use crate::lot::{LotId, Region};
use crate::stabilizer::SpotState;
use chrono::{DateTime, Utc};
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::io::Cursor;
use std::path::{Path, PathBuf};

const OCCUPIED: Rgb<u8> = Rgb([220, 30, 30]);
const FREE: Rgb<u8> = Rgb([30, 200, 60]);
const UNKNOWN: Rgb<u8> = Rgb([240, 200, 0]);
const OUTLINE: u32 = 2;

/// Outline every region: red when occupied, green when free, yellow when the
/// spot has no state yet.
pub fn annotate<F>(image: &RgbImage, regions: &[Region], occupied: F) -> RgbImage
where
    F: Fn(&Region) -> Option<bool>,
{
    let mut out = image.clone();
    for region in regions {
        let color = match occupied(region) {
            Some(true) => OCCUPIED,
            Some(false) => FREE,
            None => UNKNOWN,
        };
        draw_outline(&mut out, region, color);
    }
    out
}

/// Annotate using stabilized spot states.
pub fn annotate_states(image: &RgbImage, regions: &[Region], states: &[SpotState]) -> RgbImage {
    annotate(image, regions, |region| {
        states
            .iter()
            .find(|s| s.spot_id == region.spot_id)
            .map(|s| s.occupied)
    })
}

fn draw_outline(image: &mut RgbImage, region: &Region, color: Rgb<u8>) {
    let g = region.geometry;
    for inset in 0..OUTLINE {
        let (Some(width), Some(height)) = (
            g.width.checked_sub(2 * inset).filter(|w| *w > 0),
            g.height.checked_sub(2 * inset).filter(|h| *h > 0),
        ) else {
            break;
        };
        let x = i32::try_from(g.x.saturating_add(inset)).unwrap_or(i32::MAX);
        let y = i32::try_from(g.y.saturating_add(inset)).unwrap_or(i32::MAX);
        draw_hollow_rect_mut(image, Rect::at(x, y).of_size(width, height), color);
    }
}

/// Encode an image as JPEG bytes.
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)?;
    Ok(buf)
}

/// File name for a lot's debug frame, e.g. `lot_3_20240301_081500.jpg`.
pub fn debug_file_name(lot_id: LotId, at: DateTime<Utc>) -> String {
    format!("lot_{}_{}.jpg", lot_id, at.format("%Y%m%d_%H%M%S"))
}

/// Write an annotated frame into `dir`, creating it when missing.
pub fn save_debug_frame(
    dir: &Path,
    lot_id: LotId,
    image: &RgbImage,
    at: DateTime<Utc>,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(debug_file_name(lot_id, at));
    std::fs::write(&path, encode_jpeg(image)?)?;
    Ok(path)
}
