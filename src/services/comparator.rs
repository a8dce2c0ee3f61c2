//! Pixel comparison of two screenshots with selector masking.
//!
//! Masked regions are excluded before any pixel is diffed, so a difference
//! confined to masked areas can never influence the verdict. The function is
//! pure: same inputs, same [`Comparison`].

use image::{ImageFormat, Rgba, RgbaImage};
use std::collections::BTreeMap;
use std::io::Cursor;

use crate::models::comparison::{Classification, ComparisonError, DiffMetadata, Rect};

const DIFF_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const MASK_COLOR: Rgba<u8> = Rgba([128, 128, 128, 255]);
const BACKGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// A decoded screenshot plus the element rectangles its capture resolved.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub pixels: RgbaImage,
    pub regions: BTreeMap<String, Vec<Rect>>,
}

impl Screenshot {
    pub fn new(pixels: RgbaImage, regions: BTreeMap<String, Vec<Rect>>) -> Self {
        Self { pixels, regions }
    }

    pub fn decode(bytes: &[u8], regions: BTreeMap<String, Vec<Rect>>) -> Result<Self, ComparisonError> {
        let pixels = image::load_from_memory(bytes)
            .map_err(|_| ComparisonError::UndecodableImage)?
            .to_rgba8();
        Ok(Self { pixels, regions })
    }
}

/// Outcome of [`compare`].
#[derive(Debug, Clone)]
pub struct Comparison {
    pub classification: Classification,
    pub metadata: Option<DiffMetadata>,
    /// Rendered only when the screenshots differ.
    pub diff_image: Option<RgbaImage>,
}

impl Comparison {
    fn error(reason: ComparisonError) -> Self {
        Self {
            classification: Classification::Error(reason),
            metadata: None,
            diff_image: None,
        }
    }
}

/// Compare two screenshots.
///
/// `tolerance` is the largest fraction of unmasked pixels allowed to differ
/// while still classifying as `Same`; `0.0` demands an exact match.
pub fn compare(
    a: Option<&Screenshot>,
    b: Option<&Screenshot>,
    mask_selectors: &[String],
    tolerance: f64,
) -> Comparison {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        _ => return Comparison::error(ComparisonError::MissingImage),
    };

    let width = a.pixels.width().max(b.pixels.width());
    let height = a.pixels.height().max(b.pixels.height());

    let masked_regions = resolve_masks(a, b, mask_selectors);
    let mask = MaskBitmap::render(width, height, &masked_regions);

    let mut diff = RgbaImage::from_pixel(width, height, BACKGROUND);
    let mut masked_pixels = 0u64;
    let mut compared_pixels = 0u64;
    let mut differing_pixels = 0u64;

    for y in 0..height {
        for x in 0..width {
            if mask.is_masked(x, y) {
                masked_pixels += 1;
                diff.put_pixel(x, y, MASK_COLOR);
                continue;
            }

            compared_pixels += 1;
            let pa = a.pixels.get_pixel_checked(x, y);
            let pb = b.pixels.get_pixel_checked(x, y);
            let differs = match (pa, pb) {
                (Some(pa), Some(pb)) => pa != pb,
                _ => true,
            };

            if differs {
                differing_pixels += 1;
                diff.put_pixel(x, y, DIFF_COLOR);
            } else if let Some(pa) = pa {
                diff.put_pixel(x, y, fade(*pa));
            }
        }
    }

    let score = if compared_pixels == 0 {
        0.0
    } else {
        differing_pixels as f64 / compared_pixels as f64
    };

    let classification = if score <= tolerance {
        Classification::Same
    } else {
        Classification::Different
    };

    Comparison {
        classification,
        metadata: Some(DiffMetadata {
            masked_regions,
            masked_pixels,
            compared_pixels,
            differing_pixels,
            score,
        }),
        diff_image: (classification == Classification::Different).then_some(diff),
    }
}

/// Encode an image as PNG bytes.
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// Union of the rectangles either capture resolved for the masked selectors,
/// sorted so the result does not depend on map or selector order.
fn resolve_masks(a: &Screenshot, b: &Screenshot, mask_selectors: &[String]) -> Vec<Rect> {
    let mut rects: Vec<Rect> = mask_selectors
        .iter()
        .flat_map(|selector| {
            let from_a = a.regions.get(selector).into_iter().flatten();
            let from_b = b.regions.get(selector).into_iter().flatten();
            from_a.chain(from_b).copied()
        })
        .filter(|r| r.width > 0 && r.height > 0)
        .collect();
    rects.sort();
    rects.dedup();
    rects
}

/// Lighten a pixel so unchanged areas recede behind the highlighted ones.
fn fade(pixel: Rgba<u8>) -> Rgba<u8> {
    let [r, g, b, _] = pixel.0;
    let lift = |c: u8| (u16::from(c) + 2 * 255) / 3;
    Rgba([lift(r) as u8, lift(g) as u8, lift(b) as u8, 255])
}

struct MaskBitmap {
    width: u32,
    bits: Vec<bool>,
}

impl MaskBitmap {
    fn render(width: u32, height: u32, rects: &[Rect]) -> Self {
        let mut bits = vec![false; width as usize * height as usize];
        for rect in rects {
            let x_end = rect.x.saturating_add(rect.width).min(width);
            let y_end = rect.y.saturating_add(rect.height).min(height);
            for y in rect.y.min(height)..y_end {
                let row = y as usize * width as usize;
                for x in rect.x.min(width)..x_end {
                    bits[row + x as usize] = true;
                }
            }
        }
        Self { width, bits }
    }

    fn is_masked(&self, x: u32, y: u32) -> bool {
        self.bits[y as usize * self.width as usize + x as usize]
    }
}
