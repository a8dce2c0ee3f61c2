use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::task::{ImageRef, ScreenSize};

/// Axis-aligned pixel rectangle reported by the capture collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn contains(&self, px: u32, py: u32) -> bool {
        px >= self.x
            && py >= self.y
            && u64::from(px) < u64::from(self.x) + u64::from(self.width)
            && u64::from(py) < u64::from(self.y) + u64::from(self.height)
    }
}

/// Why a test could not be compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonError {
    #[error("screenshot missing")]
    MissingImage,

    #[error("capture of one variant failed")]
    CaptureFailed,

    #[error("screenshot could not be decoded")]
    UndecodableImage,
}

/// Per-test comparison verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Classification {
    Same,
    Different,
    Error(ComparisonError),
}

impl Classification {
    pub fn is_same(&self) -> bool {
        matches!(self, Classification::Same)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Classification::Same => "same",
            Classification::Different => "different",
            Classification::Error(_) => "error",
        }
    }
}

/// Pixel statistics behind a classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffMetadata {
    pub masked_regions: Vec<Rect>,
    pub masked_pixels: u64,
    pub compared_pixels: u64,
    pub differing_pixels: u64,
    /// Fraction of compared pixels that differ (0.0 - 1.0).
    pub score: f64,
}

/// Result of comparing variant A against variant B for one test and size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub candidate_id: Uuid,
    pub test_name: String,
    pub size: ScreenSize,
    pub classification: Classification,
    pub image_a: Option<ImageRef>,
    pub image_b: Option<ImageRef>,
    pub diff: Option<DiffMetadata>,
    /// Blob key of the rendered diff image, present when the test differs.
    pub diff_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ComparisonResult {
    pub fn diff_blob_key(&self) -> Option<&str> {
        self.diff_key.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_contains_is_half_open() {
        let rect = Rect::new(10, 10, 5, 5);
        assert!(rect.contains(10, 10));
        assert!(rect.contains(14, 14));
        assert!(!rect.contains(15, 14));
        assert!(!rect.contains(9, 10));
    }

    #[test]
    fn test_rect_contains_does_not_overflow() {
        let rect = Rect::new(u32::MAX - 1, 0, u32::MAX, 1);
        assert!(rect.contains(u32::MAX - 1, 0));
    }

    #[test]
    fn test_classification_serialization() {
        let json = serde_json::to_value(Classification::Error(ComparisonError::MissingImage)).unwrap();
        assert_eq!(json["verdict"], "error");
        assert_eq!(json["reason"], "missing_image");
        let same = serde_json::to_value(Classification::Same).unwrap();
        assert_eq!(same["verdict"], "same");
    }
}
