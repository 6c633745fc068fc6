use image::RgbImage;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Face bounding box in frame pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl BoundingBox {
    pub fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Clamp the box so it lies inside a `width` x `height` frame
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let left = self.left.min(width);
        let top = self.top.min(height);
        Self {
            left,
            top,
            right: self.right.clamp(left, width),
            bottom: self.bottom.clamp(top, height),
        }
    }
}

/// A detected face: where it is in the frame and the pixels inside that box
#[derive(Debug, Clone)]
pub struct FaceRegion {
    pub bbox: BoundingBox,
    pub image: RgbImage,
}

impl FaceRegion {
    pub fn new(bbox: BoundingBox, image: RgbImage) -> Self {
        Self { bbox, image }
    }
}

/// Cut the pixels of `bbox` out of a full frame.
///
/// Boxes reaching past the frame edge are clamped, so a detector that
/// overshoots by a few pixels still yields a usable (smaller) region.
pub fn crop_region(frame: &RgbImage, bbox: BoundingBox) -> FaceRegion {
    let clamped = bbox.clamp_to(frame.width(), frame.height());
    let image = image::imageops::crop_imm(
        frame,
        clamped.left,
        clamped.top,
        clamped.width(),
        clamped.height(),
    )
    .to_image();
    log::debug!(
        "cropped region {:?} -> {}x{}",
        bbox,
        image.width(),
        image.height()
    );
    FaceRegion { bbox, image }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VectorError {
    #[error("feature vector is empty")]
    Empty,
    #[error("feature vector value at index {index} is not finite")]
    NonFinite { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("feature vector dimension mismatch: expected {expected}, found {found}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub found: usize,
}

/// Face encoding produced by the external extractor.
///
/// The values are fixed at construction; there is no way to mutate a vector
/// once built. Serialized as a plain sequence of floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct FeatureVector {
    values: Array1<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Result<Self, VectorError> {
        if values.is_empty() {
            return Err(VectorError::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(VectorError::NonFinite { index });
        }
        Ok(Self {
            values: Array1::from(values),
        })
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        // Array1 built from a Vec is always contiguous
        self.values.as_slice().unwrap_or(&[])
    }

    /// Euclidean (L2) distance to `other`
    pub fn euclidean_distance(&self, other: &FeatureVector) -> Result<f32, DimensionMismatch> {
        if self.dimension() != other.dimension() {
            return Err(DimensionMismatch {
                expected: self.dimension(),
                found: other.dimension(),
            });
        }
        let sum: f32 = ndarray::Zip::from(&self.values)
            .and(&other.values)
            .fold(0.0, |acc, a, b| acc + (a - b) * (a - b));
        Ok(sum.sqrt())
    }
}

impl TryFrom<Vec<f32>> for FeatureVector {
    type Error = VectorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<FeatureVector> for Vec<f32> {
    fn from(vector: FeatureVector) -> Self {
        vector.values.to_vec()
    }
}
