pub mod face;
pub mod model;

// Re-export commonly used types
pub use face::{crop_region, BoundingBox, DimensionMismatch, FaceRegion, FeatureVector, VectorError};
pub use model::{EncodingExtractor, EstimatorFailure, ExtractionError, LivenessEstimator, LivenessScore};
