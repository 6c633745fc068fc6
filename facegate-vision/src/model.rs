//! Seams for the external models.
//!
//! Feature extraction and liveness classification run outside this workspace
//! (ONNX sessions, a remote service, a test double). Both are untrusted: any
//! error they report is isolated to the face region being processed.

use thiserror::Error;

use crate::face::{FaceRegion, FeatureVector};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("no face found in region")]
    NotFound,
    #[error("encoding extractor failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Error)]
#[error("liveness estimator failed: {0}")]
pub struct EstimatorFailure(pub String);

impl EstimatorFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Output of a liveness estimator for one face region
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LivenessScore {
    Live,
    Spoof,
    /// The estimator ran but could not decide
    Inconclusive,
    /// Probability in `[0, 1]` that the subject is live
    Confidence(f32),
}

/// Produces a face encoding for a cropped face region
pub trait EncodingExtractor {
    fn extract_encoding(&self, region: &FaceRegion) -> Result<FeatureVector, ExtractionError>;
}

/// Estimates whether a cropped face region shows a live subject
pub trait LivenessEstimator {
    fn estimate_liveness(&self, region: &FaceRegion) -> Result<LivenessScore, EstimatorFailure>;
}

impl<F> EncodingExtractor for F
where
    F: Fn(&FaceRegion) -> Result<FeatureVector, ExtractionError>,
{
    fn extract_encoding(&self, region: &FaceRegion) -> Result<FeatureVector, ExtractionError> {
        self(region)
    }
}

impl<F> LivenessEstimator for F
where
    F: Fn(&FaceRegion) -> Result<LivenessScore, EstimatorFailure>,
{
    fn estimate_liveness(&self, region: &FaceRegion) -> Result<LivenessScore, EstimatorFailure> {
        self(region)
    }
}
