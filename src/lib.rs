pub mod audit;
pub mod config;
pub mod error;
pub mod identity;
pub mod keys;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod storage;

// Re-export vision types for convenience
pub use facegate_vision::{
    crop_region, face, model, BoundingBox, EncodingExtractor, EstimatorFailure, ExtractionError,
    FaceRegion, FeatureVector, LivenessEstimator, LivenessScore,
};

pub use error::{AuthError, AuthResult, EnrollError};
pub use pipeline::{AuthPipeline, RegionOutcome};
