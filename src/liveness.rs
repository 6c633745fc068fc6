use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::{FaceRegion, LivenessEstimator, LivenessScore};

pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Binary admit/reject decision on top of a liveness estimator.
///
/// Fail-closed: an estimator error, panic, inconclusive answer or
/// out-of-range confidence rejects the region.
///
/// The estimator runs synchronously on the caller's thread and is never
/// interrupted. The timeout is checked once the call returns: an answer that
/// arrived later than `timeout` is discarded as a reject. A hung estimator
/// therefore blocks the frame until it returns.
pub struct LivenessGate {
    estimator: Box<dyn LivenessEstimator>,
    min_confidence: f32,
    timeout: Duration,
}

impl LivenessGate {
    pub fn new(estimator: impl LivenessEstimator + 'static) -> Self {
        Self {
            estimator: Box::new(estimator),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn admit(&self, region: &FaceRegion) -> bool {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.estimator.estimate_liveness(region)
        }));
        let elapsed = started.elapsed();

        let score = match outcome {
            Ok(Ok(score)) => score,
            Ok(Err(err)) => {
                warn!("Liveness rejected for {:?}: {}", region.bbox, err);
                return false;
            }
            Err(_) => {
                warn!("Liveness rejected for {:?}: estimator panicked", region.bbox);
                return false;
            }
        };
        if elapsed > self.timeout {
            warn!(
                "Liveness rejected for {:?}: estimator took {:?} (limit {:?})",
                region.bbox, elapsed, self.timeout
            );
            return false;
        }

        let admitted = match score {
            LivenessScore::Live => true,
            LivenessScore::Spoof | LivenessScore::Inconclusive => false,
            LivenessScore::Confidence(c) if (0.0..=1.0).contains(&c) => c >= self.min_confidence,
            LivenessScore::Confidence(_) => false,
        };
        debug!(
            "Liveness {:?} for {:?}: {}",
            score,
            region.bbox,
            if admitted { "admitted" } else { "rejected" }
        );
        admitted
    }
}

impl std::fmt::Debug for LivenessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessGate")
            .field("min_confidence", &self.min_confidence)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
