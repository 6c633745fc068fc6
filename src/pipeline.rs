use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::audit::{AuditEntry, AuditOutcome, AuditSink, FileAuditLog};
use crate::config::Config;
use crate::error::{AuthResult, EnrollError};
use crate::keys::KeyManager;
use crate::liveness::LivenessGate;
use crate::matcher::{EuclideanMatcher, MatchEngine, MatchResult};
use crate::storage::{EnrollmentRecord, TemplateStore};
use crate::{
    BoundingBox, EncodingExtractor, ExtractionError, FaceRegion, FeatureVector, LivenessEstimator,
};

/// Terminal state of one face region in one frame
#[derive(Debug, Clone, PartialEq)]
pub enum RegionOutcome {
    Matched(MatchResult),
    Unmatched(MatchResult),
    /// Liveness gate refused the region; matching never ran
    Rejected,
    /// Extractor found no usable face in the region
    NoEncoding,
}

impl RegionOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, RegionOutcome::Matched(_))
    }

    /// Flatten to a match result for overlay drawing. Anything other than a
    /// match reads as unmatched.
    pub fn match_result(&self) -> MatchResult {
        match self {
            RegionOutcome::Matched(result) | RegionOutcome::Unmatched(result) => result.clone(),
            RegionOutcome::Rejected | RegionOutcome::NoEncoding => {
                MatchResult::unmatched(f32::INFINITY)
            }
        }
    }
}

/// Liveness → match → audit, one face region at a time.
///
/// Holds no state between frames. The grant/deny decision for a region is
/// final before its audit entry is written; a failed write is logged and
/// does not change the decision.
pub struct AuthPipeline {
    store: Arc<TemplateStore>,
    extractor: Box<dyn EncodingExtractor>,
    liveness: LivenessGate,
    matcher: Box<dyn MatchEngine>,
    audit: Box<dyn AuditSink>,
    threshold: f32,
}

impl AuthPipeline {
    pub fn new(
        store: Arc<TemplateStore>,
        extractor: impl EncodingExtractor + 'static,
        liveness: LivenessGate,
        audit: impl AuditSink + 'static,
    ) -> Self {
        Self {
            store,
            extractor: Box::new(extractor),
            liveness,
            matcher: Box::new(EuclideanMatcher),
            audit: Box::new(audit),
            threshold: 0.6,
        }
    }

    /// Wire up key, store, gate and audit log from configuration
    pub fn from_config(
        cfg: &Config,
        extractor: impl EncodingExtractor + 'static,
        estimator: impl LivenessEstimator + 'static,
    ) -> AuthResult<Self> {
        let keys = KeyManager::new(&cfg.key_file);
        let key = keys.get_or_create_key()?.clone();
        let store = TemplateStore::open(&cfg.store_file, key)?;
        let liveness = LivenessGate::new(estimator)
            .with_min_confidence(cfg.liveness_min_confidence)
            .with_timeout(cfg.liveness_timeout());
        Ok(Self::new(
            Arc::new(store),
            extractor,
            liveness,
            FileAuditLog::new(&cfg.audit_log),
        )
        .with_threshold(cfg.threshold))
    }

    pub fn with_matcher(mut self, matcher: impl MatchEngine + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn store(&self) -> &TemplateStore {
        &self.store
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Run every detected region of a frame to a decision, in detection order
    pub fn process_frame(&self, regions: &[FaceRegion]) -> Vec<(BoundingBox, RegionOutcome)> {
        regions
            .iter()
            .map(|region| {
                let outcome = match self.extract(region) {
                    Some(encoding) => self.evaluate(region, &encoding),
                    None => RegionOutcome::NoEncoding,
                };
                (region.bbox, outcome)
            })
            .collect()
    }

    /// Decide a region whose encoding is already known
    pub fn evaluate(&self, region: &FaceRegion, encoding: &FeatureVector) -> RegionOutcome {
        if !self.liveness.admit(region) {
            self.audit(AuditOutcome::LivenessRejected);
            return RegionOutcome::Rejected;
        }

        let snapshot = self.store.snapshot();
        let outcome = match self
            .matcher
            .best_match(encoding, snapshot.records(), self.threshold)
        {
            Ok(result) if result.matched => RegionOutcome::Matched(result),
            Ok(result) => RegionOutcome::Unmatched(result),
            Err(err) => {
                error!("Matching failed for {:?}: {}", region.bbox, err);
                RegionOutcome::Unmatched(MatchResult::unmatched(f32::INFINITY))
            }
        };

        match &outcome {
            RegionOutcome::Matched(MatchResult {
                name: Some(name), ..
            }) => self.audit(AuditOutcome::Granted(name.clone())),
            _ => self.audit(AuditOutcome::Denied),
        }
        outcome
    }

    /// Enroll the face in `region` under `name` and record it in the audit log
    pub fn enroll(&self, name: &str, region: &FaceRegion) -> Result<EnrollmentRecord, EnrollError> {
        let record = self.store.enroll(name, region, self.extractor.as_ref())?;
        self.audit(AuditOutcome::Enrolled(record.name.clone()));
        Ok(record)
    }

    pub fn remove(&self, id: uuid::Uuid) -> AuthResult<EnrollmentRecord> {
        let record = self.store.remove(id)?;
        self.audit(AuditOutcome::Removed(record.name.clone()));
        Ok(record)
    }

    /// Delete every enrollment under `name`, auditing each removal
    pub fn remove_by_name(&self, name: &str) -> AuthResult<usize> {
        let removed = self.store.remove_by_name(name)?;
        for record in &removed {
            self.audit(AuditOutcome::Removed(record.name.clone()));
        }
        Ok(removed.len())
    }

    fn extract(&self, region: &FaceRegion) -> Option<FeatureVector> {
        let extracted = panic::catch_unwind(AssertUnwindSafe(|| {
            self.extractor.extract_encoding(region)
        }));
        match extracted {
            Ok(Ok(encoding)) => Some(encoding),
            Ok(Err(ExtractionError::NotFound)) => {
                debug!("No encoding for region {:?}", region.bbox);
                None
            }
            Ok(Err(err)) => {
                warn!("Skipping region {:?}: {}", region.bbox, err);
                None
            }
            Err(_) => {
                warn!("Skipping region {:?}: extractor panicked", region.bbox);
                None
            }
        }
    }

    fn audit(&self, outcome: AuditOutcome) {
        match &outcome {
            AuditOutcome::Denied | AuditOutcome::LivenessRejected => warn!("{outcome}"),
            _ => info!("{outcome}"),
        }
        if let Err(err) = self.audit.record(&AuditEntry::now(outcome)) {
            warn!("Failed to write audit entry: {err}");
        }
    }
}

impl std::fmt::Debug for AuthPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPipeline")
            .field("store", &self.store)
            .field("liveness", &self.liveness)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}
