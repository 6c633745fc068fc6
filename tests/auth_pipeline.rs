use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use facegate::audit::{AuditEntry, AuditOutcome, AuditSink};
use facegate::keys::{EncryptionKey, KEY_LEN};
use facegate::liveness::LivenessGate;
use facegate::matcher::{EuclideanMatcher, MatchEngine, MatchResult};
use facegate::storage::{EnrollmentRecord, TemplateStore};
use facegate::{
    AuthPipeline, AuthResult, BoundingBox, EnrollError, EstimatorFailure, ExtractionError,
    FaceRegion, FeatureVector, LivenessScore, RegionOutcome,
};
use image::RgbImage;
use tempfile::TempDir;

const E1: [f32; 4] = [0.1, 0.2, 0.3, 0.4];
const E2: [f32; 4] = [1.1, 1.2, 1.3, 1.4];

#[derive(Default)]
struct MemorySink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemorySink {
    fn outcomes(&self) -> Vec<AuditOutcome> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.outcome.clone())
            .collect()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, entry: &AuditEntry) -> AuthResult<()> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

struct CountingMatcher {
    calls: Arc<AtomicUsize>,
}

impl MatchEngine for CountingMatcher {
    fn best_match(
        &self,
        live: &FeatureVector,
        candidates: &[EnrollmentRecord],
        threshold: f32,
    ) -> AuthResult<MatchResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        EuclideanMatcher.best_match(live, candidates, threshold)
    }
}

struct Harness {
    _tmp: TempDir,
    pipeline: AuthPipeline,
    audit: Arc<MemorySink>,
    calls: Arc<AtomicUsize>,
    live: Arc<AtomicBool>,
}

/// Extractor keyed on the region's left edge:
/// 0 → E1, 100 → E2, 200 → no face, anything else panics.
fn extract_by_position(region: &FaceRegion) -> Result<FeatureVector, ExtractionError> {
    match region.bbox.left {
        0 => Ok(FeatureVector::new(E1.to_vec()).unwrap()),
        100 => Ok(FeatureVector::new(E2.to_vec()).unwrap()),
        200 => Err(ExtractionError::NotFound),
        _ => panic!("extractor crashed"),
    }
}

fn harness() -> Result<Harness> {
    env_logger::try_init().ok();
    let tmp = TempDir::new()?;
    let store = TemplateStore::open(
        tmp.path().join("faces.enc"),
        EncryptionKey::from_bytes([0x5A; KEY_LEN]),
    )?;

    let audit = Arc::new(MemorySink::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let live = Arc::new(AtomicBool::new(true));

    let live_flag = live.clone();
    let gate = LivenessGate::new(
        move |_: &FaceRegion| -> Result<LivenessScore, EstimatorFailure> {
            if live_flag.load(Ordering::SeqCst) {
                Ok(LivenessScore::Live)
            } else {
                Err(EstimatorFailure::new("emotion analysis failed"))
            }
        },
    );

    let pipeline = AuthPipeline::new(Arc::new(store), extract_by_position, gate, audit.clone())
        .with_matcher(CountingMatcher {
            calls: calls.clone(),
        })
        .with_threshold(0.6);

    Ok(Harness {
        _tmp: tmp,
        pipeline,
        audit,
        calls,
        live,
    })
}

fn region_at(left: u32) -> FaceRegion {
    FaceRegion::new(BoundingBox::new(left, 0, left + 8, 8), RgbImage::new(8, 8))
}

#[test]
fn test_enroll_then_match_unmatch_and_reject() -> Result<()> {
    let h = harness()?;

    let record = h.pipeline.enroll("Alice", &region_at(0))?;
    assert_eq!(record.name, "Alice");

    // Exact encoding, live subject
    let decisions = h.pipeline.process_frame(&[region_at(0)]);
    assert_eq!(decisions.len(), 1);
    match &decisions[0].1 {
        RegionOutcome::Matched(result) => {
            assert_eq!(result.name.as_deref(), Some("Alice"));
            assert_eq!(result.distance, 0.0);
        }
        other => panic!("expected a match, got {other:?}"),
    }

    // Encoding far beyond the threshold
    let decisions = h.pipeline.process_frame(&[region_at(100)]);
    match &decisions[0].1 {
        RegionOutcome::Unmatched(result) => {
            assert!(!result.matched);
            assert!(result.distance > 0.6);
        }
        other => panic!("expected no match, got {other:?}"),
    }
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);

    // Liveness fails: matcher must not run at all
    h.live.store(false, Ordering::SeqCst);
    let decisions = h.pipeline.process_frame(&[region_at(0)]);
    assert_eq!(decisions[0].1, RegionOutcome::Rejected);
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);

    assert_eq!(
        h.audit.outcomes(),
        vec![
            AuditOutcome::Enrolled("Alice".into()),
            AuditOutcome::Granted("Alice".into()),
            AuditOutcome::Denied,
            AuditOutcome::LivenessRejected,
        ]
    );
    Ok(())
}

#[test]
fn test_rejected_region_matches_nothing_even_when_store_is_empty() -> Result<()> {
    let h = harness()?;
    h.live.store(false, Ordering::SeqCst);

    let decisions = h.pipeline.process_frame(&[region_at(0)]);
    assert_eq!(decisions[0].1, RegionOutcome::Rejected);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn test_empty_store_denies_live_face() -> Result<()> {
    let h = harness()?;

    let decisions = h.pipeline.process_frame(&[region_at(0)]);
    match &decisions[0].1 {
        RegionOutcome::Unmatched(result) => assert_eq!(result.distance, f32::INFINITY),
        other => panic!("expected no match, got {other:?}"),
    }
    assert_eq!(h.audit.outcomes(), vec![AuditOutcome::Denied]);
    Ok(())
}

#[test]
fn test_region_failures_are_isolated_within_a_frame() -> Result<()> {
    let h = harness()?;
    h.pipeline.enroll("Alice", &region_at(0))?;

    let frame = [region_at(200), region_at(300), region_at(0), region_at(100)];
    let decisions = h.pipeline.process_frame(&frame);

    let boxes: Vec<_> = decisions.iter().map(|(bbox, _)| bbox.left).collect();
    assert_eq!(boxes, [200, 300, 0, 100]);
    assert_eq!(decisions[0].1, RegionOutcome::NoEncoding);
    assert_eq!(decisions[1].1, RegionOutcome::NoEncoding);
    assert!(decisions[2].1.is_granted());
    assert!(matches!(decisions[3].1, RegionOutcome::Unmatched(_)));

    // Enrollment plus one entry per decided region
    assert_eq!(
        h.audit.outcomes(),
        vec![
            AuditOutcome::Enrolled("Alice".into()),
            AuditOutcome::Granted("Alice".into()),
            AuditOutcome::Denied,
        ]
    );
    Ok(())
}

#[test]
fn test_nearest_enrollment_wins_over_earlier_close_one() -> Result<()> {
    let h = harness()?;
    let store = h.pipeline.store();
    // Within threshold of E1 but not the closest
    store.append(EnrollmentRecord::new(
        "Bob",
        FeatureVector::new(vec![0.3, 0.4, 0.5, 0.6])?,
    ))?;
    h.pipeline.enroll("Alice", &region_at(0))?;

    let decisions = h.pipeline.process_frame(&[region_at(0)]);
    assert_eq!(
        decisions[0].1.match_result().name.as_deref(),
        Some("Alice")
    );
    Ok(())
}

#[test]
fn test_mismatched_live_dimension_is_denied() -> Result<()> {
    let h = harness()?;
    h.pipeline.enroll("Alice", &region_at(0))?;

    let short = FeatureVector::new(vec![0.1, 0.2])?;
    let outcome = h.pipeline.evaluate(&region_at(0), &short);

    assert!(!outcome.is_granted());
    assert_eq!(
        h.audit.outcomes().last(),
        Some(&AuditOutcome::Denied)
    );
    Ok(())
}

#[test]
fn test_enroll_with_crashing_extractor_is_an_error() -> Result<()> {
    let h = harness()?;

    // Left edge 300 makes the extractor panic
    let err = h.pipeline.enroll("Alice", &region_at(300)).unwrap_err();
    assert!(matches!(err, EnrollError::Extractor(_)), "{err:?}");
    assert!(h.pipeline.store().snapshot().is_empty());
    assert!(h.audit.outcomes().is_empty());
    Ok(())
}
