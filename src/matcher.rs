use serde::Serialize;

use crate::error::AuthResult;
use crate::storage::EnrollmentRecord;
use crate::FeatureVector;

/// Decision for one live encoding against the enrolled set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    pub name: Option<String>,
    /// Distance to the nearest candidate; infinite when there were none
    pub distance: f32,
}

impl MatchResult {
    pub fn unmatched(distance: f32) -> Self {
        Self {
            matched: false,
            name: None,
            distance,
        }
    }
}

pub trait MatchEngine {
    fn best_match(
        &self,
        live: &FeatureVector,
        candidates: &[EnrollmentRecord],
        threshold: f32,
    ) -> AuthResult<MatchResult>;
}

/// Nearest-neighbour matching under Euclidean distance.
///
/// Every candidate is scored; the closest one wins if it is within
/// `threshold`. Ties go to the earliest candidate in store order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl MatchEngine for EuclideanMatcher {
    fn best_match(
        &self,
        live: &FeatureVector,
        candidates: &[EnrollmentRecord],
        threshold: f32,
    ) -> AuthResult<MatchResult> {
        let mut best: Option<(&EnrollmentRecord, f32)> = None;
        for candidate in candidates {
            let distance = live.euclidean_distance(&candidate.encoding)?;
            match best {
                // strict comparison keeps the first of equal distances
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((candidate, distance)),
            }
        }

        Ok(match best {
            Some((record, distance)) if distance <= threshold => MatchResult {
                matched: true,
                name: Some(record.name.clone()),
                distance,
            },
            Some((_, distance)) => MatchResult::unmatched(distance),
            None => MatchResult::unmatched(f32::INFINITY),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;

    fn record(name: &str, values: &[f32]) -> EnrollmentRecord {
        EnrollmentRecord::new(name, FeatureVector::new(values.to_vec()).unwrap())
    }

    fn live(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec()).unwrap()
    }

    #[test]
    fn empty_candidates_never_match() {
        let result = EuclideanMatcher
            .best_match(&live(&[0.3, 0.4]), &[], 0.6)
            .unwrap();
        assert!(!result.matched);
        assert_eq!(result.name, None);
        assert_eq!(result.distance, f32::INFINITY);
    }

    #[test]
    fn picks_nearest_not_first_under_threshold() {
        let candidates = [
            record("far", &[0.5, 0.0]),
            record("near", &[0.1, 0.0]),
            record("mid", &[0.3, 0.0]),
        ];
        let result = EuclideanMatcher
            .best_match(&live(&[0.0, 0.0]), &candidates, 0.6)
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.name.as_deref(), Some("near"));
        assert!((result.distance - 0.1).abs() < 1e-6);
    }

    #[test]
    fn nearest_beyond_threshold_is_unmatched() {
        let candidates = [record("alice", &[3.0, 4.0]), record("bob", &[6.0, 8.0])];
        let result = EuclideanMatcher
            .best_match(&live(&[0.0, 0.0]), &candidates, 0.6)
            .unwrap();
        assert!(!result.matched);
        assert_eq!(result.name, None);
        assert!((result.distance - 5.0).abs() < 1e-6);
    }

    #[test]
    fn distance_equal_to_threshold_matches() {
        let candidates = [record("alice", &[0.0, 0.5])];
        let result = EuclideanMatcher
            .best_match(&live(&[0.0, 0.0]), &candidates, 0.5)
            .unwrap();
        assert!(result.matched);
    }

    #[test]
    fn ties_resolve_to_first_in_store_order() {
        let candidates = [
            record("first", &[1.0, 0.0]),
            record("second", &[0.0, 1.0]),
            record("third", &[-1.0, 0.0]),
        ];
        for _ in 0..3 {
            let result = EuclideanMatcher
                .best_match(&live(&[0.0, 0.0]), &candidates, 2.0)
                .unwrap();
            assert_eq!(result.name.as_deref(), Some("first"));
        }
    }

    #[test]
    fn repeated_calls_are_identical() {
        let candidates = [
            record("alice", &[0.12, 0.7, -0.3]),
            record("bob", &[0.4, 0.1, 0.9]),
        ];
        let probe = live(&[0.2, 0.6, -0.2]);
        let first = EuclideanMatcher.best_match(&probe, &candidates, 0.6).unwrap();
        let second = EuclideanMatcher.best_match(&probe, &candidates, 0.6).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let candidates = [record("alice", &[0.0, 0.0]), record("bob", &[0.0, 0.0, 0.0])];
        let err = EuclideanMatcher
            .best_match(&live(&[0.0, 0.0]), &candidates, 0.6)
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::DimensionMismatch {
                expected: 2,
                found: 3
            }
        ));
    }
}
