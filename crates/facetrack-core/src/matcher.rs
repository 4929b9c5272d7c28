//! Nearest-identity matching with accept and margin rejection.

use crate::types::{Candidate, Embedding, IdentityId, MatchResult, VectorError, VectorOrigin};
use crate::DEFAULT_EMBEDDING_DIM;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_ACCEPT_THRESHOLD: f32 = 0.60;
const DEFAULT_MARGIN_THRESHOLD: f32 = 0.08;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("embedding dimension must be positive")]
    ZeroDimension,
    #[error("{name} threshold must be finite and non-negative, got {value}")]
    BadThreshold { name: &'static str, value: f32 },
    #[error("unknown metric: {0} (expected cosine or euclidean)")]
    UnknownMetric(String),
}

/// Distance metric shared by every comparison in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `1 - cosine_similarity`, in [0, 2].
    #[default]
    Cosine,
    /// L2 distance, unbounded.
    Euclidean,
}

impl Metric {
    pub fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            Self::Cosine => 1.0 - a.similarity(b),
            Self::Euclidean => a.euclidean_distance(b),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cosine => f.write_str("cosine"),
            Self::Euclidean => f.write_str("euclidean"),
        }
    }
}

impl FromStr for Metric {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "euclidean" | "l2" => Ok(Self::Euclidean),
            other => Err(PolicyError::UnknownMetric(other.to_string())),
        }
    }
}

/// Match configuration. Thresholds are in the metric's distance units and
/// must be tuned against the extractor's embedding space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    pub dimension: usize,
    pub metric: Metric,
    /// Largest distance at which the best identity may be accepted.
    pub accept_threshold: f32,
    /// Minimum gap between the best and runner-up identity.
    pub margin_threshold: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_EMBEDDING_DIM,
            metric: Metric::Cosine,
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            margin_threshold: DEFAULT_MARGIN_THRESHOLD,
        }
    }
}

impl MatchPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.dimension == 0 {
            return Err(PolicyError::ZeroDimension);
        }
        for (name, value) in [
            ("accept", self.accept_threshold),
            ("margin", self.margin_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(PolicyError::BadThreshold { name, value });
            }
        }
        Ok(())
    }
}

/// Best-case distance from a probe to one identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IdentityScore {
    pub identity: IdentityId,
    pub distance: f32,
}

/// Strategy for comparing a probe embedding against a candidate set.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        candidates: &[Candidate],
    ) -> Result<MatchResult, VectorError>;
}

/// Ranks identities by their closest enrollment and accepts the winner only
/// when it is both close enough and clearly separated from the runner-up.
#[derive(Debug, Clone)]
pub struct ThresholdMatcher {
    policy: MatchPolicy,
}

impl ThresholdMatcher {
    pub fn new(policy: MatchPolicy) -> Result<Self, PolicyError> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Per-identity minimum distance, ascending. Ties keep candidate order.
    ///
    /// Every candidate is checked against the policy dimension before any
    /// distance is taken; the first bad one is reported with its owner.
    pub fn rank(
        &self,
        probe: &Embedding,
        candidates: &[Candidate],
    ) -> Result<Vec<IdentityScore>, VectorError> {
        probe.validate(self.policy.dimension, VectorOrigin::Probe)?;
        for c in candidates {
            c.embedding.validate(
                self.policy.dimension,
                VectorOrigin::Enrollment {
                    identity: c.identity,
                    enrollment: c.enrollment,
                },
            )?;
        }

        let mut scores: Vec<IdentityScore> = Vec::new();
        let mut slots: HashMap<IdentityId, usize> = HashMap::new();

        for c in candidates {
            let distance = self.policy.metric.distance(probe, &c.embedding);
            match slots.entry(c.identity) {
                Entry::Occupied(slot) => {
                    let score = &mut scores[*slot.get()];
                    if distance < score.distance {
                        score.distance = distance;
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(scores.len());
                    scores.push(IdentityScore {
                        identity: c.identity,
                        distance,
                    });
                }
            }
        }

        scores.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Ok(scores)
    }
}

impl Matcher for ThresholdMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        candidates: &[Candidate],
    ) -> Result<MatchResult, VectorError> {
        if candidates.is_empty() {
            return Ok(MatchResult::unknown(f32::INFINITY, f32::INFINITY));
        }

        let ranked = self.rank(probe, candidates)?;
        let Some(best) = ranked.first().copied() else {
            return Ok(MatchResult::unknown(f32::INFINITY, f32::INFINITY));
        };
        let second = ranked.get(1).map_or(f32::INFINITY, |s| s.distance);

        let close_enough = best.distance <= self.policy.accept_threshold;
        let separated =
            second.is_infinite() || second - best.distance >= self.policy.margin_threshold;

        tracing::debug!(
            identity = %best.identity,
            best = best.distance,
            second,
            identities = ranked.len(),
            close_enough,
            separated,
            "ranked probe"
        );

        if close_enough && separated {
            Ok(MatchResult {
                identity: Some(best.identity),
                score: best.distance,
                runner_up: second,
                accepted: true,
            })
        } else {
            Ok(MatchResult::unknown(best.distance, second))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnrollmentId;

    fn unit(angle: f32) -> Embedding {
        Embedding::new(vec![angle.cos(), angle.sin()])
    }

    fn candidate(identity: i64, embedding: Embedding) -> Candidate {
        Candidate {
            identity: IdentityId(identity),
            enrollment: EnrollmentId::new(),
            embedding,
        }
    }

    fn matcher(accept: f32, margin: f32) -> ThresholdMatcher {
        ThresholdMatcher::new(MatchPolicy {
            dimension: 2,
            metric: Metric::Cosine,
            accept_threshold: accept,
            margin_threshold: margin,
        })
        .unwrap()
    }

    #[test]
    fn test_distance_reflexive() {
        let samples = [
            Embedding::new(vec![0.25, -0.5, 0.125, 3.0]),
            Embedding::new(vec![1e-3, 7.0, -7.0, 0.33]),
            Embedding::new(vec![0.0, 0.0, 0.0, 1.0]),
        ];
        for e in &samples {
            assert_eq!(Metric::Cosine.distance(e, e), 0.0);
            assert_eq!(Metric::Euclidean.distance(e, e), 0.0);
        }
    }

    #[test]
    fn test_accepts_clear_winner() {
        // distance(p, A) = 0.1, distance(p, B) = 0.6
        let a = 0.9f32.acos();
        let b = -(0.4f32.acos());
        let gallery = vec![candidate(1, unit(a)), candidate(2, unit(b))];

        let result = matcher(0.35, 0.1).compare(&unit(0.0), &gallery).unwrap();
        assert!(result.accepted);
        assert_eq!(result.identity, Some(IdentityId(1)));
        assert!((result.score - 0.1).abs() < 1e-4);
        assert!((result.runner_up - 0.6).abs() < 1e-4);
    }

    #[test]
    fn test_rejects_ambiguous_probe() {
        // distance(p, A) = 0.2, distance(p, B) = 0.25: margin 0.05 < 0.1
        let a = 0.8f32.acos();
        let b = -(0.75f32.acos());
        let gallery = vec![candidate(1, unit(a)), candidate(2, unit(b))];

        let result = matcher(0.35, 0.1).compare(&unit(0.0), &gallery).unwrap();
        assert!(!result.accepted);
        assert_eq!(result.identity, None);
        assert!((result.score - 0.2).abs() < 1e-4);
    }

    #[test]
    fn test_rejects_distant_probe() {
        let gallery = vec![candidate(1, unit(1.2)), candidate(2, unit(-2.5))];
        let result = matcher(0.35, 0.1).compare(&unit(0.0), &gallery).unwrap();
        assert!(!result.accepted);
        assert!(result.score > 0.35);
    }

    #[test]
    fn test_single_identity_skips_margin() {
        let gallery = vec![candidate(1, unit(0.1)), candidate(1, unit(0.2))];
        let result = matcher(0.35, 10.0).compare(&unit(0.0), &gallery).unwrap();
        assert!(result.accepted);
        assert_eq!(result.identity, Some(IdentityId(1)));
        assert!(result.runner_up.is_infinite());
    }

    #[test]
    fn test_single_identity_still_needs_accept_threshold() {
        let gallery = vec![candidate(1, unit(1.5))];
        let result = matcher(0.35, 0.0).compare(&unit(0.0), &gallery).unwrap();
        assert!(!result.accepted);
    }

    #[test]
    fn test_identity_scored_by_best_enrollment() {
        // Identity 1 has one bad photo and one good one; identity 2 sits between.
        let gallery = vec![
            candidate(1, unit(2.0)),
            candidate(2, unit(0.5)),
            candidate(1, unit(0.05)),
        ];
        let m = matcher(0.35, 0.05);
        let ranked = m.rank(&unit(0.0), &gallery).unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].identity, IdentityId(1));
        assert!((ranked[0].distance - (1.0 - 0.05f32.cos())).abs() < 1e-6);

        let result = m.compare(&unit(0.0), &gallery).unwrap();
        assert_eq!(result.identity, Some(IdentityId(1)));
    }

    #[test]
    fn test_empty_candidates() {
        let result = matcher(0.35, 0.1).compare(&unit(0.0), &[]).unwrap();
        assert!(!result.accepted);
        assert_eq!(result.identity, None);
        assert!(result.score.is_infinite());
    }

    #[test]
    fn test_tied_identities_rejected() {
        let gallery = vec![candidate(1, unit(0.1)), candidate(2, unit(-0.1))];
        let result = matcher(0.35, 0.01).compare(&unit(0.0), &gallery).unwrap();
        assert!(!result.accepted);
    }

    #[test]
    fn test_corrupt_enrollment_attributed() {
        let bad = candidate(9, Embedding::new(vec![1.0, 0.0, 0.0]));
        let bad_id = bad.enrollment;
        let gallery = vec![candidate(1, unit(0.1)), bad];

        let err = matcher(0.35, 0.1).compare(&unit(0.0), &gallery).unwrap_err();
        assert_eq!(
            err,
            VectorError::DimensionMismatch {
                origin: VectorOrigin::Enrollment {
                    identity: IdentityId(9),
                    enrollment: bad_id,
                },
                got: 3,
                want: 2,
            }
        );
    }

    #[test]
    fn test_bad_probe_rejected_before_comparison() {
        let gallery = vec![candidate(1, unit(0.1))];
        let probe = Embedding::new(vec![f32::NAN, 1.0]);
        let err = matcher(0.35, 0.1).compare(&probe, &gallery).unwrap_err();
        assert!(matches!(
            err,
            VectorError::InvalidVector {
                origin: VectorOrigin::Probe,
                index: 0
            }
        ));
    }

    #[test]
    fn test_accepted_results_respect_thresholds() {
        let accept = 0.3;
        let margin = 0.05;
        let m = matcher(accept, margin);
        let gallery: Vec<Candidate> = (0..12)
            .map(|i| candidate(i % 4, unit(i as f32 * 0.53)))
            .collect();

        for step in 0..64 {
            let probe = unit(step as f32 * 0.1);
            let result = m.compare(&probe, &gallery).unwrap();
            if result.accepted {
                assert!(result.score <= accept);
                assert!(result.runner_up - result.score >= margin);
            }
        }
    }

    #[test]
    fn test_policy_validation() {
        let mut policy = MatchPolicy::default();
        assert!(policy.validate().is_ok());
        policy.margin_threshold = -0.1;
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::BadThreshold { name: "margin", .. })
        ));
        policy.margin_threshold = 0.1;
        policy.dimension = 0;
        assert_eq!(policy.validate(), Err(PolicyError::ZeroDimension));
    }

    #[test]
    fn test_metric_from_str() {
        assert_eq!("Cosine".parse::<Metric>().unwrap(), Metric::Cosine);
        assert_eq!("l2".parse::<Metric>().unwrap(), Metric::Euclidean);
        assert!("manhattan".parse::<Metric>().is_err());
    }
}
