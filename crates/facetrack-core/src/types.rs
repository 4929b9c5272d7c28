use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Embedding dimensionality produced by the ArcFace-class extractors we deploy against.
pub const DEFAULT_EMBEDDING_DIM: usize = 512;

/// Opaque key of a person record held by the relational store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub i64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a single enrolled embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnrollmentId(pub Uuid);

impl EnrollmentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EnrollmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnrollmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EnrollmentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Membership criterion for a scan, e.g. a module code such as `SCSB082`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(pub String);

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Scope {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where a vector came from, so validation failures point at the corrupt record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrigin {
    Probe,
    Ingest { identity: IdentityId },
    Enrollment { identity: IdentityId, enrollment: EnrollmentId },
}

impl fmt::Display for VectorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Probe => f.write_str("probe"),
            Self::Ingest { identity } => write!(f, "new enrollment for identity {identity}"),
            Self::Enrollment { identity, enrollment } => {
                write!(f, "enrollment {enrollment} of identity {identity}")
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorError {
    #[error("dimension mismatch in {origin}: got {got}, want {want}")]
    DimensionMismatch {
        origin: VectorOrigin,
        got: usize,
        want: usize,
    },
    #[error("invalid vector in {origin}: component {index} is not finite")]
    InvalidVector { origin: VectorOrigin, index: usize },
}

impl VectorError {
    /// Which vector failed validation.
    pub fn origin(&self) -> VectorOrigin {
        match self {
            Self::DimensionMismatch { origin, .. } | Self::InvalidVector { origin, .. } => *origin,
        }
    }
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Check length against `want` and reject NaN/infinite components.
    pub fn validate(&self, want: usize, origin: VectorOrigin) -> Result<(), VectorError> {
        if self.values.len() != want {
            return Err(VectorError::DimensionMismatch {
                origin,
                got: self.values.len(),
                want,
            });
        }
        if let Some(index) = self.values.iter().position(|v| !v.is_finite()) {
            return Err(VectorError::InvalidVector { origin, index });
        }
        Ok(())
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Zero vectors score 0.
    /// Accumulates in f64, so an embedding compared with itself yields exactly 1.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (f64::from(*a), f64::from(*b));
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = (norm_a * norm_b).sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0) as f32
        } else {
            0.0
        }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (f64::from(*a) - f64::from(*b)).powi(2))
            .sum::<f64>()
            .sqrt() as f32
    }
}

/// One enrolled embedding owned by an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub identity: IdentityId,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
}

/// Entry of a candidate set: one enrollment's embedding tagged with its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub identity: IdentityId,
    pub enrollment: EnrollmentId,
    pub embedding: Embedding,
}

impl From<Enrollment> for Candidate {
    fn from(e: Enrollment) -> Self {
        Self {
            identity: e.identity,
            enrollment: e.id,
            embedding: e.embedding,
        }
    }
}

/// Result of matching a probe embedding against a candidate set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Best-ranked identity, set only when accepted.
    pub identity: Option<IdentityId>,
    /// Distance of the best-ranked identity (`+inf` for an empty candidate set).
    pub score: f32,
    /// Distance of the runner-up identity (`+inf` if there is none).
    pub runner_up: f32,
    pub accepted: bool,
}

impl MatchResult {
    /// Unknown or ambiguous probe.
    pub fn unknown(score: f32, runner_up: f32) -> Self {
        Self {
            identity: None,
            score,
            runner_up,
            accepted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        let b = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_self_is_exact() {
        let a = emb(&[0.31, -0.72, 0.05, 0.9, -0.11]);
        assert_eq!(a.similarity(&a), 1.0);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_validate_dimension() {
        let err = emb(&[1.0, 2.0]).validate(3, VectorOrigin::Probe).unwrap_err();
        assert_eq!(
            err,
            VectorError::DimensionMismatch {
                origin: VectorOrigin::Probe,
                got: 2,
                want: 3
            }
        );
    }

    #[test]
    fn test_validate_non_finite() {
        let origin = VectorOrigin::Ingest {
            identity: IdentityId(7),
        };
        let err = emb(&[1.0, f32::NAN, f32::INFINITY])
            .validate(3, origin)
            .unwrap_err();
        assert_eq!(err, VectorError::InvalidVector { origin, index: 1 });
        assert!(err.to_string().contains("identity 7"));
    }

    #[test]
    fn test_enrollment_id_round_trip_through_str() {
        let id = EnrollmentId::new();
        let parsed: EnrollmentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
