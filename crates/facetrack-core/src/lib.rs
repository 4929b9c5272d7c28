//! facetrack-core: face matching for attendance scans.
//!
//! Embeddings come from an external extractor. This crate stores them per
//! identity, assembles the candidate set for a class roster, and decides
//! which enrolled identity (if any) each captured probe belongs to.

pub mod extractor;
pub mod gallery;
pub mod matcher;
pub mod session;
pub mod store;
pub mod types;

pub use extractor::{EncodingResponse, ExtractionError};
pub use gallery::{Gallery, GalleryBuilder, GalleryError, MemoryRoster, RosterError, RosterSource};
pub use matcher::{IdentityScore, MatchPolicy, Matcher, Metric, PolicyError, ThresholdMatcher};
pub use session::{
    MatchSession, ProbeOutcome, ScanReport, ScanStats, SessionError, SessionOptions, SessionState,
};
pub use store::{MemoryStore, StoreError, VectorStore};
pub use types::{
    Candidate, Embedding, Enrollment, EnrollmentId, IdentityId, MatchResult, Scope, VectorError,
    VectorOrigin, DEFAULT_EMBEDDING_DIM,
};
