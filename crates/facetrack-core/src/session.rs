//! One attendance-scan pass: `Idle -> Active -> Closed`.

use crate::extractor::ExtractionError;
use crate::gallery::{Gallery, GalleryBuilder, GalleryError};
use crate::matcher::{Matcher, ThresholdMatcher};
use crate::types::{Embedding, IdentityId, MatchResult, Scope, VectorError, VectorOrigin};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Active => f.write_str("active"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },
    #[error("session is closed")]
    SessionClosed,
    #[error("no enrolled faces for scope {scope} ({unenrolled} members have no registered face data)")]
    EmptyGallery { scope: Scope, unenrolled: usize },
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Vector(#[from] VectorError),
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Start a no-op scan instead of failing when the gallery is empty.
    pub allow_empty_gallery: bool,
}

/// What happened to one submitted capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// First acceptance of this identity in the session.
    Accepted {
        identity: IdentityId,
        score: f32,
        at: DateTime<Utc>,
    },
    /// Identity already recorded; nothing changed.
    Duplicate {
        identity: IdentityId,
        score: f32,
        first_seen: DateTime<Utc>,
    },
    /// Unknown or ambiguous face.
    Rejected { result: MatchResult },
    /// Extraction failed or returned an unusable vector; no probe this cycle.
    NoProbe,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub probes: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub extraction_failures: usize,
    /// Captures whose vector had the wrong length or non-finite components.
    pub invalid_captures: usize,
}

/// Final state of a closed session, handed to the attendance writer.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub scope: Scope,
    /// Identity -> first accepted timestamp.
    pub attendance: BTreeMap<IdentityId, DateTime<Utc>>,
    /// Identity -> distance of the accepting match.
    pub scores: BTreeMap<IdentityId, f32>,
    /// Roster members that were never accepted, in roster order.
    pub absent: Vec<IdentityId>,
    pub unenrolled: Vec<IdentityId>,
    pub stats: ScanStats,
}

/// Matches probes against a gallery fixed at `start`, counting each identity once.
pub struct MatchSession<M = ThresholdMatcher> {
    matcher: M,
    options: SessionOptions,
    state: SessionState,
    gallery: Option<Gallery>,
    accumulator: BTreeMap<IdentityId, (DateTime<Utc>, f32)>,
    stats: ScanStats,
}

impl<M: Matcher> MatchSession<M> {
    pub fn new(matcher: M, options: SessionOptions) -> Self {
        Self {
            matcher,
            options,
            state: SessionState::Idle,
            gallery: None,
            accumulator: BTreeMap::new(),
            stats: ScanStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn gallery(&self) -> Option<&Gallery> {
        self.gallery.as_ref()
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Build the gallery for `scope` and go active.
    pub fn start(
        &mut self,
        builder: &GalleryBuilder<'_>,
        scope: &Scope,
    ) -> Result<&Gallery, SessionError> {
        self.expect_idle()?;
        let gallery = builder.build(scope)?;
        self.activate(gallery)
    }

    /// Go active with an already-built gallery.
    pub fn activate(&mut self, gallery: Gallery) -> Result<&Gallery, SessionError> {
        self.expect_idle()?;
        if gallery.is_empty() && !self.options.allow_empty_gallery {
            return Err(SessionError::EmptyGallery {
                scope: gallery.scope().clone(),
                unenrolled: gallery.unenrolled().len(),
            });
        }

        tracing::info!(
            scope = %gallery.scope(),
            identities = gallery.identity_count(),
            candidates = gallery.candidates().len(),
            "scan session started"
        );

        self.accumulator.clear();
        self.stats = ScanStats::default();
        self.state = SessionState::Active;
        Ok(&*self.gallery.insert(gallery))
    }

    pub fn submit_probe(&mut self, probe: &Embedding) -> Result<ProbeOutcome, SessionError> {
        self.submit_probe_at(probe, Utc::now())
    }

    /// Match one probe captured at `at`.
    pub fn submit_probe_at(
        &mut self,
        probe: &Embedding,
        at: DateTime<Utc>,
    ) -> Result<ProbeOutcome, SessionError> {
        self.expect_active("submit a probe")?;
        let candidates = self
            .gallery
            .as_ref()
            .map(Gallery::candidates)
            .unwrap_or_default();
        let result = self.matcher.compare(probe, candidates)?;
        self.stats.probes += 1;

        let identity = match result.identity {
            Some(identity) if result.accepted => identity,
            _ => {
                self.stats.rejected += 1;
                tracing::debug!(score = result.score, "probe not recognized");
                return Ok(ProbeOutcome::Rejected { result });
            }
        };

        match self.accumulator.entry(identity) {
            Entry::Vacant(slot) => {
                slot.insert((at, result.score));
                self.stats.accepted += 1;
                tracing::info!(identity = %identity, score = result.score, "identity accepted");
                Ok(ProbeOutcome::Accepted {
                    identity,
                    score: result.score,
                    at,
                })
            }
            Entry::Occupied(slot) => {
                self.stats.duplicates += 1;
                tracing::debug!(identity = %identity, "duplicate match suppressed");
                Ok(ProbeOutcome::Duplicate {
                    identity,
                    score: result.score,
                    first_seen: slot.get().0,
                })
            }
        }
    }

    /// Feed the extractor's answer for one frame. Extraction failures and
    /// unusable vectors are counted and reported as [`ProbeOutcome::NoProbe`],
    /// never as rejections, so one bad frame cannot end the scan.
    pub fn submit_capture(
        &mut self,
        capture: Result<Embedding, ExtractionError>,
    ) -> Result<ProbeOutcome, SessionError> {
        self.expect_active("submit a capture")?;
        let probe = match capture {
            Ok(probe) => probe,
            Err(err) => {
                self.stats.extraction_failures += 1;
                tracing::warn!(error = %err, "no probe this cycle");
                return Ok(ProbeOutcome::NoProbe);
            }
        };
        match self.submit_probe(&probe) {
            Err(SessionError::Vector(err)) if err.origin() == VectorOrigin::Probe => {
                self.stats.invalid_captures += 1;
                tracing::warn!(error = %err, "discarding unusable capture");
                Ok(ProbeOutcome::NoProbe)
            }
            other => other,
        }
    }

    /// Finish the scan and hand back everything accepted.
    pub fn close(&mut self) -> Result<ScanReport, SessionError> {
        self.expect_active("close")?;
        self.state = SessionState::Closed;

        let gallery = self.gallery.take();
        let accepted = std::mem::take(&mut self.accumulator);
        let scores = accepted.iter().map(|(id, (_, score))| (*id, *score)).collect();
        let attendance: BTreeMap<_, _> =
            accepted.into_iter().map(|(id, (at, _))| (id, at)).collect();
        let (scope, absent, unenrolled) = match gallery {
            Some(g) => {
                let absent = g
                    .members()
                    .iter()
                    .filter(|id| !attendance.contains_key(id))
                    .copied()
                    .collect();
                (g.scope().clone(), absent, g.unenrolled().to_vec())
            }
            None => (Scope(String::new()), Vec::new(), Vec::new()),
        };

        tracing::info!(
            scope = %scope,
            present = attendance.len(),
            absent = absent.len(),
            probes = self.stats.probes,
            "scan session closed"
        );

        Ok(ScanReport {
            scope,
            attendance,
            scores,
            absent,
            unenrolled,
            stats: self.stats,
        })
    }

    fn expect_idle(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => Ok(()),
            state => Err(SessionError::InvalidState {
                state,
                operation: "start",
            }),
        }
    }

    fn expect_active(&self, operation: &'static str) -> Result<(), SessionError> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::Closed => Err(SessionError::SessionClosed),
            state => Err(SessionError::InvalidState { state, operation }),
        }
    }
}
